// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A fixed set of buffers circulating between two queues.
//!
//! Every buffer of a [`BufferPool`] is either on the `free` queue, on the
//! `data` queue (as part of an entry) or held by exactly one user. Buffers
//! are allocated once when the pool is created and never freed while it
//! exists.
//!
//! A producer takes a buffer from `free`, fills it and enqueues it on
//! `data`; the consumer dequeues it, uses it and puts it back on `free`.
//! Under overload a producer may *force grab*: when `free` is empty it
//! takes the oldest entry from `data` instead, dropping that job.

use std::rc::Rc;

use npu_engine::time::clock::Clock;
use npu_engine::time::timeout::Timeout;
use npu_track::entity::Entity;
use npu_track::{create_and_track_id, debug, enter, error, exit, trace};

use crate::buffer::{Buffer, PoolEntry, PoolTag};
use crate::error::{QueueError, Rejected};
use crate::queue::BoundedQueue;

pub struct BufferPool<D>
where
    D: PoolEntry,
{
    pub entity: Rc<Entity>,
    clock: Clock,
    tag: PoolTag,
    buffer_size: usize,
    count: usize,
    free: BoundedQueue<Buffer>,
    data: BoundedQueue<D>,
}

impl<D> BufferPool<D>
where
    D: PoolEntry,
{
    /// Create a pool of `count` buffers of `buffer_size` bytes, all of them
    /// on the free queue.
    #[must_use]
    pub fn new(
        clock: &Clock,
        parent: &Rc<Entity>,
        name: &str,
        count: usize,
        buffer_size: usize,
    ) -> Self {
        let entity = Rc::new(Entity::new(parent, name));
        let tag = PoolTag(entity.id);

        let buffers = (0..count)
            .map(|_| {
                let id = create_and_track_id!(entity ; "buffer", buffer_size);
                Buffer::new(id, tag, buffer_size)
            })
            .collect();
        let free = BoundedQueue::with_items(&entity, "free", count, buffers);
        let data = BoundedQueue::new(&entity, "data", count);

        debug!(entity ; "allocated {count} buffers of {buffer_size} bytes");

        Self {
            entity,
            clock: clock.clone(),
            tag,
            buffer_size,
            count,
            free,
            data,
        }
    }

    #[must_use]
    pub fn tag(&self) -> PoolTag {
        self.tag
    }

    /// Number of buffers owned by the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of entries waiting on the data queue.
    #[must_use]
    pub fn data_count(&self) -> usize {
        self.data.len()
    }

    /// Number of buffers sitting on either queue.
    #[must_use]
    pub fn queued_buffers(&self) -> usize {
        self.free.len() + self.data.fold(0, |n, entry| n + entry.buffers().len())
    }

    /// Take a free buffer, waiting up to `timeout`.
    ///
    /// With `force_grab` the wait is always zero: when no buffer is free the
    /// oldest entry on the data queue is dropped and its first buffer
    /// returned (any other buffers of that entry go back on the free queue).
    pub async fn get_free(&self, timeout: Timeout, force_grab: bool) -> Result<Buffer, QueueError> {
        let timeout = if force_grab {
            Timeout::Immediate
        } else {
            timeout
        };

        match self.free.get(&self.clock, timeout).await {
            Ok(buffer) => {
                exit!(self.entity ; buffer.id());
                Ok(buffer)
            }
            Err(QueueError::ResourceExhausted) if force_grab => {
                let entry = self
                    .data
                    .try_get()
                    .ok_or(QueueError::ResourceExhausted)?;
                debug!(self.entity ; "force grab drops job {}", entry.id());

                let mut buffers = entry.into_buffers().into_iter();
                let first = buffers.next().ok_or(QueueError::ResourceExhausted)?;
                for extra in buffers {
                    self.recycle(extra);
                }
                exit!(self.entity ; first.id());
                Ok(first)
            }
            Err(e) => Err(e),
        }
    }

    /// Return a buffer to the free queue.
    pub async fn put_free(&self, mut buffer: Buffer, timeout: Timeout) -> Result<(), Rejected<Buffer>> {
        if buffer.pool() != self.tag {
            return Err(Rejected::new(buffer, QueueError::InvalidParameter));
        }
        buffer.clear();
        let id = buffer.id();
        self.free.put(&self.clock, buffer, timeout, false).await?;
        enter!(self.entity ; id);
        Ok(())
    }

    /// Add an entry to the data queue, waiting up to `timeout` for space.
    pub async fn enqueue_data(&self, entry: D, timeout: Timeout, preempt: bool) -> Result<(), Rejected<D>> {
        if entry.buffers().iter().any(|b| b.pool() != self.tag) {
            return Err(Rejected::new(entry, QueueError::InvalidParameter));
        }
        let id = entry.id();
        self.data.put(&self.clock, entry, timeout, preempt).await?;
        trace!(self.entity ; "data {id} queued{}", if preempt { " (preempt)" } else { "" });
        Ok(())
    }

    /// Take the oldest entry from the data queue, waiting up to `timeout`.
    pub async fn dequeue_data(&self, timeout: Timeout) -> Result<D, QueueError> {
        let entry = self.data.get(&self.clock, timeout).await?;
        trace!(self.entity ; "data {} dequeued", entry.id());
        Ok(entry)
    }

    /// Move every entry on the data queue back to the free queue. Returns
    /// the number of entries discarded.
    pub fn clean(&self) -> usize {
        let mut discarded = 0;
        while let Some(entry) = self.data.try_get() {
            discarded += 1;
            for buffer in entry.into_buffers() {
                self.recycle(buffer);
            }
        }
        if discarded > 0 {
            debug!(self.entity ; "discarded {discarded} queued entries");
        }
        discarded
    }

    /// Put a buffer straight back on the free queue without waiting.
    pub fn recycle(&self, mut buffer: Buffer) {
        if buffer.pool() != self.tag {
            error!(self.entity ; "buffer {} does not belong to this pool", buffer.id());
            return;
        }
        buffer.clear();
        let id = buffer.id();
        match self.free.try_put(buffer, false) {
            Ok(()) => {
                enter!(self.entity ; id);
            }
            Err(rejected) => {
                error!(self.entity ; "unable to recycle buffer {}: {}", id, rejected.error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use npu_engine::engine::Engine;
    use npu_engine::run_simulation;
    use npu_track::tracker::dev_null_tracker;

    use super::*;
    use crate::buffer::BufferObject;

    #[test]
    fn all_buffers_start_free() {
        let engine = Engine::new(&dev_null_tracker());
        let pool: BufferPool<Buffer> =
            BufferPool::new(&engine.default_clock(), engine.top(), "pool", 3, 64);
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.data_count(), 0);
        assert_eq!(pool.queued_buffers(), 3);
        assert_eq!(pool.buffer_size(), 64);
    }

    #[test]
    fn buffers_are_conserved_in_fifo_order() {
        let mut engine = Engine::new(&dev_null_tracker());
        let pool: Rc<BufferPool<Buffer>> =
            Rc::new(BufferPool::new(&engine.default_clock(), engine.top(), "pool", 3, 16));

        engine.spawn(async move {
            let mut ids = Vec::new();
            for held in 1..=3 {
                let buffer = pool.get_free(Timeout::Immediate, false).await?;
                ids.push(buffer.id());
                assert_eq!(pool.queued_buffers() + held, 3);
                pool.enqueue_data(buffer, Timeout::Immediate, false)
                    .await
                    .map_err(|r| r.error)?;
                assert_eq!(pool.queued_buffers(), 3);
            }
            assert_eq!(
                pool.get_free(Timeout::Ticks(5), false).await.unwrap_err(),
                QueueError::Timeout
            );

            for id in ids {
                let buffer = pool.dequeue_data(Timeout::Immediate).await?;
                assert_eq!(buffer.id(), id);
                pool.put_free(buffer, Timeout::Immediate).await.map_err(|r| r.error)?;
            }
            assert_eq!(pool.free_count(), 3);
            assert_eq!(pool.data_count(), 0);
            Ok(())
        });
        run_simulation!(engine);
    }

    #[test]
    fn foreign_buffers_are_rejected() {
        let mut engine = Engine::new(&dev_null_tracker());
        let clock = engine.default_clock();
        let a: Rc<BufferPool<Buffer>> = Rc::new(BufferPool::new(&clock, engine.top(), "a", 1, 8));
        let b: Rc<BufferPool<Buffer>> = Rc::new(BufferPool::new(&clock, engine.top(), "b", 1, 8));

        engine.spawn(async move {
            let buffer = a.get_free(Timeout::Immediate, false).await?;
            let rejected = b.put_free(buffer, Timeout::Immediate).await.unwrap_err();
            assert_eq!(rejected.error, QueueError::InvalidParameter);
            let rejected = b.enqueue_data(rejected.item, Timeout::Immediate, false).await.unwrap_err();
            a.put_free(rejected.item, Timeout::Immediate).await.map_err(|r| r.error)?;
            assert_eq!(a.free_count(), 1);
            Ok(())
        });
        run_simulation!(engine);
    }

    #[test]
    fn force_grab_recycles_extra_buffers() {
        let mut engine = Engine::new(&dev_null_tracker());
        let clock = engine.default_clock();
        let pool: Rc<BufferPool<BufferObject>> =
            Rc::new(BufferPool::new(&clock, engine.top(), "pool", 2, 8));

        engine.spawn(async move {
            let first = pool.get_free(Timeout::Immediate, false).await?;
            let second = pool.get_free(Timeout::Immediate, false).await?;
            let first_id = first.id();
            let job = BufferObject::new(vec![first, second]);
            pool.enqueue_data(job, Timeout::Immediate, false).await.map_err(|r| r.error)?;

            let grabbed = pool.get_free(Timeout::Forever, true).await?;
            assert_eq!(grabbed.id(), first_id);
            assert_eq!(pool.free_count(), 1);
            assert_eq!(pool.data_count(), 0);
            Ok(())
        });
        run_simulation!(engine);
    }
}
