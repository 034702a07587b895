// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The FIFO queue manager.
//!
//! It owns two [`BufferPool`]s: the *image* pool carrying inference input
//! from the receive loop to the dispatcher, and the *result* pool carrying
//! results from the dispatcher to the send loop.
//!
//! A job may need several input buffers (one per model input tensor). The
//! receive loop hands them over one at a time with
//! [`image_enqueue`](FifoQueueManager::image_enqueue); they wait on a
//! staging queue until the manager's aggregation task has collected every
//! index of the job, and only then does the complete [`BufferObject`] appear
//! on the image data queue.
//!
//! The pools do not exist until the host configures them. Configuration is
//! write-once: a second request is reported as already configured and
//! changes nothing.

use std::cell::{Cell, OnceCell};
use std::rc::Rc;

use async_trait::async_trait;
use npu_engine::engine::Engine;
use npu_engine::events::once::Once;
use npu_engine::time::clock::Clock;
use npu_engine::time::timeout::Timeout;
use npu_engine::traits::{Event, Runnable};
use npu_engine::types::SimResult;
use npu_track::entity::Entity;
use npu_track::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, BufferObject, MAX_BUFFERS_PER_OBJECT, PoolEntry};
use crate::buffer_pool::BufferPool;
use crate::error::{QueueError, Rejected};
use crate::queue::BoundedQueue;

/// Unit of the buffer size in a queue configuration word.
pub const QUEUE_SIZE_UNIT: usize = 10 * 1024;

/// Buffer counts and sizes of the two pools.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoqConfig {
    pub image_count: usize,
    pub image_size: usize,
    pub result_count: usize,
    pub result_size: usize,
}

impl FifoqConfig {
    /// Decode the two 16-bit words of a queue configuration request: `value`
    /// describes the image pool and `index` the result pool.
    #[must_use]
    pub fn from_control_words(value: u16, index: u16) -> Self {
        let (image_count, image_size) = decode_queue_word(value);
        let (result_count, result_size) = decode_queue_word(index);
        Self {
            image_count,
            image_size,
            result_count,
            result_size,
        }
    }
}

/// Decode one queue configuration word into `(count, size)`.
///
/// The low 3 bits hold `count - 1` and the remaining 13 bits hold
/// `size / 10KiB - 1`.
#[must_use]
pub fn decode_queue_word(word: u16) -> (usize, usize) {
    let count = usize::from(word & 0x7) + 1;
    let size = QUEUE_SIZE_UNIT * (usize::from(word >> 3) + 1);
    (count, size)
}

/// Encode `(count, size)` as a queue configuration word. Returns `None` when
/// the values cannot be represented.
#[must_use]
pub fn encode_queue_word(count: usize, size: usize) -> Option<u16> {
    if !(1..=8).contains(&count) || size == 0 || size % QUEUE_SIZE_UNIT != 0 {
        return None;
    }
    let units = size / QUEUE_SIZE_UNIT - 1;
    if units >= 1 << 13 {
        return None;
    }
    Some(((units << 3) | (count - 1)) as u16)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigureOutcome {
    Allocated,
    AlreadyConfigured,
}

/// Occupancy of the queues.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FifoqStatus {
    pub image_free: usize,
    pub image_data: usize,
    pub image_staged: usize,
    pub result_free: usize,
    pub result_data: usize,
}

/// One buffer of a job on its way to the aggregation task.
struct Fragment {
    total: usize,
    index: usize,
    buffer: Buffer,
}

struct Queues {
    config: FifoqConfig,
    image: BufferPool<BufferObject>,
    result: BufferPool<Buffer>,
    staging: BoundedQueue<Fragment>,
}

pub struct FifoQueueManager {
    pub entity: Rc<Entity>,
    clock: Clock,
    queues: OnceCell<Queues>,
    allocated: Once<FifoqConfig>,
    clean_generation: Cell<u64>,
}

impl FifoQueueManager {
    pub fn new_and_register(engine: &Engine, clock: &Clock, parent: &Rc<Entity>) -> Rc<Self> {
        let rc_self = Rc::new(Self {
            entity: Rc::new(Entity::new(parent, "fifoq")),
            clock: clock.clone(),
            queues: OnceCell::new(),
            allocated: Once::default(),
            clean_generation: Cell::new(0),
        });
        engine.register(rc_self.clone());
        rc_self
    }

    /// Allocate both pools. Every buffer starts on its free queue.
    pub fn configure(&self, config: FifoqConfig) -> ConfigureOutcome {
        if self.queues.get().is_some() {
            debug!(self.entity ; "queues already configured");
            return ConfigureOutcome::AlreadyConfigured;
        }

        let queues = Queues {
            config,
            image: BufferPool::new(
                &self.clock,
                &self.entity,
                "image",
                config.image_count,
                config.image_size,
            ),
            result: BufferPool::new(
                &self.clock,
                &self.entity,
                "result",
                config.result_count,
                config.result_size,
            ),
            staging: BoundedQueue::new(&self.entity, "staging", config.image_count),
        };
        if self.queues.set(queues).is_err() {
            return ConfigureOutcome::AlreadyConfigured;
        }

        info!(self.entity ; "image queue: {} x {} bytes, result queue: {} x {} bytes",
            config.image_count, config.image_size, config.result_count, config.result_size);

        if let Err(e) = self.allocated.notify(config) {
            warn!(self.entity ; "{e}");
        }
        ConfigureOutcome::Allocated
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.queues.get().is_some()
    }

    /// Wait until the queues have been configured.
    pub async fn wait_allocated(&self) -> FifoqConfig {
        self.allocated.listen().await
    }

    #[must_use]
    pub fn config(&self) -> Option<FifoqConfig> {
        self.queues.get().map(|q| q.config)
    }

    #[must_use]
    pub fn status(&self) -> Option<FifoqStatus> {
        self.queues.get().map(|q| FifoqStatus {
            image_free: q.image.free_count(),
            image_data: q.image.data_count(),
            image_staged: q.staging.len(),
            result_free: q.result.free_count(),
            result_data: q.result.data_count(),
        })
    }

    /// Number of image buffers currently on the image pool's queues or
    /// waiting for aggregation.
    #[must_use]
    pub fn image_buffers_queued(&self) -> usize {
        self.queues.get().map_or(0, |q| {
            q.image.queued_buffers() + q.staging.len()
        })
    }

    #[must_use]
    pub fn result_buffers_queued(&self) -> usize {
        self.queues.get().map_or(0, |q| q.result.queued_buffers())
    }

    fn queues(&self) -> Result<&Queues, QueueError> {
        self.queues.get().ok_or(QueueError::InvalidParameter)
    }

    /// Hand buffer `index` of a job of `total` buffers over for aggregation.
    ///
    /// A single-buffer job always uses index 0. The job appears on the image
    /// data queue once all of its indices have arrived; a second buffer for
    /// an index replaces the first, which goes back to the free queue.
    pub async fn image_enqueue(
        &self,
        total: usize,
        index: usize,
        buffer: Buffer,
        timeout: Timeout,
        preempt: bool,
    ) -> Result<(), Rejected<Buffer>> {
        let queues = match self.queues() {
            Ok(queues) => queues,
            Err(e) => return Err(Rejected::new(buffer, e)),
        };
        let index = if total == 1 { 0 } else { index };
        if total == 0
            || total > MAX_BUFFERS_PER_OBJECT
            || total > queues.config.image_count
            || index >= total
        {
            warn!(self.entity ; "invalid image index {index} of {total}");
            return Err(Rejected::new(buffer, QueueError::InvalidParameter));
        }

        trace!(self.entity ; "stage buffer {} as {index}/{total}", buffer.id());
        let fragment = Fragment {
            total,
            index,
            buffer,
        };
        queues
            .staging
            .put(&self.clock, fragment, timeout, preempt)
            .await
            .map_err(|r| Rejected::new(r.item.buffer, r.error))
    }

    pub async fn image_dequeue(&self, timeout: Timeout) -> Result<BufferObject, QueueError> {
        self.queues()?.image.dequeue_data(timeout).await
    }

    /// Take a free image buffer.
    ///
    /// When `force_grab` drops a multi-buffer job only its first buffer is
    /// returned; the others go straight back to the free queue.
    pub async fn image_get_free_buffer(&self, timeout: Timeout, force_grab: bool) -> Result<Buffer, QueueError> {
        self.queues()?.image.get_free(timeout, force_grab).await
    }

    pub async fn image_put_free_buffer(&self, buffer: Buffer, timeout: Timeout) -> Result<(), Rejected<Buffer>> {
        match self.queues() {
            Ok(queues) => queues.image.put_free(buffer, timeout).await,
            Err(e) => Err(Rejected::new(buffer, e)),
        }
    }

    /// Return every buffer of a consumed job to the image free queue.
    pub async fn image_release(&self, object: BufferObject) {
        for buffer in object.into_buffers() {
            if let Err(rejected) = self.image_put_free_buffer(buffer, Timeout::Forever).await {
                error!(self.entity ; "lost image buffer {}: {}", rejected.item.id(), rejected.error);
            }
        }
    }

    /// Queue a finished result. The result queue is never waited on.
    pub async fn result_enqueue(&self, buffer: Buffer, preempt: bool) -> Result<(), Rejected<Buffer>> {
        match self.queues() {
            Ok(queues) => {
                queues
                    .result
                    .enqueue_data(buffer, Timeout::Immediate, preempt)
                    .await
            }
            Err(e) => Err(Rejected::new(buffer, e)),
        }
    }

    pub async fn result_dequeue(&self, timeout: Timeout) -> Result<Buffer, QueueError> {
        self.queues()?.result.dequeue_data(timeout).await
    }

    pub async fn result_get_free_buffer(&self, timeout: Timeout) -> Result<Buffer, QueueError> {
        self.queues()?.result.get_free(timeout, false).await
    }

    pub async fn result_put_free_buffer(&self, buffer: Buffer, timeout: Timeout) -> Result<(), Rejected<Buffer>> {
        match self.queues() {
            Ok(queues) => queues.result.put_free(buffer, timeout).await,
            Err(e) => Err(Rejected::new(buffer, e)),
        }
    }

    /// Return a result buffer that will not be sent, logging if that fails.
    pub async fn result_release(&self, buffer: Buffer) {
        if let Err(rejected) = self.result_put_free_buffer(buffer, Timeout::Forever).await {
            error!(self.entity ; "lost result buffer {}: {}", rejected.item.id(), rejected.error);
        }
    }

    /// Discard everything queued: data entries and staged buffers of both
    /// pools go back to their free queues, and any partly collected job is
    /// abandoned.
    pub fn clean_queues(&self) {
        let Some(queues) = self.queues.get() else {
            return;
        };
        self.clean_generation.set(self.clean_generation.get() + 1);

        let mut staged = 0;
        while let Some(fragment) = queues.staging.try_get() {
            staged += 1;
            queues.image.recycle(fragment.buffer);
        }
        let images = queues.image.clean();
        let results = queues.result.clean();
        info!(self.entity ; "cleaned queues: {images} images, {staged} staged buffers, {results} results");
    }

    async fn aggregate(&self, queues: &Queues) -> SimResult {
        let mut pending: Vec<Option<Buffer>> = Vec::new();
        let mut received = 0;
        let mut generation = self.clean_generation.get();

        loop {
            let fragment = queues.staging.get(&self.clock, Timeout::Forever).await?;

            if generation != self.clean_generation.get() || pending.len() != fragment.total {
                generation = self.clean_generation.get();
                for stale in pending.drain(..).flatten() {
                    debug!(self.entity ; "abandon partial job buffer {}", stale.id());
                    queues.image.recycle(stale);
                }
                pending.resize_with(fragment.total, || None);
                received = 0;
            }

            match pending[fragment.index].replace(fragment.buffer) {
                Some(replaced) => {
                    debug!(self.entity ; "index {} received twice", fragment.index);
                    queues.image.recycle(replaced);
                }
                None => received += 1,
            }

            if received == pending.len() {
                let object = BufferObject::new(pending.drain(..).flatten().collect());
                trace!(self.entity ; "job {} complete with {} buffers", object.id(), object.len());
                if let Err(rejected) = queues
                    .image
                    .enqueue_data(object, Timeout::Forever, false)
                    .await
                {
                    error!(self.entity ; "unable to queue job: {}", rejected.error);
                    for buffer in rejected.item.into_buffers() {
                        queues.image.recycle(buffer);
                    }
                }
                received = 0;
            }
        }
    }
}

#[async_trait(?Send)]
impl Runnable for FifoQueueManager {
    async fn run(&self) -> SimResult {
        self.allocated.listen().await;
        let queues = self.queues()?;
        self.aggregate(queues).await
    }
}
