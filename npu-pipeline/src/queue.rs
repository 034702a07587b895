// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A bounded message queue with timeouts and two insertion priorities.
//!
//! Items are kept in FIFO order within a priority, and a `preempt` item is
//! placed ahead of every normal item already queued. Producers that find
//! the queue full wait their turn in a line of their own: a preempting
//! producer joins that line ahead of all normal producers, so it is served
//! before any of them once space appears.
//!
//! A put that fails hands the item back, so no item is ever lost.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use npu_engine::events::repeated::Repeated;
use npu_engine::time::clock::Clock;
use npu_engine::time::timeout::{Timeout, with_timeout};
use npu_engine::traits::Event;
use npu_track::entity::Entity;
use npu_track::value;

use crate::error::{QueueError, Rejected};

pub struct BoundedQueue<T> {
    pub entity: Rc<Entity>,
    capacity: usize,
    items: RefCell<VecDeque<(bool, T)>>,
    space_waiters: RefCell<VecDeque<(u64, bool)>>,
    next_ticket: Cell<u64>,
    changed: Repeated<()>,
}

/// A producer's place in the line of producers waiting for space.
struct SpaceTicket<'a, T> {
    queue: &'a BoundedQueue<T>,
    ticket: u64,
}

impl<T> SpaceTicket<'_, T> {
    async fn wait_turn(&self) {
        loop {
            if self.queue.has_turn(self.ticket) {
                return;
            }
            self.queue.changed.listen().await;
        }
    }
}

impl<T> Drop for SpaceTicket<'_, T> {
    fn drop(&mut self) {
        self.queue
            .space_waiters
            .borrow_mut()
            .retain(|(ticket, _)| *ticket != self.ticket);
        self.queue.changed.notify();
    }
}

/// The error to report when a wait for `timeout` did not succeed.
fn expired(timeout: Timeout) -> QueueError {
    match timeout {
        Timeout::Immediate => QueueError::ResourceExhausted,
        _ => QueueError::Timeout,
    }
}

impl<T> BoundedQueue<T> {
    #[must_use]
    pub fn new(parent: &Rc<Entity>, name: &str, capacity: usize) -> Self {
        Self {
            entity: Rc::new(Entity::new(parent, name)),
            capacity,
            items: RefCell::new(VecDeque::with_capacity(capacity)),
            space_waiters: RefCell::new(VecDeque::new()),
            next_ticket: Cell::new(0),
            changed: Repeated::default(),
        }
    }

    /// Create a queue that starts out holding `items`. The capacity grows to
    /// fit them if needed.
    #[must_use]
    pub fn with_items(parent: &Rc<Entity>, name: &str, capacity: usize, items: Vec<T>) -> Self {
        let queue = Self::new(parent, name, capacity.max(items.len()));
        queue
            .items
            .borrow_mut()
            .extend(items.into_iter().map(|item| (false, item)));
        queue
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Number of producers currently waiting for space.
    #[must_use]
    pub fn waiting_producers(&self) -> usize {
        self.space_waiters.borrow().len()
    }

    /// Fold over the queued items from head to tail.
    pub fn fold<B>(&self, init: B, mut f: impl FnMut(B, &T) -> B) -> B {
        self.items
            .borrow()
            .iter()
            .fold(init, |acc, (_, item)| f(acc, item))
    }

    /// Put `item` into the queue, waiting up to `timeout` for space.
    ///
    /// An [`Immediate`](Timeout::Immediate) put into a full queue fails with
    /// [`QueueError::ResourceExhausted`]; any other expired wait fails with
    /// [`QueueError::Timeout`].
    pub async fn put(
        &self,
        clock: &Clock,
        item: T,
        timeout: Timeout,
        preempt: bool,
    ) -> Result<(), Rejected<T>> {
        let ticket = self.join_space_waiters(preempt);
        if with_timeout(clock, timeout, ticket.wait_turn())
            .await
            .is_none()
        {
            return Err(Rejected::new(item, expired(timeout)));
        }
        self.push(item, preempt);
        drop(ticket);
        Ok(())
    }

    /// Put `item` without waiting.
    pub fn try_put(&self, item: T, preempt: bool) -> Result<(), Rejected<T>> {
        if self.is_full() || !self.space_waiters.borrow().is_empty() {
            return Err(Rejected::new(item, QueueError::ResourceExhausted));
        }
        self.push(item, preempt);
        Ok(())
    }

    /// Take the item at the head of the queue, waiting up to `timeout` for
    /// one to arrive.
    pub async fn get(&self, clock: &Clock, timeout: Timeout) -> Result<T, QueueError> {
        let next = async {
            loop {
                if let Some(item) = self.try_get() {
                    return item;
                }
                self.changed.listen().await;
            }
        };
        with_timeout(clock, timeout, next)
            .await
            .ok_or(expired(timeout))
    }

    /// Take the item at the head of the queue if there is one.
    pub fn try_get(&self) -> Option<T> {
        let item = self.items.borrow_mut().pop_front().map(|(_, item)| item);
        if item.is_some() {
            value!(self.entity ; self.len());
            self.changed.notify();
        }
        item
    }

    fn join_space_waiters(&self, preempt: bool) -> SpaceTicket<'_, T> {
        let ticket = self.next_ticket.get();
        self.next_ticket.set(ticket + 1);

        let mut waiters = self.space_waiters.borrow_mut();
        let position = if preempt {
            waiters
                .iter()
                .position(|(_, waiter_preempt)| !waiter_preempt)
                .unwrap_or(waiters.len())
        } else {
            waiters.len()
        };
        waiters.insert(position, (ticket, preempt));

        SpaceTicket {
            queue: self,
            ticket,
        }
    }

    fn has_turn(&self, ticket: u64) -> bool {
        !self.is_full()
            && self
                .space_waiters
                .borrow()
                .front()
                .is_some_and(|(first, _)| *first == ticket)
    }

    fn push(&self, item: T, preempt: bool) {
        {
            let mut items = self.items.borrow_mut();
            if preempt {
                let position = items
                    .iter()
                    .position(|(item_preempt, _)| !item_preempt)
                    .unwrap_or(items.len());
                items.insert(position, (true, item));
            } else {
                items.push_back((false, item));
            }
        }
        value!(self.entity ; self.len());
        self.changed.notify();
    }
}

#[cfg(test)]
mod tests {
    use npu_track::tracker::dev_null_tracker;

    use super::*;

    fn queue(capacity: usize) -> BoundedQueue<u32> {
        let tracker = dev_null_tracker();
        let top = npu_track::entity::toplevel(&tracker, "top");
        BoundedQueue::new(&top, "queue", capacity)
    }

    #[test]
    fn preempt_items_go_ahead_of_normal_items() {
        let q = queue(4);
        q.try_put(1, false).unwrap();
        q.try_put(2, false).unwrap();
        q.try_put(3, true).unwrap();
        q.try_put(4, true).unwrap();
        let order: Vec<u32> = std::iter::from_fn(|| q.try_get()).collect();
        assert_eq!(order, vec![3, 4, 1, 2]);
    }

    #[test]
    fn try_put_into_full_queue_returns_item() {
        let q = queue(1);
        q.try_put(1, false).unwrap();
        let rejected = q.try_put(2, false).unwrap_err();
        assert_eq!(rejected.item, 2);
        assert_eq!(rejected.error, QueueError::ResourceExhausted);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn preempting_producer_joins_ahead_of_normal_producers() {
        let q = queue(1);
        let a = q.join_space_waiters(false);
        let b = q.join_space_waiters(false);
        let c = q.join_space_waiters(true);
        let line: Vec<u64> = q.space_waiters.borrow().iter().map(|(t, _)| *t).collect();
        assert_eq!(line, vec![c.ticket, a.ticket, b.ticket]);
        drop(c);
        assert!(q.has_turn(a.ticket));
        drop(a);
        drop(b);
        assert_eq!(q.waiting_producers(), 0);
    }
}
