// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! An event that can be notified any number of times.
//!
//! A listener completes on the first notification after it was created;
//! notifications that happened earlier are not seen. The pipeline uses a
//! `Repeated<()>` as a "something changed, look again" signal for queues,
//! the link and the result ring.

use std::cell::{Cell, RefCell};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::Future;

use crate::traits::{BoxFuture, Event};

struct Shared<T: Copy> {
    generation: Cell<u64>,
    value: Cell<T>,
    waiting: RefCell<Vec<Waker>>,
}

#[derive(Clone)]
pub struct Repeated<T: Copy> {
    shared: Rc<Shared<T>>,
}

impl<T: Copy> Repeated<T> {
    pub fn new(value: T) -> Self {
        Self {
            shared: Rc::new(Shared {
                generation: Cell::new(0),
                value: Cell::new(value),
                waiting: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Wake current listeners with the last value.
    pub fn notify(&self) {
        let shared = &self.shared;
        shared.generation.set(shared.generation.get().wrapping_add(1));
        for waker in shared.waiting.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    /// Wake current listeners with `value`.
    pub fn notify_result(&self, value: T) {
        self.shared.value.set(value);
        self.notify();
    }
}

impl Default for Repeated<()> {
    fn default() -> Self {
        Self::new(())
    }
}

impl<T: Copy + 'static> Event<T> for Repeated<T> {
    fn listen(&self) -> BoxFuture<'static, T> {
        Box::pin(RepeatedFuture {
            started_at: self.shared.generation.get(),
            shared: self.shared.clone(),
        })
    }
}

struct RepeatedFuture<T: Copy> {
    shared: Rc<Shared<T>>,
    started_at: u64,
}

impl<T: Copy> Future for RepeatedFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.shared.generation.get() == self.started_at {
            self.shared.waiting.borrow_mut().push(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(self.shared.value.get())
    }
}
