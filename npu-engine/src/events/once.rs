// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A write-once event.
//!
//! The value is supplied by the single call to [`Once::notify`]. Listeners
//! that start after the notification complete immediately with the latched
//! value, which makes a `Once` suitable for one-way state such as "the
//! queues have been configured".

use std::cell::{Cell, RefCell};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::Future;

use crate::sim_error;
use crate::traits::{BoxFuture, Event};
use crate::types::SimResult;

struct Latch<T: Copy> {
    value: Cell<Option<T>>,
    waiting: RefCell<Vec<Waker>>,
}

#[derive(Clone)]
pub struct Once<T: Copy> {
    latch: Rc<Latch<T>>,
}

impl<T: Copy> Once<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            latch: Rc::new(Latch {
                value: Cell::new(None),
                waiting: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Latch `value` and wake every listener. A second notification is an
    /// error and leaves the first value in place.
    pub fn notify(&self, value: T) -> SimResult {
        if self.latch.value.get().is_some() {
            return sim_error!("once event already notified");
        }
        self.latch.value.set(Some(value));
        for waker in self.latch.waiting.borrow_mut().drain(..) {
            waker.wake();
        }
        Ok(())
    }

    /// The latched value, if notified.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.latch.value.get()
    }

    #[must_use]
    pub fn is_notified(&self) -> bool {
        self.value().is_some()
    }
}

impl<T: Copy> Default for Once<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + 'static> Event<T> for Once<T> {
    fn listen(&self) -> BoxFuture<'static, T> {
        Box::pin(OnceFuture {
            latch: self.latch.clone(),
        })
    }
}

struct OnceFuture<T: Copy> {
    latch: Rc<Latch<T>>,
}

impl<T: Copy> Future for OnceFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.latch.value.get() {
            Some(value) => Poll::Ready(value),
            None => {
                self.latch.waiting.borrow_mut().push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
