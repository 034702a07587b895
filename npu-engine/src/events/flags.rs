// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A set of up to 32 event bits.
//!
//! Bits are set by notifiers and consumed by a waiter: [`EventFlags::wait_any`]
//! completes as soon as any bit in its mask is set, returns the matching bits
//! and clears them.

use std::cell::{Cell, RefCell};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::Future;

struct FlagsState {
    bits: Cell<u32>,
    waiting: RefCell<Vec<Waker>>,
}

#[derive(Clone)]
pub struct EventFlags {
    state: Rc<FlagsState>,
}

impl EventFlags {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(FlagsState {
                bits: Cell::new(0),
                waiting: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Set the bits in `mask` and wake all waiters.
    pub fn set(&self, mask: u32) {
        self.state.bits.set(self.state.bits.get() | mask);
        for waker in self.state.waiting.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    pub fn clear(&self, mask: u32) {
        self.state.bits.set(self.state.bits.get() & !mask);
    }

    #[must_use]
    pub fn get(&self) -> u32 {
        self.state.bits.get()
    }

    /// Wait for any bit of `mask` to be set.
    #[must_use = "Futures do nothing unless you `.await` or otherwise use them"]
    pub fn wait_any(&self, mask: u32) -> FlagsFuture {
        FlagsFuture {
            state: self.state.clone(),
            mask,
        }
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FlagsFuture {
    state: Rc<FlagsState>,
    mask: u32,
}

impl Future for FlagsFuture {
    type Output = u32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let matched = self.state.bits.get() & self.mask;
        if matched != 0 {
            self.state.bits.set(self.state.bits.get() & !matched);
            Poll::Ready(matched)
        } else {
            self.state.waiting.borrow_mut().push(cx.waker().clone());
            Poll::Pending
        }
    }
}
