// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Bound how long an asynchronous operation may wait.

use std::fmt;
use std::future::Future;
use std::pin::pin;

use futures::future::{Either, select};

use crate::time::clock::Clock;

/// How long a blocking operation may wait before giving up.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    /// Do not wait at all: succeed only if the operation can complete now.
    Immediate,

    /// Wait up to the given number of clock ticks.
    Ticks(u64),

    /// Wait as long as it takes.
    #[default]
    Forever,
}

impl Timeout {
    /// Build a timeout from a wire value in milliseconds where `0` means
    /// no waiting and `u32::MAX` means forever.
    #[must_use]
    pub fn from_millis(ms: u32) -> Self {
        match ms {
            0 => Timeout::Immediate,
            u32::MAX => Timeout::Forever,
            ms => Timeout::Ticks(u64::from(ms)),
        }
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Immediate => write!(f, "immediate"),
            Timeout::Ticks(ticks) => write!(f, "{ticks} ticks"),
            Timeout::Forever => write!(f, "forever"),
        }
    }
}

/// Run `op` until it completes or `timeout` expires on `clock`.
///
/// The operation is always polled at least once, so an [`Immediate`]
/// timeout succeeds whenever the operation can complete without waiting.
/// Returns `None` on expiry, at which point `op` has been dropped.
///
/// [`Immediate`]: Timeout::Immediate
pub async fn with_timeout<F: Future>(clock: &Clock, timeout: Timeout, op: F) -> Option<F::Output> {
    let ticks = match timeout {
        Timeout::Forever => return Some(op.await),
        Timeout::Immediate => 0,
        Timeout::Ticks(ticks) => ticks,
    };

    let op = pin!(op);
    match select(op, clock.wait_ticks(ticks)).await {
        Either::Left((value, _)) => Some(value),
        Either::Right(((), _)) => None,
    }
}
