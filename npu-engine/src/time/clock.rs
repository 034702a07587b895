// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! This module represents a clock during a simulation.
//!
//! Time is counted in whole ticks of the clock.

use core::cmp::Ordering;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// State representing a clock.
#[derive(Clone)]
pub struct Clock {
    /// Frequency of the clock in MHz.
    /// *Note*: Should never be changed as it is registered at this frequency.
    freq_mhz: f64,

    pub(crate) shared_state: Rc<ClockState>,
}

/// Shared state between futures using a Clock and the Clock itself.
pub(crate) struct ClockState {
    now: Cell<u64>,

    /// Queue of futures waiting for the right time.
    waiting: RefCell<Vec<Vec<Waker>>>,

    /// Queue of ticks at which those futures are to be woken. This is kept
    /// sorted in reverse so that the last entry is the next to be woken.
    waiting_times: RefCell<Vec<u64>>,
}

impl ClockState {
    fn schedule(&self, schedule_time: u64, cx: &mut Context<'_>) {
        let mut waiting_times = self.waiting_times.borrow_mut();
        let mut waiting = self.waiting.borrow_mut();
        if let Some(index) = waiting_times.iter().position(|&x| x == schedule_time) {
            waiting[index].push(cx.waker().clone());
        } else {
            match waiting_times.iter().position(|x| *x < schedule_time) {
                Some(index) => {
                    waiting_times.insert(index, schedule_time);
                    waiting.insert(index, vec![cx.waker().clone()]);
                }
                None => {
                    waiting_times.push(schedule_time);
                    waiting.push(vec![cx.waker().clone()]);
                }
            };
        }
    }

    /// Remove the next scheduled tick, move the clock to it and return the
    /// tasks waiting for it.
    pub(crate) fn pop_next(&self) -> Option<(u64, Vec<Waker>)> {
        let tick = self.waiting_times.borrow_mut().pop()?;
        let wakers = self.waiting.borrow_mut().pop().unwrap_or_default();
        if tick > self.now.get() {
            self.now.set(tick);
        }
        Some((tick, wakers))
    }
}

impl Clock {
    /// Create a new [Clock] at the specified frequency.
    #[must_use]
    pub fn new(freq_mhz: f64) -> Self {
        let shared_state = Rc::new(ClockState {
            now: Cell::new(0),
            waiting: RefCell::new(Vec::new()),
            waiting_times: RefCell::new(Vec::new()),
        });

        Self {
            freq_mhz,
            shared_state,
        }
    }

    /// Returns the clocks frequency in MHz.
    #[must_use]
    pub fn freq_mhz(&self) -> f64 {
        self.freq_mhz
    }

    /// Returns the current tick.
    #[must_use]
    pub fn tick_now(&self) -> u64 {
        self.shared_state.now.get()
    }

    /// Returns the current time in `ns`.
    #[must_use]
    pub fn time_now_ns(&self) -> f64 {
        self.to_ns(self.tick_now())
    }

    /// Returns the time in `ns` of the next event registered with this clock.
    #[must_use]
    pub fn time_of_next(&self) -> f64 {
        match self.shared_state.waiting_times.borrow().last() {
            Some(tick) => self.to_ns(*tick),
            None => f64::MAX,
        }
    }

    /// Convert the given tick to a time in `ns` for this clock.
    #[must_use]
    pub fn to_ns(&self, tick: u64) -> f64 {
        tick as f64 / self.freq_mhz * 1000.0
    }

    /// Returns a [ClockDelay] future which must be `await`ed to delay the
    /// specified number of ticks.
    ///
    /// A delay of zero ticks completes on its first poll.
    #[must_use = "Futures do nothing unless you `.await` or otherwise use them"]
    pub fn wait_ticks(&self, ticks: u64) -> ClockDelay {
        ClockDelay {
            shared_state: self.shared_state.clone(),
            until: self.tick_now().saturating_add(ticks),
            scheduled: false,
        }
    }
}

/// The default clock runs at 1kHz so that one tick is one millisecond.
impl Default for Clock {
    fn default() -> Self {
        Self::new(0.001)
    }
}

/// The comparison operators for Clocks - use the next pending Waker time.
impl PartialEq for Clock {
    fn eq(&self, other: &Self) -> bool {
        self.time_of_next() == other.time_of_next()
    }
}
impl Eq for Clock {}

impl Ord for Clock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time_of_next().total_cmp(&other.time_of_next())
    }
}

impl PartialOrd for Clock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Future returned by the clock to manage advancing time using async functions.
///
/// It completes once the clock has reached the target tick, so being polled
/// early (for example by a wake meant for another future in the same task)
/// is harmless.
pub struct ClockDelay {
    shared_state: Rc<ClockState>,
    until: u64,
    scheduled: bool,
}

impl Future for ClockDelay {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.shared_state.now.get() >= self.until {
            return Poll::Ready(());
        }
        if !self.scheduled {
            self.shared_state.schedule(self.until, cx);
            self.scheduled = true;
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_to_ns() {
        let clk_ghz = Clock::new(1000.0);
        assert_eq!(1.0, clk_ghz.to_ns(1));

        let clk_khz = Clock::default();
        assert_eq!(1_000_000.0, clk_khz.to_ns(1));
    }

    #[test]
    fn pop_in_time_order() {
        let clock = Clock::default();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        for ticks in [30, 10, 20, 10] {
            let mut delay = clock.wait_ticks(ticks);
            assert!(Pin::new(&mut delay).poll(&mut cx).is_pending());
        }

        let order: Vec<(u64, usize)> = std::iter::from_fn(|| clock.shared_state.pop_next())
            .map(|(tick, wakers)| (tick, wakers.len()))
            .collect();
        assert_eq!(order, vec![(10, 2), (20, 1), (30, 1)]);
        assert_eq!(clock.tick_now(), 30);
    }
}
