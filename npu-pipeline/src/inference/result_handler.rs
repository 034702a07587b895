// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Resolution of parallel runs.
//!
//! A parallel run occupies one slot of a fixed ring. The slot's completion
//! flag is bit `1 << index` of the accelerator's flags. The
//! [`ResultHandler`] visits the slots in dispatch order, waits for each flag
//! and sends the run's [`Outcome`] to whoever dispatched it.
//!
//! A missed completion is only fatal for a slot once it has been seen a
//! number of times in a row while work is outstanding; see
//! [`TimeoutDebounce`]. The handler only waits on occupied slots, so every
//! timeout it observes has work outstanding and it never sees
//! [`Verdict::Ignore`]. An idle ring is not debounced at runtime; the
//! handler simply waits for the next dispatch.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use async_trait::async_trait;
use futures::channel::oneshot;
use npu_engine::engine::Engine;
use npu_engine::events::repeated::Repeated;
use npu_engine::time::timeout::with_timeout;
use npu_engine::traits::{Event, Runnable};
use npu_engine::types::SimResult;
use npu_track::entity::Entity;
use npu_track::{debug, error, trace, warn};

use crate::accelerator::{Accelerator, Outcome, RunStatus};
use crate::context::PipelineContext;

/// What to make of a wait on a slot that timed out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing is outstanding; the accelerator is simply idle.
    Ignore,

    /// Work is outstanding but the threshold has not been reached yet.
    Strike,

    /// The slot's run is considered lost.
    Fail,
}

/// Counts consecutive timeouts observed while work is outstanding.
#[derive(Debug)]
pub struct TimeoutDebounce {
    strikes: u32,
    threshold: u32,
}

impl TimeoutDebounce {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            strikes: 0,
            threshold: threshold.max(1),
        }
    }

    /// Account for one timed out wait given the number of runs `issued`
    /// and `completed` so far.
    pub fn observe_timeout(&mut self, issued: u64, completed: u64) -> Verdict {
        if issued <= completed {
            return Verdict::Ignore;
        }
        self.strikes += 1;
        if self.strikes >= self.threshold {
            self.strikes = 0;
            Verdict::Fail
        } else {
            Verdict::Strike
        }
    }

    /// A completion arrived.
    pub fn reset(&mut self) {
        self.strikes = 0;
    }

    #[must_use]
    pub fn strikes(&self) -> u32 {
        self.strikes
    }
}

/// A run waiting in a slot.
pub struct InFlight {
    pub sequence: u64,
    pub reply: oneshot::Sender<Outcome>,
}

/// The ring of result slots shared by the engine and the handler.
pub struct ResultRing {
    slots: RefCell<Vec<Option<InFlight>>>,
    next: Cell<usize>,
    issued: Cell<u64>,
    completed: Cell<u64>,
    changed: Repeated<()>,
}

impl ResultRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RefCell::new((0..capacity).map(|_| None).collect()),
            next: Cell::new(0),
            issued: Cell::new(0),
            completed: Cell::new(0),
            changed: Repeated::default(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.borrow().len()
    }

    #[must_use]
    pub fn issued(&self) -> u64 {
        self.issued.get()
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.get()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.slots.borrow().iter().filter(|s| s.is_some()).count()
    }

    fn sequence_at(&self, index: usize) -> Option<u64> {
        self.slots.borrow()[index].as_ref().map(|s| s.sequence)
    }

    /// Wait for the next slot in dispatch order to be free and return its
    /// index. The slot stays free until [`occupy`](Self::occupy).
    pub async fn next_free(&self) -> usize {
        let index = self.next.get();
        while self.slots.borrow()[index].is_some() {
            self.changed.listen().await;
        }
        index
    }

    /// Park `run` in slot `index`, which must have been returned by
    /// [`next_free`](Self::next_free).
    pub fn occupy(&self, index: usize, run: InFlight) {
        self.slots.borrow_mut()[index] = Some(run);
        self.next.set((index + 1) % self.capacity());
        self.issued.set(self.issued.get() + 1);
        self.changed.notify();
    }

    /// Empty slot `index` and deliver `outcome` to its requester.
    fn resolve(&self, index: usize, outcome: Outcome) {
        let run = self.slots.borrow_mut()[index].take();
        if let Some(run) = run {
            // The requester may no longer be interested.
            let _ = run.reply.send(outcome);
        }
        self.completed.set(self.completed.get() + 1);
        self.changed.notify();
    }

    async fn wait_occupied(&self, index: usize) -> u64 {
        loop {
            if let Some(sequence) = self.sequence_at(index) {
                return sequence;
            }
            self.changed.listen().await;
        }
    }
}

pub struct ResultHandler {
    pub entity: Rc<Entity>,
    ctx: Rc<PipelineContext>,
    accelerator: Rc<dyn Accelerator>,
    ring: Rc<ResultRing>,
}

impl ResultHandler {
    pub fn new_and_register(
        engine: &Engine,
        ctx: &Rc<PipelineContext>,
        accelerator: Rc<dyn Accelerator>,
        ring: Rc<ResultRing>,
    ) -> Rc<Self> {
        let rc_self = Rc::new(Self {
            entity: Rc::new(Entity::new(&ctx.entity, "results")),
            ctx: ctx.clone(),
            accelerator,
            ring,
        });
        engine.register(rc_self.clone());
        rc_self
    }
}

#[async_trait(?Send)]
impl Runnable for ResultHandler {
    async fn run(&self) -> SimResult {
        let flags = self.accelerator.completion_flags();
        let mut debounce = TimeoutDebounce::new(self.ctx.config.timeout_strikes);
        let mut index = 0;

        loop {
            let sequence = self.ring.wait_occupied(index).await;
            let mask = 1 << index;

            let signalled = with_timeout(
                &self.ctx.clock,
                self.ctx.result_timeout(),
                flags.wait_any(mask),
            )
            .await;

            let outcome = match signalled {
                Some(_) => match self.accelerator.take_outcome(sequence) {
                    Some(outcome) => {
                        debounce.reset();
                        outcome
                    }
                    None => {
                        trace!(self.entity ; "stale completion on slot {index}");
                        continue;
                    }
                },
                None => match debounce.observe_timeout(self.ring.issued(), self.ring.completed()) {
                    Verdict::Ignore | Verdict::Strike => {
                        warn!(self.entity ; "slot {index} (run {sequence}) timed out, strike {}",
                            debounce.strikes());
                        continue;
                    }
                    Verdict::Fail => {
                        error!(self.entity ; "slot {index} (run {sequence}) gave up waiting");
                        self.accelerator.discard(sequence);
                        Outcome {
                            status: RunStatus::Timeout,
                            output: Vec::new(),
                        }
                    }
                },
            };

            debug!(self.entity ; "slot {index} resolved with {:?}", outcome.status);
            self.ring.resolve(index, outcome);
            index = (index + 1) % self.ring.capacity();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_accelerator_never_fails() {
        let mut debounce = TimeoutDebounce::new(2);
        for _ in 0..5 {
            assert_eq!(debounce.observe_timeout(3, 3), Verdict::Ignore);
        }
        assert_eq!(debounce.strikes(), 0);
    }

    #[test]
    fn two_misses_with_backlog_fail() {
        let mut debounce = TimeoutDebounce::new(2);
        assert_eq!(debounce.observe_timeout(4, 3), Verdict::Strike);
        assert_eq!(debounce.observe_timeout(4, 3), Verdict::Fail);
        assert_eq!(debounce.strikes(), 0);
    }

    #[test]
    fn completion_resets_the_count() {
        let mut debounce = TimeoutDebounce::new(2);
        assert_eq!(debounce.observe_timeout(2, 1), Verdict::Strike);
        debounce.reset();
        assert_eq!(debounce.observe_timeout(2, 1), Verdict::Strike);
    }

    #[test]
    fn occupied_slot_always_has_work_outstanding() {
        let ring = ResultRing::new(2);
        let (reply, _receiver) = oneshot::channel();
        ring.occupy(1, InFlight { sequence: 3, reply });

        let mut debounce = TimeoutDebounce::new(2);
        assert!(ring.issued() > ring.completed());
        assert_eq!(
            debounce.observe_timeout(ring.issued(), ring.completed()),
            Verdict::Strike
        );
    }

    #[test]
    fn ring_tracks_issued_and_completed() {
        let ring = ResultRing::new(2);
        let (reply, mut receiver) = oneshot::channel();
        ring.occupy(0, InFlight { sequence: 7, reply });
        assert_eq!(ring.in_flight(), 1);
        assert_eq!(ring.sequence_at(0), Some(7));

        ring.resolve(
            0,
            Outcome {
                status: RunStatus::Done,
                output: vec![1],
            },
        );
        assert_eq!((ring.issued(), ring.completed()), (1, 1));
        assert_eq!(ring.in_flight(), 0);
        assert_eq!(
            receiver.try_recv().ok().flatten().map(|o| o.output),
            Some(vec![1])
        );
    }
}
