// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The [`Engine`] owns the executor and its clocks, and holds the
//! components that are spawned as the simulation starts.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use npu_track::entity::{Entity, toplevel};
use npu_track::tracker::stdout_tracker;
use npu_track::{Tracker, debug};

use crate::executor::{self, Executor, Spawner};
use crate::sim_error;
use crate::time::clock::Clock;
use crate::types::{Component, SimResult};

/// One tick of the default clock is one millisecond.
const DEFAULT_CLOCK_MHZ: f64 = 0.001;

/// Message of the error that [`Engine::finish_at`] stops the simulation
/// with.
pub const FINISH_MESSAGE: &str = "Finish";

pub struct Engine {
    pub executor: Executor,
    spawner: Spawner,
    toplevel: Rc<Entity>,
    tracker: Tracker,
    components: RefCell<Vec<Component>>,
}

impl Engine {
    pub fn new(tracker: &Tracker) -> Self {
        let toplevel = toplevel(tracker, "top");
        let (executor, spawner) = executor::new_executor_and_spawner(&toplevel);
        Self {
            executor,
            spawner,
            toplevel,
            tracker: tracker.clone(),
            components: RefCell::new(Vec::new()),
        }
    }

    /// Register a component whose `run()` is spawned when the simulation
    /// starts.
    pub fn register(&self, component: Component) {
        self.components.borrow_mut().push(component);
    }

    /// Run until every task has completed or is waiting on something that
    /// can no longer happen. The first task to fail stops the simulation
    /// and its error is returned.
    pub fn run(&mut self) -> SimResult {
        let components: Vec<Component> = self.components.borrow_mut().drain(..).collect();
        debug!(self.toplevel ; "spawning {} components", components.len());
        for component in components {
            self.spawner.spawn(async move { component.run().await });
        }
        self.executor.run()
    }

    /// Stop the simulation at `tick` of the default clock by failing with
    /// [`FINISH_MESSAGE`].
    pub fn finish_at(&self, tick: u64) {
        let clock = self.default_clock();
        self.spawner.spawn(async move {
            clock.wait_ticks(tick.saturating_sub(clock.tick_now())).await;
            sim_error!(FINISH_MESSAGE)
        });
    }

    #[must_use]
    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    pub fn spawn(&self, future: impl Future<Output = SimResult> + 'static) {
        self.spawner.spawn(future);
    }

    #[must_use]
    pub fn default_clock(&self) -> Clock {
        self.executor.get_clock(DEFAULT_CLOCK_MHZ)
    }

    #[must_use]
    pub fn clock_mhz(&self, freq_mhz: f64) -> Clock {
        self.executor.get_clock(freq_mhz)
    }

    #[must_use]
    pub fn time_now_ns(&self) -> f64 {
        self.executor.time_now_ns()
    }

    #[must_use]
    pub fn top(&self) -> &Rc<Entity> {
        &self.toplevel
    }

    #[must_use]
    pub fn tracker(&self) -> Tracker {
        self.tracker.clone()
    }
}

/// An engine that logs to stdout at `Info`.
impl Default for Engine {
    fn default() -> Self {
        Self::new(&stdout_tracker(log::Level::Info))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Flush buffered trackers.
        self.tracker.shutdown();
    }
}
