// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The overall owner of time within a simulation.

use std::rc::Rc;
use std::task::Waker;

use npu_track::entity::Entity;
use npu_track::set_time;

use super::clock::Clock;

/// Contains all Clocks and the current simulation time in ns.
pub struct SimTime {
    pub entity: Rc<Entity>,

    current_ns: f64,

    /// Clocks are created on first request for a given frequency.
    clocks: Vec<Clock>,
}

impl SimTime {
    #[must_use]
    pub fn new(parent: &Rc<Entity>) -> Self {
        Self {
            entity: Rc::new(Entity::new(parent, "time")),
            current_ns: 0.0,
            clocks: Vec::new(),
        }
    }

    pub fn get_clock(&mut self, freq_mhz: f64) -> Clock {
        for clock in &self.clocks {
            if clock.freq_mhz() == freq_mhz {
                return clock.clone();
            }
        }
        let clock = Clock::new(freq_mhz);
        self.clocks.push(clock.clone());
        clock
    }

    /// Choose the clock with the next time and return the associated Wakers.
    ///
    /// Returns `None` when no clock has anything scheduled.
    pub fn advance_time(&mut self) -> Option<Vec<Waker>> {
        let next_clock = self.clocks.iter().min()?;
        let (tick, wakers) = next_clock.shared_state.pop_next()?;
        let next_ns = next_clock.to_ns(tick);
        if next_ns > self.current_ns {
            set_time!(self.entity ; next_ns);
            self.current_ns = next_ns;
        }
        Some(wakers)
    }

    #[must_use]
    pub fn time_now_ns(&self) -> f64 {
        self.current_ns
    }
}
