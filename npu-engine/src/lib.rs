// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

#![doc(test(attr(warn(unused))))]

//! The NPU pipeline simulation engine.
//!
//! This library provides a deterministic, single-threaded
//! [engine](crate::engine::Engine) that executes the asynchronous tasks that
//! make up the pipeline. Tasks are either registered as
//! [components](crate::types::Component), which are spawned when the
//! simulation starts, or spawned directly.
//!
//! Time is modelled with [clocks](crate::time::clock). The default clock
//! ticks once per millisecond and every timeout in the pipeline is expressed
//! in ticks of it. A simulation ends when no task can make progress and no
//! clock has anything scheduled.
//!
//! ```rust
//! use npu_engine::engine::Engine;
//! use npu_engine::events::once::Once;
//! use npu_engine::run_simulation;
//! use npu_engine::traits::Event;
//!
//! let mut engine = Engine::default();
//! let clock = engine.default_clock();
//! let done = Once::new();
//! {
//!     let done = done.clone();
//!     engine.spawn(async move {
//!         clock.wait_ticks(5).await;
//!         done.notify(7)
//!     });
//! }
//! engine.spawn(async move {
//!     assert_eq!(done.listen().await, 7);
//!     Ok(())
//! });
//! run_simulation!(engine);
//! assert_eq!(engine.time_now_ns(), 5_000_000.0);
//! ```

pub mod engine;
pub mod events;
pub mod executor;
pub mod test_helpers;
pub mod time;
pub mod traits;
pub mod types;

#[macro_export]
/// Spawn all component run() functions and then run the simulation.
macro_rules! run_simulation {
    ($engine:ident) => {
        $engine.run().unwrap();
    };
    ($engine:ident, $expect:expr) => {
        match $engine.run() {
            Ok(()) => panic!("Expected an error!"),
            Err(e) => assert_eq!(format!("{e}").as_str(), $expect),
        }
    };
}
