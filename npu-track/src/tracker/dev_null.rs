// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A tracker that discards every event, for benchmarks.

use crate::tracker::Track;
use crate::{Id, NO_ID};

/// Reports every entity as disabled, so the tracking macros never format
/// anything.
pub struct DevNullTracker;

impl Track for DevNullTracker {
    fn unique_id(&self) -> Id {
        NO_ID
    }

    fn is_entity_enabled(&self, _id: Id, _level: log::Level) -> bool {
        false
    }

    fn add_entity(&self, _id: Id, _entity_name: &str) {}
    fn enter(&self, _id: Id, _object: Id) {}
    fn exit(&self, _id: Id, _object: Id) {}
    fn value(&self, _id: Id, _value: f64) {}
    fn create(&self, _created_by: Id, _id: Id, _num_bytes: usize, _name: &str) {}
    fn destroy(&self, _destroyed_by: Id, _id: Id) {}
    fn log(&self, _id: Id, _level: log::Level, _msg: std::fmt::Arguments) {}
    fn time(&self, _set_by: Id, _time_ns: f64) {}
    fn shutdown(&self) {}
}
