// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Fan events out to several trackers, such as stdout and a log file.

use crate::Id;
use crate::tracker::{EntityManager, Track, Tracker};

/// Forwards each event to every tracker enabled for it. IDs are allocated
/// here so that all trackers agree on them.
pub struct MultiTracker {
    entity_manager: EntityManager,
    trackers: Vec<Tracker>,
}

impl MultiTracker {
    /// Add a new tracker
    pub fn add_tracker(&mut self, tracker: Tracker) {
        self.trackers.push(tracker);
    }

    fn for_enabled(&self, id: Id, level: log::Level, f: impl Fn(&Tracker)) {
        for tracker in &self.trackers {
            if tracker.is_entity_enabled(id, level) {
                f(tracker);
            }
        }
    }
}

impl Default for MultiTracker {
    fn default() -> Self {
        Self {
            // Only used for handing out IDs
            entity_manager: EntityManager::new(log::Level::Error),
            trackers: Vec::new(),
        }
    }
}

impl Track for MultiTracker {
    fn unique_id(&self) -> Id {
        self.entity_manager.unique_id()
    }

    fn is_entity_enabled(&self, id: Id, level: log::Level) -> bool {
        self.trackers
            .iter()
            .any(|tracker| tracker.is_entity_enabled(id, level))
    }

    fn add_entity(&self, id: Id, entity_name: &str) {
        for tracker in &self.trackers {
            tracker.add_entity(id, entity_name);
        }
    }

    fn enter(&self, id: Id, object: Id) {
        self.for_enabled(id, log::Level::Trace, |t| t.enter(id, object));
    }

    fn exit(&self, id: Id, object: Id) {
        self.for_enabled(id, log::Level::Trace, |t| t.exit(id, object));
    }

    fn value(&self, id: Id, value: f64) {
        self.for_enabled(id, log::Level::Trace, |t| t.value(id, value));
    }

    fn create(&self, created_by: Id, id: Id, num_bytes: usize, name: &str) {
        self.for_enabled(created_by, log::Level::Trace, |t| {
            t.create(created_by, id, num_bytes, name);
        });
    }

    fn destroy(&self, destroyed_by: Id, id: Id) {
        self.for_enabled(destroyed_by, log::Level::Trace, |t| t.destroy(destroyed_by, id));
    }

    fn log(&self, id: Id, level: log::Level, msg: std::fmt::Arguments) {
        self.for_enabled(id, level, |t| t.log(id, level, msg));
    }

    fn time(&self, set_by: Id, time_ns: f64) {
        self.for_enabled(set_by, log::Level::Trace, |t| t.time(set_by, time_ns));
    }

    fn shutdown(&self) {
        for tracker in &self.trackers {
            tracker.shutdown();
        }
    }
}
