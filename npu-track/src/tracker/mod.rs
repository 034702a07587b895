// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Define the [`Track`] trait and a number of [`Tracker`]s.

pub mod dev_null;
pub mod multi_tracker;
pub mod text;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::{fmt, io};

pub use dev_null::DevNullTracker;
pub use multi_tracker::MultiTracker;
use regex::Regex;
pub use text::TextTracker;

use crate::{Id, ROOT};

/// Error used to return configuration errors
#[derive(Debug)]
pub struct TrackConfigError(pub String);

impl fmt::Display for TrackConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TrackConfigError {}

/// Receiver of the _log_ and _trace_ events of every entity.
pub trait Track {
    /// Allocate an [`Id`] that has not been handed out before.
    fn unique_id(&self) -> Id;

    /// Whether events at `level` from entity `id` are wanted.
    fn is_entity_enabled(&self, id: Id, level: log::Level) -> bool;

    /// Register an entity under its full hierarchical name so that name
    /// filters can be applied to it.
    fn add_entity(&self, id: Id, entity_name: &str);

    /// Object `object` entered entity `id`.
    fn enter(&self, id: Id, object: Id);

    /// Object `object` left entity `id`.
    fn exit(&self, id: Id, object: Id);

    /// Entity `id` reports a value.
    fn value(&self, id: Id, value: f64);

    /// Object `id` of `num_bytes` bytes was created by `created_by`.
    fn create(&self, created_by: Id, id: Id, num_bytes: usize, name: &str);

    /// Object `id` is finished with.
    fn destroy(&self, destroyed_by: Id, id: Id);

    /// A log message.
    fn log(&self, id: Id, level: log::Level, msg: fmt::Arguments);

    /// The simulation time has moved to `time_ns`.
    fn time(&self, set_by: Id, time_ns: f64);

    /// Flush any buffered output.
    fn shutdown(&self);
}

/// The type of a [`Tracker`] that is shared across entities.
pub type Tracker = Rc<dyn Track>;

/// A [`Tracker`] that writes every event at or above `level` to stdout.
#[must_use]
pub fn stdout_tracker(level: log::Level) -> Tracker {
    let writer = Box::new(io::BufWriter::new(io::stdout()));
    Rc::new(TextTracker::new(EntityManager::new(level), writer))
}

/// A [`Tracker`] that discards everything.
#[must_use]
pub fn dev_null_tracker() -> Tracker {
    Rc::new(DevNullTracker)
}

/// Decides, per entity, which levels are emitted and hands out [`Id`]s.
///
/// Entities whose full name matches one of the filters get the filter's
/// level; all others get the default level. The first matching filter wins.
pub struct EntityManager {
    default_level: log::Level,
    filters: Vec<(Regex, log::Level)>,

    /// Entities whose level differs from the default.
    overrides: RefCell<HashMap<Id, log::Level>>,

    next_id: Cell<u64>,
    time_ns: Cell<f64>,
}

impl EntityManager {
    /// A manager with no filters.
    #[must_use]
    pub fn new(default_level: log::Level) -> Self {
        Self {
            default_level,
            filters: Vec::new(),
            overrides: RefCell::new(HashMap::new()),
            next_id: Cell::new(ROOT.0 + 1),
            time_ns: Cell::new(0.0),
        }
    }

    fn unique_id(&self) -> Id {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        Id(id)
    }

    fn is_log_enabled_at_level(&self, id: Id, level: log::Level) -> bool {
        let entity_level = self
            .overrides
            .borrow()
            .get(&id)
            .copied()
            .unwrap_or(self.default_level);
        level <= entity_level
    }

    fn add_entity(&self, id: Id, entity_name: &str) {
        let level = self.log_level_for(entity_name);
        if level != self.default_level {
            self.overrides.borrow_mut().insert(id, level);
        }
    }

    fn log_level_for(&self, entity_name: &str) -> log::Level {
        self.filters
            .iter()
            .find(|(regex, _)| regex.is_match(entity_name))
            .map_or(self.default_level, |(_, level)| *level)
    }

    /// Emit `level` for every entity whose full name matches `regex_str`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use npu_track::tracker::EntityManager;
    /// let mut manager = EntityManager::new(log::Level::Warn);
    /// manager.add_entity_level_filter(".*fifoq.*", log::Level::Trace).unwrap();
    /// ```
    pub fn add_entity_level_filter(
        &mut self,
        regex_str: &str,
        level: log::Level,
    ) -> Result<(), TrackConfigError> {
        let regex = Regex::new(regex_str).map_err(|e| {
            TrackConfigError(format!("Failed to parse regex {regex_str}:\n{e}\n"))
        })?;
        self.filters.push((regex, level));
        Ok(())
    }

    /// Returns whether the time moved forward.
    fn set_time(&self, time_ns: f64) -> bool {
        if time_ns > self.time_ns.get() {
            self.time_ns.set(time_ns);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use log::Level;

    use super::*;

    fn entity_paths() -> Vec<&'static str> {
        vec![
            "top",
            "top::fifoq",
            "top::fifoq::image_pool",
            "top::fifoq::result_pool",
        ]
    }

    #[test]
    fn no_filters() {
        let manager = EntityManager::new(Level::Error);

        for p in entity_paths() {
            assert_eq!(manager.log_level_for(p), Level::Error);
        }
    }

    #[test]
    fn filter_fifoq_trace() {
        let mut manager = EntityManager::new(Level::Error);
        manager
            .add_entity_level_filter(r".*fifoq.*", Level::Trace)
            .unwrap();

        let expected_levels = [Level::Error, Level::Trace, Level::Trace, Level::Trace];

        for (i, p) in entity_paths().iter().enumerate() {
            assert_eq!(manager.log_level_for(p), expected_levels[i]);
        }
    }

    #[test]
    fn first_matching_filter_wins() {
        let mut manager = EntityManager::new(Level::Error);
        manager
            .add_entity_level_filter(r".*image_pool", Level::Warn)
            .unwrap();
        manager
            .add_entity_level_filter(r".*fifoq.*", Level::Info)
            .unwrap();

        let expected_levels = [Level::Error, Level::Info, Level::Warn, Level::Info];

        for (i, p) in entity_paths().iter().enumerate() {
            assert_eq!(manager.log_level_for(p), expected_levels[i]);
        }
    }

    #[test]
    fn bad_regex_is_reported() {
        let mut manager = EntityManager::new(Level::Error);
        let err = manager
            .add_entity_level_filter(r"(unclosed", Level::Info)
            .unwrap_err();
        assert!(err.0.starts_with("Failed to parse regex (unclosed"));
    }

    #[test]
    fn enabled_levels_follow_lookup() {
        let mut manager = EntityManager::new(Level::Warn);
        manager
            .add_entity_level_filter(r".*result_pool", Level::Debug)
            .unwrap();
        manager.add_entity(Id(5), "top::fifoq::result_pool");
        manager.add_entity(Id(6), "top::fifoq::image_pool");
        assert!(manager.is_log_enabled_at_level(Id(5), Level::Debug));
        assert!(!manager.is_log_enabled_at_level(Id(5), Level::Trace));
        assert!(!manager.is_log_enabled_at_level(Id(6), Level::Info));
        assert!(manager.is_log_enabled_at_level(Id(6), Level::Warn));
    }

    #[test]
    fn ids() {
        let manager = EntityManager::new(Level::Error);
        for i in 0..10 {
            assert_eq!(manager.unique_id(), Id(i + ROOT.0 + 1));
        }
    }
}
