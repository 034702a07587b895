// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Logging and tracing for the NPU pipeline.
//!
//! Every part of the pipeline owns an [`Entity`](crate::entity::Entity) and
//! reports through it:
//!
//!   - _log_ messages are human-readable text at a [`log::Level`], emitted
//!     with [`trace!`], [`debug!`], [`info!`], [`warn!`] and [`error!`].
//!   - _trace_ events follow objects through the model: a buffer being
//!     created ([`create_and_track_id!`]), entering or leaving a queue
//!     ([`enter!`], [`exit!`]), a queue occupancy ([`value!`]) or the
//!     simulation time moving on ([`set_time!`]). They are emitted only when
//!     the entity is enabled at `Trace`.
//!
//! Whether an entity emits anything at a given level is decided by the
//! [`EntityManager`](crate::tracker::EntityManager) of the tracker, which
//! matches entity names against regular expressions.
//!
//! ```rust
//! use npu_track::entity::{Entity, toplevel};
//! use npu_track::info;
//! use npu_track::tracker::stdout_tracker;
//!
//! let tracker = stdout_tracker(npu_track::log::Level::Info);
//! let top = toplevel(&tracker, "top");
//! let fifoq = Entity::new(&top, "fifoq");
//! info!(fifoq ; "configured {} image buffers", 4);
//! ```

#![warn(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;

pub use log;

pub mod builder;
pub mod entity;
pub mod id;
pub mod test_helpers;
pub mod tracker;

pub use id::Id;
pub use tracker::{Track, TrackConfigError, Tracker};

/// Destination of text tracker output.
pub type Writer = Box<dyn std::io::Write>;
type SharedWriter = Rc<RefCell<Writer>>;

/// Parent ID of the top-level entity.
pub const NO_ID: Id = Id(0);

/// IDs handed out by an [`EntityManager`](crate::tracker::EntityManager)
/// start above this one.
pub const ROOT: Id = Id(1);

/// Evaluate a trace event only when `$entity` is enabled at `Trace`.
#[doc(hidden)]
#[macro_export]
macro_rules! when_tracing {
    ($entity:expr => $event:expr) => {
        if $entity
            .tracker
            .is_entity_enabled($entity.id, $crate::log::Level::Trace)
        {
            $event;
        }
    };
}

/// Track an object entering an entity.
#[macro_export]
macro_rules! enter {
    ($entity:expr ; $object:expr) => {
        $crate::when_tracing!($entity => $entity.tracker.enter($entity.id, $object))
    };
}

/// Track an object leaving an entity.
#[macro_export]
macro_rules! exit {
    ($entity:expr ; $object:expr) => {
        $crate::when_tracing!($entity => $entity.tracker.exit($entity.id, $object))
    };
}

/// Allocate an [`Id`] for an object owned by `$entity` and track its
/// creation with a name and size in bytes.
#[macro_export]
macro_rules! create_and_track_id {
    ($entity:expr ; $name:expr, $num_bytes:expr) => {{
        let id = $entity.tracker.unique_id();
        $crate::when_tracing!($entity => $entity.tracker.create($entity.id, id, $num_bytes, $name));
        id
    }};
}

/// Track that an object created with [`create_and_track_id!`] is finished
/// with.
#[macro_export]
macro_rules! destroy_id {
    ($entity:expr ; $id:expr) => {
        $crate::when_tracing!($entity => $entity.tracker.destroy($entity.id, $id))
    };
}

/// Track the creation of an entity.
#[macro_export]
macro_rules! create {
    ($entity:expr) => {{
        let parent_id = $entity.parent.as_ref().map_or($crate::NO_ID, |p| p.id);
        $crate::when_tracing!($entity =>
            $entity.tracker.create(parent_id, $entity.id, 0, &$entity.full_name()));
    }};
}

/// Track the end of an entity.
#[macro_export]
macro_rules! destroy {
    ($entity:expr) => {{
        let parent_id = $entity.parent.as_ref().map_or($crate::NO_ID, |p| p.id);
        $crate::when_tracing!($entity => $entity.tracker.destroy(parent_id, $entity.id));
    }};
}

/// Record a value, such as a queue occupancy, against an entity.
#[macro_export]
macro_rules! value {
    ($entity:expr ; $value:expr) => {
        $crate::when_tracing!($entity => $entity.tracker.value($entity.id, $value as f64))
    };
}

/// Record the simulation time moving to `$time_ns`.
#[macro_export]
macro_rules! set_time {
    ($entity:expr ; $time_ns:expr) => {
        $crate::when_tracing!($entity => $entity.tracker.time($entity.id, $time_ns))
    };
}

/// Emit a log message at `$lvl` when the entity is enabled at that level.
#[macro_export]
macro_rules! log_base {
    ($entity:expr ; $lvl:expr, $($arg:tt)+) => (
        if $entity.tracker.is_entity_enabled($entity.id, $lvl) {
            $entity.tracker.log($entity.id, $lvl, format_args!($($arg)+));
        }
    );
}

/// Log at level `log::Level::Trace`
#[macro_export]
macro_rules! trace {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Trace, $($arg)+);
    );
}

/// Log at level `log::Level::Debug`
#[macro_export]
macro_rules! debug {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Debug, $($arg)+);
    );
}

/// Log at level `log::Level::Info`
#[macro_export]
macro_rules! info {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Info, $($arg)+);
    );
}

/// Log at level `log::Level::Warn`
#[macro_export]
macro_rules! warn {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Warn, $($arg)+);
    );
}

/// Log at level `log::Level::Error`
#[macro_export]
macro_rules! error {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Error, $($arg)+);
    );
}
