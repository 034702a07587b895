// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Named, hierarchical owners of log and trace events.
//!
//! Every part of the pipeline (queues, pools, handlers, the simulated device)
//! owns an entity. Log filters match against the entity's full name.

use std::fmt;
use std::rc::Rc;

use crate::{Id, Tracker, create, destroy};

/// A named part of the model.
///
/// Entities form a tree below the single [`toplevel`] entity; the full name
/// of an entity joins the names on its path with `::`, for example
/// `top::npu::fifoq::image`.
pub struct Entity {
    /// Name of this entity within its parent.
    pub name: String,

    /// Only the top-level entity has no parent.
    pub parent: Option<Rc<Entity>>,

    /// Identifies this entity in _log_/_trace_ output.
    pub id: Id,

    /// Where this entity's events go.
    pub tracker: Tracker,

    path: String,
}

const SEPARATOR: &str = "::";

impl Entity {
    /// Create an entity called `name` below `parent`.
    #[must_use]
    pub fn new(parent: &Rc<Entity>, name: &str) -> Self {
        let path = format!("{}{SEPARATOR}{name}", parent.path);
        Self::register(Some(parent.clone()), name, path, &parent.tracker)
    }

    fn register(parent: Option<Rc<Entity>>, name: &str, path: String, tracker: &Tracker) -> Self {
        let id = tracker.unique_id();
        tracker.add_entity(id, &path);
        let entity = Self {
            name: name.to_string(),
            parent,
            id,
            tracker: tracker.clone(),
            path,
        };
        create!(entity);
        entity
    }

    /// The names from the top-level entity down to this one.
    #[must_use]
    pub fn full_name(&self) -> String {
        self.path.clone()
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        destroy!(self);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Create the top-level entity, the only one without a parent.
pub fn toplevel(tracker: &Tracker, name: &str) -> Rc<Entity> {
    Rc::new(Entity::register(None, name, name.to_string(), tracker))
}
