// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Line-oriented text output.

use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

use crate::tracker::{EntityManager, Track};
use crate::{Id, SharedWriter, Writer};

/// A simple text logger to output messages to a Writer.
///
/// Each event is written as one line prefixed by the ID of the entity that
/// emitted it, for example `7:INFO: configured`.
pub struct TextTracker {
    entity_manager: EntityManager,

    /// Writer to which all events will be written.
    writer: SharedWriter,
}

impl TextTracker {
    /// Create a new [`TextTracker`] with an [`EntityManager`].
    pub fn new(entity_manager: EntityManager, writer: Writer) -> Self {
        Self {
            entity_manager,
            writer: Rc::new(RefCell::new(writer)),
        }
    }

    fn write_line(&self, line: fmt::Arguments) {
        let mut writer = self.writer.borrow_mut();
        // Tracking must never abort the model, so a failed write is dropped.
        let _ = writer.write_fmt(format_args!("{line}\n"));
    }
}

impl Track for TextTracker {
    fn unique_id(&self) -> Id {
        self.entity_manager.unique_id()
    }

    fn is_entity_enabled(&self, id: Id, level: log::Level) -> bool {
        self.entity_manager.is_log_enabled_at_level(id, level)
    }

    fn add_entity(&self, id: Id, entity_name: &str) {
        self.entity_manager.add_entity(id, entity_name);
    }

    fn enter(&self, id: Id, object: Id) {
        self.write_line(format_args!("{id}: enter {object}"));
    }

    fn exit(&self, id: Id, object: Id) {
        self.write_line(format_args!("{id}: exit {object}"));
    }

    fn value(&self, id: Id, value: f64) {
        self.write_line(format_args!("{id}: value {value}"));
    }

    fn create(&self, created_by: Id, id: Id, num_bytes: usize, name: &str) {
        self.write_line(format_args!("{created_by}: created {id}, {name}, {num_bytes} bytes"));
    }

    fn destroy(&self, destroyed_by: Id, id: Id) {
        self.write_line(format_args!("{destroyed_by}: destroyed {id}"));
    }

    fn log(&self, id: Id, level: log::Level, msg: fmt::Arguments) {
        self.write_line(format_args!("{id}:{level}: {msg}"));
    }

    fn time(&self, set_by: Id, time_ns: f64) {
        if self.entity_manager.set_time(time_ns) {
            self.write_line(format_args!("{set_by}: set time to {time_ns:.1}ns"));
        }
    }

    fn shutdown(&self) {
        let _ = self.writer.borrow_mut().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A writer that appends into a shared byte vector.
    struct VecWriter(Rc<RefCell<Vec<u8>>>);

    impl Write for VecWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lines_are_prefixed_with_id() {
        let store = Rc::new(RefCell::new(Vec::new()));
        let tracker = TextTracker::new(
            EntityManager::new(log::Level::Info),
            Box::new(VecWriter(store.clone())),
        );
        tracker.log(Id(7), log::Level::Info, format_args!("configured {}", 3));
        tracker.enter(Id(7), Id(12));
        tracker.time(Id(1), 2.0);
        tracker.time(Id(1), 2.0);
        tracker.shutdown();

        let text = String::from_utf8(store.borrow().clone()).unwrap();
        assert_eq!(
            text,
            "7:INFO: configured 3\n7: enter 12\n1: set time to 2.0ns\n"
        );
    }
}
