// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Helpers shared by the tests of the engine and the crates built on it.

use std::fs;
use std::io::BufWriter;
use std::path::Path;
use std::rc::Rc;

use npu_track::tracker::{EntityManager, TextTracker};
use npu_track::{Tracker, Writer};

use crate::engine::Engine;

/// Create a tracker that writes every event of the test to
/// `traces/<test file name>.log`.
#[must_use]
pub fn create_tracker(full_filepath: &str) -> Tracker {
    // Place all trace files in one folder
    const FOLDER: &str = "traces";

    fs::create_dir_all(FOLDER).unwrap();

    let filename_only = Path::new(full_filepath)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap();

    let writer: Writer = Box::new(BufWriter::new(
        fs::File::create(format!("{FOLDER}/{filename_only}.log")).unwrap(),
    ));

    let entity_manager = EntityManager::new(log::Level::Trace);
    let tracker: Tracker = Rc::new(TextTracker::new(entity_manager, writer));
    tracker
}

#[must_use]
pub fn start_test(full_filepath: &str) -> Engine {
    Engine::new(&create_tracker(full_filepath))
}
