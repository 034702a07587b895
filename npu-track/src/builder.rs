// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Library functions to build trackers as defined by the user.

use std::fs;
use std::io::{self, BufWriter};
use std::rc::Rc;

use crate::tracker::{EntityManager, MultiTracker, TextTracker, TrackConfigError};
use crate::{Tracker, Writer};

/// Configuration options for an individual tracker.
pub struct TrackerConfig<'a> {
    /// Enable this tracker.
    pub enable: bool,

    /// Set the level at which this tracker should be enabled.
    pub level: log::Level,

    /// A regular expression to match which entities should have this level
    /// applied.
    pub filter_regex: &'a str,

    /// If required, the name of the file to which the tracker will write.
    pub file: Option<&'a str>,
}

impl Default for TrackerConfig<'_> {
    fn default() -> Self {
        Self {
            enable: true,
            level: log::Level::Warn,
            filter_regex: "",
            file: None,
        }
    }
}

/// Configuration options for all tracking.
pub struct TrackersConfig<'a> {
    /// Configuration for stdout.
    pub stdout: TrackerConfig<'a>,

    /// Configuration for the text log file.
    pub log_file: TrackerConfig<'a>,
}

/// The user can pass a filter regular expression which will set the level only
/// for matching Entities and set all other Entities to only emit errors.
fn build_entity_manager(config: &TrackerConfig) -> Result<EntityManager, TrackConfigError> {
    let default_level = if config.filter_regex.is_empty() {
        config.level
    } else {
        log::Level::Error
    };

    let mut entity_manager = EntityManager::new(default_level);
    if !config.filter_regex.is_empty() {
        entity_manager.add_entity_level_filter(config.filter_regex, config.level)?;
    }
    Ok(entity_manager)
}

fn build_stdout_tracker(config: &TrackerConfig) -> Result<Tracker, TrackConfigError> {
    let entity_manager = build_entity_manager(config)?;
    let stdout_writer = Box::new(BufWriter::new(io::stdout()));
    Ok(Rc::new(TextTracker::new(entity_manager, stdout_writer)))
}

/// Same as the stdout tracker except the events go to a file.
fn build_file_tracker(config: &TrackerConfig) -> Result<Tracker, TrackConfigError> {
    let entity_manager = build_entity_manager(config)?;
    let Some(path) = config.file else {
        return Err(TrackConfigError(
            "A log file tracker requires a file name".to_string(),
        ));
    };
    let file = fs::File::create(path)
        .map_err(|e| TrackConfigError(format!("Failed to create {path}: {e}")))?;
    let file_writer: Writer = Box::new(BufWriter::new(file));
    Ok(Rc::new(TextTracker::new(entity_manager, file_writer)))
}

/// Set up stdout/file trackers according to the user configuration.
pub fn setup_trackers(config: &TrackersConfig) -> Result<Tracker, TrackConfigError> {
    if config.stdout.enable && config.log_file.enable {
        let mut tracker = MultiTracker::default();
        tracker.add_tracker(build_stdout_tracker(&config.stdout)?);
        tracker.add_tracker(build_file_tracker(&config.log_file)?);
        Ok(Rc::new(tracker))
    } else if config.stdout.enable {
        build_stdout_tracker(&config.stdout)
    } else if config.log_file.enable {
        build_file_tracker(&config.log_file)
    } else {
        build_stdout_tracker(&TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::toplevel;
    use crate::{Id, info};

    #[test]
    fn file_tracker_respects_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.log");
        let path_str = path.to_str().unwrap();

        let config = TrackersConfig {
            stdout: TrackerConfig {
                enable: false,
                ..Default::default()
            },
            log_file: TrackerConfig {
                enable: true,
                level: log::Level::Info,
                filter_regex: "top::pool",
                file: Some(path_str),
            },
        };
        let tracker = setup_trackers(&config).unwrap();
        {
            let top = toplevel(&tracker, "top");
            let pool = crate::entity::Entity::new(&top, "pool");
            info!(top ; "hidden");
            info!(pool ; "shown");
            assert_eq!(pool.id, Id(3));
        }
        tracker.shutdown();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "3:INFO: shown\n");
    }

    #[test]
    fn missing_file_name_is_an_error() {
        let config = TrackersConfig {
            stdout: TrackerConfig {
                enable: false,
                ..Default::default()
            },
            log_file: TrackerConfig::default(),
        };
        assert!(setup_trackers(&config).is_err());
    }
}
