// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! State shared by the tasks of one pipeline.
//!
//! Every task holds an `Rc<PipelineContext>`. The context owns the FIFO
//! queue manager and the collaborators, plus the handful of flags that the
//! control channel and the commands change while the pipeline runs.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use npu_engine::time::clock::Clock;
use npu_engine::time::timeout::Timeout;
use npu_track::entity::Entity;
use npu_track::{debug, info};

use crate::config::PipelineConfig;
use crate::device::DeviceServices;
use crate::fifoq::FifoQueueManager;
use crate::transport::Transport;

/// Debug checkpoint: dump the first input once pre-processing is done.
pub const CHECKPOINT_AFTER_PREPROCESS: u32 = 0x2;

/// Debug checkpoint: dump the raw output once inference is done.
pub const CHECKPOINT_AFTER_INFERENCE: u32 = 0x4;

/// Per-run timing averaged over every run since the statistics were last
/// enabled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStatistics {
    pub enabled: bool,
    pub runs: u32,
    pub inference_ticks: u64,
    pub postprocess_ticks: u64,
}

impl RunStatistics {
    /// Enable or disable collection. Enabling starts from zero.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            *self = Self::default();
        }
        self.enabled = enabled;
    }

    pub fn record(&mut self, inference_ticks: u64, postprocess_ticks: u64) {
        if !self.enabled {
            return;
        }
        self.runs = self.runs.saturating_add(1);
        self.inference_ticks += inference_ticks;
        self.postprocess_ticks += postprocess_ticks;
    }

    fn average(&self, total: u64) -> u32 {
        if self.runs == 0 {
            0
        } else {
            u32::try_from(total / u64::from(self.runs)).unwrap_or(u32::MAX)
        }
    }

    /// `{runs, average inference ticks, average post-process ticks}`.
    #[must_use]
    pub fn words(&self) -> [u32; 3] {
        [
            self.runs,
            self.average(self.inference_ticks),
            self.average(self.postprocess_ticks),
        ]
    }
}

pub struct PipelineContext {
    pub entity: Rc<Entity>,
    pub clock: Clock,
    pub config: PipelineConfig,
    pub fifoq: Rc<FifoQueueManager>,
    pub device: Rc<dyn DeviceServices>,
    pub transport: Rc<dyn Transport>,

    droppable: Cell<bool>,
    reset_requested: Cell<bool>,
    checkpoint_flags: Cell<u32>,
    profile: RefCell<RunStatistics>,
    perf_monitor: RefCell<RunStatistics>,
}

impl PipelineContext {
    #[must_use]
    pub fn new(
        entity: &Rc<Entity>,
        clock: &Clock,
        config: PipelineConfig,
        fifoq: Rc<FifoQueueManager>,
        device: Rc<dyn DeviceServices>,
        transport: Rc<dyn Transport>,
    ) -> Rc<Self> {
        Rc::new(Self {
            entity: entity.clone(),
            clock: clock.clone(),
            config,
            fifoq,
            device,
            transport,
            droppable: Cell::new(false),
            reset_requested: Cell::new(false),
            checkpoint_flags: Cell::new(0),
            profile: RefCell::new(RunStatistics::default()),
            perf_monitor: RefCell::new(RunStatistics::default()),
        })
    }

    #[must_use]
    pub fn droppable(&self) -> bool {
        self.droppable.get()
    }

    pub fn set_droppable(&self, enable: bool) {
        if self.droppable.replace(enable) != enable {
            info!(self.entity ; "droppable mode {}", if enable { "on" } else { "off" });
        }
    }

    pub fn request_reset(&self) {
        self.reset_requested.set(true);
    }

    /// Consume a pending queue reset request.
    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.replace(false)
    }

    #[must_use]
    pub fn checkpoint_flags(&self) -> u32 {
        self.checkpoint_flags.get()
    }

    #[must_use]
    pub fn checkpoints_active(&self) -> bool {
        self.checkpoint_flags.get() != 0
    }

    pub fn set_checkpoints(&self, flags: u32, enable: bool) {
        let current = self.checkpoint_flags.get();
        let updated = if enable {
            current | flags
        } else {
            current & !flags
        };
        debug!(self.entity ; "checkpoint flags {current:#x} -> {updated:#x}");
        self.checkpoint_flags.set(updated);
    }

    /// How long the result handler waits for one completion.
    #[must_use]
    pub fn result_timeout(&self) -> Timeout {
        if self.checkpoints_active() {
            Timeout::Forever
        } else {
            Timeout::Ticks(self.config.result_timeout_ticks)
        }
    }

    pub fn set_profiling(&self, enable: bool) {
        self.profile.borrow_mut().set_enabled(enable);
    }

    #[must_use]
    pub fn profile(&self) -> RunStatistics {
        *self.profile.borrow()
    }

    pub fn set_perf_monitor(&self, enable: bool) {
        self.perf_monitor.borrow_mut().set_enabled(enable);
    }

    #[must_use]
    pub fn perf_monitor(&self) -> RunStatistics {
        *self.perf_monitor.borrow()
    }

    /// Account one finished run to every enabled statistic.
    pub fn record_run(&self, inference_ticks: u64, postprocess_ticks: u64) {
        self.profile
            .borrow_mut()
            .record(inference_ticks, postprocess_ticks);
        self.perf_monitor
            .borrow_mut()
            .record(inference_ticks, postprocess_ticks);
    }
}
