// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The inference hardware.
//!
//! A run has two phases. During inference the accelerator reads its input
//! images; [`Accelerator::start`] returns once that is over, so the caller
//! can release the input buffers and start the next run. Post-processing
//! then completes in the background and raises the run's completion flag,
//! after which the outcome can be collected with
//! [`Accelerator::take_outcome`].

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use async_trait::async_trait;
use npu_engine::engine::Engine;
use npu_engine::events::flags::EventFlags;
use npu_engine::time::clock::Clock;
use npu_engine::time::timeout::Timeout;
use npu_engine::traits::Runnable;
use npu_engine::types::SimResult;
use npu_track::entity::Entity;
use npu_track::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::AcceleratorConfig;
use crate::error::ErrorCode;
use crate::framing::command::ModelInfo;
use crate::framing::inference::{CropBox, ImageFormat, PreProcInfo};
use crate::queue::BoundedQueue;

/// Completion flag used by runs that the caller waits for directly.
pub const BLOCKING_FLAG: u32 = 1 << 31;

/// How a run ended, as reported by the hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Done,
    Timeout,
    /// Any other hardware state.
    Failed(u32),
}

impl RunStatus {
    /// Map the hardware state to the public status space. Co-processor
    /// codes are passed through.
    #[must_use]
    pub fn error_code(self) -> ErrorCode {
        match self {
            RunStatus::Done => ErrorCode::Success,
            RunStatus::Timeout => ErrorCode::InferenceTimeout,
            RunStatus::Failed(state) if state >= ErrorCode::NcpuInvalidImage as u32 => {
                ErrorCode::from_wire(state)
            }
            RunStatus::Failed(_) => ErrorCode::InferenceError,
        }
    }
}

/// A crop rectangle expressed as distances from the image edges, which is
/// how the hardware takes it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CropMargins {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl CropMargins {
    /// Margins of `crop` within an image of `width` by `height`.
    #[must_use]
    pub fn of(crop: &CropBox, width: u32, height: u32) -> Self {
        Self {
            top: crop.y1,
            bottom: height.saturating_sub(crop.y1 + crop.height),
            left: crop.x1,
            right: width.saturating_sub(crop.x1 + crop.width),
        }
    }

    /// The rectangle left inside an image of `width` by `height`.
    #[must_use]
    pub fn area(&self, crop_number: u32, width: u32, height: u32) -> CropBox {
        CropBox {
            crop_number,
            x1: self.left,
            y1: self.top,
            width: width.saturating_sub(self.left + self.right),
            height: height.saturating_sub(self.top + self.bottom),
        }
    }
}

/// Set-up of one input of a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InputSetup {
    /// Number of image bytes.
    pub image_len: usize,

    /// `None` when pre-processing is bypassed.
    pub format: Option<ImageFormat>,
    pub subtract_128: bool,
    pub right_shift: bool,
    pub change_aspect_ratio: bool,
    pub symmetric_padding: bool,

    pub crop: CropMargins,

    /// Requested resize and padding.
    pub pre_proc: PreProcInfo,
}

/// The pre-processing the hardware carried out for one input. Padding may
/// be narrower than requested.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub pre_proc: PreProcInfo,
    pub crop: CropMargins,
}

#[derive(Clone, Debug)]
pub struct HardwareJob {
    pub sequence: u64,

    /// Flag bits raised when the run completes.
    pub flag: u32,
    pub model: ModelInfo,
    pub inputs: Vec<InputSetup>,
}

/// What the hardware actually applied to each input.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Receipt {
    pub applied: Vec<Applied>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub status: RunStatus,
    pub output: Vec<u8>,
}

#[async_trait(?Send)]
pub trait Accelerator {
    /// Run inference on `job`. Returns when the inputs have been consumed.
    async fn start(&self, job: HardwareJob) -> Receipt;

    /// The flags raised as runs complete.
    fn completion_flags(&self) -> EventFlags;

    /// Collect the outcome of a completed run.
    fn take_outcome(&self, sequence: u64) -> Option<Outcome>;

    /// Forget a run whose outcome is no longer wanted.
    fn discard(&self, sequence: u64);
}

struct PostProcess {
    sequence: u64,
    flag: u32,
    output_size: usize,
    status: RunStatus,
}

/// A model of the accelerator with fixed inference and post-processing
/// latencies.
pub struct SimAccelerator {
    pub entity: Rc<Entity>,
    clock: Clock,
    config: AcceleratorConfig,
    flags: EventFlags,
    post: BoundedQueue<PostProcess>,
    outcomes: RefCell<HashMap<u64, Outcome>>,
    discarded: RefCell<HashSet<u64>>,
    dropped: RefCell<HashSet<u64>>,
    forced_status: Cell<Option<RunStatus>>,
    runs: Cell<u64>,
}

/// Depth of the post-processing backlog before inference stalls.
const POST_QUEUE_DEPTH: usize = 16;

impl SimAccelerator {
    pub fn new_and_register(
        engine: &Engine,
        clock: &Clock,
        parent: &Rc<Entity>,
        config: AcceleratorConfig,
    ) -> Rc<Self> {
        let entity = Rc::new(Entity::new(parent, "npu"));
        let post = BoundedQueue::new(&entity, "post", POST_QUEUE_DEPTH);
        let rc_self = Rc::new(Self {
            entity,
            clock: clock.clone(),
            config,
            flags: EventFlags::new(),
            post,
            outcomes: RefCell::new(HashMap::new()),
            discarded: RefCell::new(HashSet::new()),
            dropped: RefCell::new(HashSet::new()),
            forced_status: Cell::new(None),
            runs: Cell::new(0),
        });
        engine.register(rc_self.clone());
        rc_self
    }

    /// Never signal completion of run `sequence`.
    pub fn drop_completion(&self, sequence: u64) {
        self.dropped.borrow_mut().insert(sequence);
    }

    /// Report `status` for every following run (`None` restores normal
    /// behaviour).
    pub fn force_status(&self, status: Option<RunStatus>) {
        self.forced_status.set(status);
    }

    /// Number of runs started.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs.get()
    }

    fn output_for(sequence: u64, size: usize) -> Vec<u8> {
        let mut output = vec![0; size];
        StdRng::seed_from_u64(sequence).fill(&mut output[..]);
        output
    }
}

#[async_trait(?Send)]
impl Accelerator for SimAccelerator {
    async fn start(&self, job: HardwareJob) -> Receipt {
        trace!(self.entity ; "run {} on model {}", job.sequence, job.model.model_id);
        self.runs.set(self.runs.get() + 1);
        self.clock.wait_ticks(self.config.inference_ticks).await;

        let status = self.forced_status.get().unwrap_or(RunStatus::Done);
        let work = PostProcess {
            sequence: job.sequence,
            flag: job.flag,
            output_size: job.model.output_size as usize,
            status,
        };
        if let Err(rejected) = self.post.put(&self.clock, work, Timeout::Forever, false).await {
            warn!(self.entity ; "run {} lost: {}", rejected.item.sequence, rejected.error);
        }

        Receipt {
            applied: job
                .inputs
                .iter()
                .map(|input| Applied {
                    pre_proc: input.pre_proc,
                    crop: input.crop,
                })
                .collect(),
        }
    }

    fn completion_flags(&self) -> EventFlags {
        self.flags.clone()
    }

    fn take_outcome(&self, sequence: u64) -> Option<Outcome> {
        self.outcomes.borrow_mut().remove(&sequence)
    }

    fn discard(&self, sequence: u64) {
        if self.outcomes.borrow_mut().remove(&sequence).is_none() {
            self.discarded.borrow_mut().insert(sequence);
        }
    }
}

#[async_trait(?Send)]
impl Runnable for SimAccelerator {
    async fn run(&self) -> SimResult {
        loop {
            let work = self.post.get(&self.clock, Timeout::Forever).await?;
            self.clock.wait_ticks(self.config.postprocess_ticks).await;

            if self.dropped.borrow_mut().remove(&work.sequence) {
                debug!(self.entity ; "run {} completes silently", work.sequence);
                continue;
            }
            if self.discarded.borrow_mut().remove(&work.sequence) {
                trace!(self.entity ; "run {} was discarded", work.sequence);
                continue;
            }

            let output = if work.status == RunStatus::Done {
                Self::output_for(work.sequence, work.output_size)
            } else {
                Vec::new()
            };
            self.outcomes.borrow_mut().insert(
                work.sequence,
                Outcome {
                    status: work.status,
                    output,
                },
            );
            trace!(self.entity ; "run {} complete", work.sequence);
            self.flags.set(work.flag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_states_map_to_codes() {
        assert_eq!(RunStatus::Done.error_code(), ErrorCode::Success);
        assert_eq!(RunStatus::Timeout.error_code(), ErrorCode::InferenceTimeout);
        assert_eq!(RunStatus::Failed(3).error_code(), ErrorCode::InferenceError);
        assert_eq!(
            RunStatus::Failed(201).error_code(),
            ErrorCode::NcpuInvalidImage
        );
    }

    #[test]
    fn crop_margins_give_back_the_rectangle() {
        let crop = CropBox {
            crop_number: 2,
            x1: 10,
            y1: 20,
            width: 100,
            height: 50,
        };
        let margins = CropMargins::of(&crop, 640, 480);
        assert_eq!(
            margins,
            CropMargins {
                top: 20,
                bottom: 410,
                left: 10,
                right: 530
            }
        );
        assert_eq!(margins.area(2, 640, 480), crop);
    }

    #[test]
    fn output_is_deterministic() {
        assert_eq!(
            SimAccelerator::output_for(4, 32),
            SimAccelerator::output_for(4, 32)
        );
        assert_ne!(
            SimAccelerator::output_for(4, 32),
            SimAccelerator::output_for(5, 32)
        );
    }
}
