// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Validation and execution of accelerator runs.
//!
//! [`InferenceEngine::prepare`] checks a job's inputs against the target
//! model and builds the hardware set-up; nothing touches the accelerator
//! until that has succeeded. [`InferenceEngine::dispatch`] then runs the job
//! and queues its result.

use std::cell::Cell;
use std::rc::Rc;

use futures::channel::oneshot;
use npu_engine::executor::Spawner;
use npu_engine::time::timeout::{Timeout, with_timeout};
use npu_track::entity::Entity;
use npu_track::{debug, trace, warn};

use crate::accelerator::{
    Accelerator, BLOCKING_FLAG, CropMargins, HardwareJob, InputSetup, Outcome, RunStatus,
};
use crate::buffer::Buffer;
use crate::context::{CHECKPOINT_AFTER_INFERENCE, CHECKPOINT_AFTER_PREPROCESS, PipelineContext};
use crate::error::ErrorCode;
use crate::framing::command::ModelInfo;
use crate::framing::header::{HEADER_STAMP_SIZE, HeaderStamp, MagicType};
use crate::framing::inference::{
    CHECKPOINT_HEADER_SIZE, CheckpointHeader, CropBox, ImageHeader, PaddingMode, PreProcInfo,
    RESULT_HEADER_SIZE, ResizeMode, ResultHeader,
};
use crate::inference::result_handler::{InFlight, ResultRing};

/// One input of a job as it arrived from the host.
#[derive(Copy, Clone, Debug)]
pub enum InputImage<'a> {
    /// An image that the accelerator pre-processes as `header` describes.
    Processed {
        header: ImageHeader,
        image: &'a [u8],
    },

    /// Data already in the model's input layout.
    Bypass { image: &'a [u8] },
}

impl InputImage<'_> {
    fn image(&self) -> &[u8] {
        match self {
            InputImage::Processed { image, .. } | InputImage::Bypass { image } => image,
        }
    }
}

/// A validated job ready for the accelerator.
#[derive(Clone, Debug)]
pub struct PreparedRun {
    pub model: ModelInfo,
    pub inputs: Vec<InputSetup>,
}

/// Where a result goes and how it is labelled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultMeta {
    pub job_id: u32,
    pub inference_number: u32,
    pub crop_number: u32,
}

/// Book-keeping of a run whose inputs have been consumed.
#[derive(Clone, Debug)]
pub struct RunRecord {
    pub sequence: u64,
    pub model_id: u32,

    /// The pre-processing the hardware applied to each input.
    pub applied: Vec<PreProcInfo>,
    inference_ticks: u64,
    inputs_done_at: u64,
}

pub enum Completion {
    Done(Outcome),
    Pending(oneshot::Receiver<Outcome>),
}

/// A run whose inputs have been consumed.
pub struct Dispatched {
    pub record: RunRecord,
    pub completion: Completion,
}

impl Dispatched {
    /// Wait for the run to finish. A run whose slot was abandoned counts as
    /// timed out.
    pub async fn outcome(self) -> (RunRecord, Outcome) {
        let outcome = match self.completion {
            Completion::Done(outcome) => outcome,
            Completion::Pending(receiver) => receiver.await.unwrap_or_else(|_| timed_out()),
        };
        (self.record, outcome)
    }
}

fn timed_out() -> Outcome {
    Outcome {
        status: RunStatus::Timeout,
        output: Vec::new(),
    }
}

pub struct InferenceEngine {
    pub entity: Rc<Entity>,
    ctx: Rc<PipelineContext>,
    accelerator: Rc<dyn Accelerator>,
    spawner: Spawner,
    ring: Rc<ResultRing>,
    sequence: Cell<u64>,
}

impl InferenceEngine {
    #[must_use]
    pub fn new(
        ctx: &Rc<PipelineContext>,
        accelerator: Rc<dyn Accelerator>,
        spawner: Spawner,
        ring: Rc<ResultRing>,
    ) -> Rc<Self> {
        Rc::new(Self {
            entity: Rc::new(Entity::new(&ctx.entity, "inference")),
            ctx: ctx.clone(),
            accelerator,
            spawner,
            ring,
            sequence: Cell::new(0),
        })
    }

    #[must_use]
    pub fn context(&self) -> &Rc<PipelineContext> {
        &self.ctx
    }

    /// Runs currently parked in result slots.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.ring.in_flight()
    }

    /// Check `inputs` against model `model_id` and build the hardware set-up.
    pub fn prepare(&self, model_id: u32, inputs: &[InputImage<'_>]) -> Result<PreparedRun, ErrorCode> {
        let model = self
            .ctx
            .device
            .find_model(model_id)
            .ok_or(ErrorCode::ModelNotLoaded)?;
        if inputs.len() != model.input_count as usize {
            debug!(self.entity ; "model {model_id} takes {} inputs, got {}",
                model.input_count, inputs.len());
            return Err(ErrorCode::WrongInputBufferCount);
        }
        if model.width == 0 || model.height == 0 {
            return Err(ErrorCode::ModelNotLoaded);
        }

        let inputs = inputs
            .iter()
            .map(|input| match input {
                InputImage::Processed { header, image } => setup_processed(&model, header, image),
                InputImage::Bypass { image } => setup_bypass(&model, image),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PreparedRun { model, inputs })
    }

    /// Run `prepared`, sending its result to the host in `result`.
    ///
    /// Returns once the inputs have been consumed. In parallel mode the
    /// result is written by a separate task when the run completes.
    pub async fn dispatch(
        self: &Rc<Self>,
        prepared: PreparedRun,
        inputs: &[InputImage<'_>],
        meta: ResultMeta,
    ) -> Result<(), ErrorCode> {
        let result = self
            .ctx
            .fifoq
            .result_get_free_buffer(Timeout::Forever)
            .await
            .map_err(|_| ErrorCode::PostProcMallocFailed)?;

        let snapshot = (self.ctx.checkpoint_flags() & CHECKPOINT_AFTER_PREPROCESS != 0)
            .then(|| inputs.first().map(|input| input.image().to_vec()))
            .flatten();
        let dispatched = self.run(prepared).await;
        if let Some(snapshot) = snapshot {
            self.emit_checkpoint(CHECKPOINT_AFTER_PREPROCESS, dispatched.record.model_id, &snapshot)
                .await;
        }
        self.complete(dispatched, result, meta).await;
        Ok(())
    }

    /// Start `prepared` on the accelerator, blocking or through a result
    /// slot depending on the configuration.
    pub async fn run(&self, prepared: PreparedRun) -> Dispatched {
        let sequence = self.sequence.get();
        self.sequence.set(sequence + 1);
        if self.ctx.config.parallel {
            self.run_parallel(sequence, prepared).await
        } else {
            self.run_blocking(sequence, prepared).await
        }
    }

    async fn run_blocking(&self, sequence: u64, prepared: PreparedRun) -> Dispatched {
        let flags = self.accelerator.completion_flags();
        let record = self.start(sequence, BLOCKING_FLAG, prepared).await;

        let outcome = loop {
            let signalled = with_timeout(
                &self.ctx.clock,
                self.ctx.result_timeout(),
                flags.wait_any(BLOCKING_FLAG),
            )
            .await;
            if signalled.is_none() {
                warn!(self.entity ; "run {sequence} timed out");
                self.accelerator.discard(sequence);
                break timed_out();
            }
            if let Some(outcome) = self.accelerator.take_outcome(sequence) {
                break outcome;
            }
            trace!(self.entity ; "stale completion while waiting for run {sequence}");
        };

        Dispatched {
            record,
            completion: Completion::Done(outcome),
        }
    }

    async fn run_parallel(&self, sequence: u64, prepared: PreparedRun) -> Dispatched {
        let index = self.ring.next_free().await;
        let (reply, receiver) = oneshot::channel();
        self.ring.occupy(index, InFlight { sequence, reply });
        trace!(self.entity ; "run {sequence} in slot {index}");

        let record = self.start(sequence, 1 << index, prepared).await;
        Dispatched {
            record,
            completion: Completion::Pending(receiver),
        }
    }

    async fn start(&self, sequence: u64, flag: u32, prepared: PreparedRun) -> RunRecord {
        let model_id = prepared.model.model_id;
        let job = HardwareJob {
            sequence,
            flag,
            model: prepared.model,
            inputs: prepared.inputs,
        };
        let started_at = self.ctx.clock.tick_now();
        let receipt = self.accelerator.start(job).await;
        let inputs_done_at = self.ctx.clock.tick_now();

        let applied = receipt
            .applied
            .iter()
            .map(|applied| {
                let mut info = applied.pre_proc;
                info.crop_area =
                    applied
                        .crop
                        .area(info.crop_area.crop_number, info.img_width, info.img_height);
                info
            })
            .collect();

        RunRecord {
            sequence,
            model_id,
            applied,
            inference_ticks: inputs_done_at - started_at,
            inputs_done_at,
        }
    }

    /// Write the result of `dispatched` into `result` once it is known.
    pub async fn complete(self: &Rc<Self>, dispatched: Dispatched, result: Buffer, meta: ResultMeta) {
        match dispatched.completion {
            Completion::Done(outcome) => {
                self.write_result(dispatched.record, outcome, result, meta)
                    .await;
            }
            Completion::Pending(receiver) => {
                let this = self.clone();
                let record = dispatched.record;
                self.spawner.spawn(async move {
                    let outcome = receiver.await.unwrap_or_else(|_| timed_out());
                    this.write_result(record, outcome, result, meta).await;
                    Ok(())
                });
            }
        }
    }

    async fn write_result(&self, record: RunRecord, outcome: Outcome, mut result: Buffer, meta: ResultMeta) {
        let now = self.ctx.clock.tick_now();
        self.ctx
            .record_run(record.inference_ticks, now.saturating_sub(record.inputs_done_at));

        if outcome.status == RunStatus::Done
            && self.ctx.checkpoint_flags() & CHECKPOINT_AFTER_INFERENCE != 0
        {
            self.emit_checkpoint(CHECKPOINT_AFTER_INFERENCE, record.model_id, &outcome.output)
                .await;
        }

        let mut status = outcome.status.error_code();
        let mut output = &outcome.output[..];
        if RESULT_HEADER_SIZE + output.len() > result.capacity() {
            warn!(self.entity ; "{} byte output of run {} does not fit", output.len(), record.sequence);
            status = ErrorCode::PostProcNoSpace;
            output = &[];
        }

        let header = ResultHeader {
            stamp: HeaderStamp::new(
                MagicType::Inference,
                (RESULT_HEADER_SIZE + output.len()) as u32,
                meta.job_id,
            )
            .with_status(status),
            pre_proc: record.applied,
            product_id: self.ctx.device.identity().product_id,
            inference_number: meta.inference_number,
            crop_number: meta.crop_number,
            is_last_crop: true,
        };
        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(output);
        result.fill_from(&bytes);

        debug!(self.entity ; "job {} run {} result {status}", meta.job_id, record.sequence);
        self.queue_result(result, false).await;
    }

    /// Answer job `job_id` with a bare header stamp carrying `status`.
    pub async fn reject(&self, job_id: u32, status: ErrorCode) {
        let mut result = match self.ctx.fifoq.result_get_free_buffer(Timeout::Forever).await {
            Ok(result) => result,
            Err(e) => {
                warn!(self.entity ; "no result buffer to report {status} for job {job_id}: {e}");
                return;
            }
        };
        let stamp = HeaderStamp::new(MagicType::Inference, HEADER_STAMP_SIZE as u32, job_id)
            .with_status(status);
        result.fill_from(&stamp.to_bytes());
        self.queue_result(result, false).await;
    }

    /// Dump `data` ahead of the regular results. Skipped when no result
    /// buffer is free.
    async fn emit_checkpoint(&self, tag: u32, model_id: u32, data: &[u8]) {
        let mut buffer = match self.ctx.fifoq.result_get_free_buffer(Timeout::Immediate).await {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(self.entity ; "checkpoint {tag:#x} skipped: {e}");
                return;
            }
        };
        let room = buffer.capacity().saturating_sub(CHECKPOINT_HEADER_SIZE);
        let data = &data[..data.len().min(room)];
        let header = CheckpointHeader {
            stamp: HeaderStamp::new(
                MagicType::Checkpoint,
                (CHECKPOINT_HEADER_SIZE + data.len()) as u32,
                0,
            ),
            checkpoint_tag: tag,
            model_id,
            data_size: data.len() as u32,
        };
        let mut bytes = Vec::with_capacity(CHECKPOINT_HEADER_SIZE + data.len());
        header.encode_into(&mut bytes);
        bytes.extend_from_slice(data);
        buffer.fill_from(&bytes);
        self.queue_result(buffer, true).await;
    }

    async fn queue_result(&self, buffer: Buffer, preempt: bool) {
        if let Err(rejected) = self.ctx.fifoq.result_enqueue(buffer, preempt).await {
            warn!(self.entity ; "result dropped: {}", rejected.error);
            self.ctx.fifoq.result_release(rejected.item).await;
        }
    }
}

fn setup_bypass(model: &ModelInfo, image: &[u8]) -> Result<InputSetup, ErrorCode> {
    let wanted = (model.width as usize)
        .checked_mul(model.height as usize)
        .and_then(|pixels| pixels.checked_mul(model.channels.max(1) as usize));
    if wanted.is_none_or(|wanted| image.len() < wanted) {
        return Err(ErrorCode::ImageSizeNotMatchModelInput);
    }
    Ok(InputSetup {
        image_len: image.len(),
        format: None,
        subtract_128: false,
        right_shift: false,
        change_aspect_ratio: false,
        symmetric_padding: false,
        crop: CropMargins::default(),
        pre_proc: PreProcInfo {
            img_width: model.width,
            img_height: model.height,
            resized_width: model.width,
            resized_height: model.height,
            model_width: model.width,
            model_height: model.height,
            crop_area: CropBox {
                width: model.width,
                height: model.height,
                ..CropBox::default()
            },
            ..PreProcInfo::default()
        },
    })
}

fn setup_processed(model: &ModelInfo, header: &ImageHeader, image: &[u8]) -> Result<InputSetup, ErrorCode> {
    let format = header.format().ok_or(ErrorCode::NotSupportPreprocessing)?;
    let (width, height) = (header.width, header.height);
    if width == 0 || height == 0 || width < model.width || height < model.height {
        return Err(ErrorCode::ImageResolutionTooSmall);
    }
    let bpp = format.bytes_per_pixel();
    let row_bytes = width.checked_mul(bpp).ok_or(ErrorCode::ImageInvalidWidth)?;
    if row_bytes % 4 != 0 {
        return Err(ErrorCode::ImageInvalidWidth);
    }

    let crop = match header.crop() {
        Some(crop) => {
            let inside = crop.width > 0
                && crop.height > 0
                && crop.x1.checked_add(crop.width).is_some_and(|right| right <= width)
                && crop.y1.checked_add(crop.height).is_some_and(|bottom| bottom <= height);
            if !inside {
                return Err(ErrorCode::InvalidInputCropParam);
            }
            crop
        }
        None => CropBox {
            width,
            height,
            ..CropBox::default()
        },
    };

    let resize = header.resize().ok_or(ErrorCode::NotSupportPreprocessing)?;
    let padding = header.padding().ok_or(ErrorCode::NotSupportPreprocessing)?;
    let layout = fit(model, crop.width, crop.height, resize, padding)?;

    let normalize = header.normalize().ok_or(ErrorCode::NotSupportPreprocessing)?;
    let (subtract_128, right_shift) = normalize.hardware_flags();

    let image_len = (row_bytes as usize)
        .checked_mul(height as usize)
        .filter(|&len| len <= image.len())
        .ok_or(ErrorCode::ImageSizeNotMatchModelInput)?;

    Ok(InputSetup {
        image_len,
        format: Some(format.hardware_format()),
        subtract_128,
        right_shift,
        change_aspect_ratio: layout.change_aspect_ratio,
        symmetric_padding: padding == PaddingMode::Symmetric,
        crop: CropMargins::of(&crop, width, height),
        pre_proc: PreProcInfo {
            img_width: width,
            img_height: height,
            resized_width: layout.resized.0,
            resized_height: layout.resized.1,
            pad_top: layout.pad_top,
            pad_bottom: layout.pad_bottom,
            pad_left: layout.pad_left,
            pad_right: layout.pad_right,
            model_width: model.width,
            model_height: model.height,
            crop_area: crop,
        },
    })
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Layout {
    resized: (u32, u32),
    pad_top: u32,
    pad_bottom: u32,
    pad_left: u32,
    pad_right: u32,
    change_aspect_ratio: bool,
}

/// Fit a `width` by `height` source into the model input.
fn fit(
    model: &ModelInfo,
    width: u32,
    height: u32,
    resize: ResizeMode,
    padding: PaddingMode,
) -> Result<Layout, ErrorCode> {
    let target = (model.width, model.height);
    match (resize, padding) {
        (ResizeMode::Disable, PaddingMode::Disable) => {
            if (width, height) == target {
                Ok(Layout {
                    resized: target,
                    ..Layout::default()
                })
            } else {
                Err(ErrorCode::ImageSizeNotMatchModelInput)
            }
        }
        (ResizeMode::Disable, _) => Err(ErrorCode::NotSupportPreprocessing),
        (ResizeMode::Enable, PaddingMode::Disable) => Ok(Layout {
            resized: target,
            change_aspect_ratio: true,
            ..Layout::default()
        }),
        (ResizeMode::Enable, padding) => {
            let (mw, mh) = (u64::from(model.width), u64::from(model.height));
            let (w, h) = (u64::from(width), u64::from(height));
            // Scale the longer side to the model and keep the aspect ratio.
            let (rw, rh) = if w * mh >= h * mw {
                (mw, (h * mw / w).max(1))
            } else {
                ((w * mh / h).max(1), mh)
            };
            let (rw, rh) = (rw as u32, rh as u32);
            let pad_w = model.width - rw;
            let pad_h = model.height - rh;
            let mut layout = Layout {
                resized: (rw, rh),
                ..Layout::default()
            };
            if padding == PaddingMode::Symmetric {
                layout.pad_left = pad_w / 2;
                layout.pad_right = pad_w - pad_w / 2;
                layout.pad_top = pad_h / 2;
                layout.pad_bottom = pad_h - pad_h / 2;
            } else {
                layout.pad_right = pad_w;
                layout.pad_bottom = pad_h;
            }
            Ok(layout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::inference::{ImageFormat, NormalizeMode};

    fn model() -> ModelInfo {
        ModelInfo {
            model_id: 211,
            input_count: 1,
            width: 224,
            height: 224,
            channels: 3,
            output_size: 1000,
        }
    }

    fn header(width: u32, height: u32, resize: ResizeMode, padding: PaddingMode) -> ImageHeader {
        ImageHeader {
            width,
            height,
            resize_mode: resize as u32,
            padding_mode: padding as u32,
            image_format: ImageFormat::Rgb565 as u32,
            normalize_mode: NormalizeMode::Kneron as u32,
            ..ImageHeader::default()
        }
    }

    fn image_for(header: &ImageHeader) -> Vec<u8> {
        vec![0; (header.width * header.height * 2) as usize]
    }

    #[test]
    fn exact_size_without_resize() {
        let header = header(224, 224, ResizeMode::Disable, PaddingMode::Disable);
        let setup = setup_processed(&model(), &header, &image_for(&header)).unwrap();
        assert_eq!(setup.pre_proc.resized_width, 224);
        assert!(setup.subtract_128);
        assert!(!setup.change_aspect_ratio);
        assert_eq!(setup.crop, CropMargins::default());
    }

    #[test]
    fn size_mismatch_needs_resize() {
        let header = header(640, 480, ResizeMode::Disable, PaddingMode::Disable);
        assert_eq!(
            setup_processed(&model(), &header, &image_for(&header)),
            Err(ErrorCode::ImageSizeNotMatchModelInput)
        );
    }

    #[test]
    fn padding_without_resize_is_unsupported() {
        let header = header(224, 224, ResizeMode::Disable, PaddingMode::Corner);
        assert_eq!(
            setup_processed(&model(), &header, &image_for(&header)),
            Err(ErrorCode::NotSupportPreprocessing)
        );
    }

    #[test]
    fn symmetric_padding_splits_the_margin() {
        let header = header(640, 480, ResizeMode::Enable, PaddingMode::Symmetric);
        let setup = setup_processed(&model(), &header, &image_for(&header)).unwrap();
        assert!(setup.symmetric_padding);
        assert_eq!(
            (setup.pre_proc.resized_width, setup.pre_proc.resized_height),
            (224, 168)
        );
        assert_eq!((setup.pre_proc.pad_top, setup.pre_proc.pad_bottom), (28, 28));
    }

    #[test]
    fn resize_without_padding_stretches() {
        let header = header(640, 480, ResizeMode::Enable, PaddingMode::Disable);
        let setup = setup_processed(&model(), &header, &image_for(&header)).unwrap();
        assert!(setup.change_aspect_ratio);
    }

    #[test]
    fn small_or_odd_images_are_refused() {
        let small = header(100, 100, ResizeMode::Enable, PaddingMode::Corner);
        assert_eq!(
            setup_processed(&model(), &small, &image_for(&small)),
            Err(ErrorCode::ImageResolutionTooSmall)
        );

        let mut odd = header(225, 224, ResizeMode::Enable, PaddingMode::Corner);
        odd.image_format = ImageFormat::Raw8 as u32;
        assert_eq!(
            setup_processed(&model(), &odd, &[0; 225 * 224]),
            Err(ErrorCode::ImageInvalidWidth)
        );
    }

    #[test]
    fn extreme_dimensions_are_refused() {
        let wide = header(0x8000_0000, 224, ResizeMode::Enable, PaddingMode::Corner);
        assert_eq!(
            setup_processed(&model(), &wide, &[0; 64]),
            Err(ErrorCode::ImageInvalidWidth)
        );

        let mut huge = header(u32::MAX - 3, u32::MAX, ResizeMode::Enable, PaddingMode::Corner);
        huge.image_format = ImageFormat::Raw8 as u32;
        assert_eq!(
            setup_processed(&model(), &huge, &[0; 64]),
            Err(ErrorCode::ImageSizeNotMatchModelInput)
        );

        let empty = ModelInfo {
            width: 0,
            height: 0,
            ..model()
        };
        let nothing = header(0, 0, ResizeMode::Enable, PaddingMode::Corner);
        assert_eq!(
            setup_processed(&empty, &nothing, &[]),
            Err(ErrorCode::ImageResolutionTooSmall)
        );
    }

    #[test]
    fn crop_must_lie_inside_the_image() {
        let mut header = header(640, 480, ResizeMode::Enable, PaddingMode::Corner);
        header.crop_count = 1;
        header.crops[0] = CropBox {
            crop_number: 0,
            x1: 600,
            y1: 0,
            width: 100,
            height: 100,
        };
        assert_eq!(
            setup_processed(&model(), &header, &image_for(&header)),
            Err(ErrorCode::InvalidInputCropParam)
        );

        header.crops[0].x1 = 100;
        let setup = setup_processed(&model(), &header, &image_for(&header)).unwrap();
        assert_eq!(setup.crop.left, 100);
        assert_eq!(setup.crop.right, 440);
        assert_eq!(setup.pre_proc.resized_width, 224);
    }

    #[test]
    fn short_image_data_is_refused() {
        let header = header(224, 224, ResizeMode::Disable, PaddingMode::Disable);
        assert_eq!(
            setup_processed(&model(), &header, &[0; 100]),
            Err(ErrorCode::ImageSizeNotMatchModelInput)
        );
    }
}
