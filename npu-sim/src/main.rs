// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Stream a host inference workload through a simulated device.
//!
//! The host configures the device queues over the control channel, then
//! keeps a window of requests outstanding while it collects results. At the
//! end a summary of the completed jobs and the link throughput is logged.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use byte_unit::{AdjustedByte, Byte, UnitType};
use clap::Parser;
use figment::providers::Serialized;
use indicatif::ProgressBar;
use itertools::Itertools;
use npu_engine::engine::{Engine, FINISH_MESSAGE};
use npu_engine::executor::Spawner;
use npu_engine::sim_error;
use npu_engine::time::timeout::Timeout;
use npu_pipeline::config::PipelineConfig;
use npu_pipeline::error::ErrorCode;
use npu_pipeline::fifoq::{FifoqConfig, QUEUE_SIZE_UNIT};
use npu_pipeline::framing::command::ModelInfo;
use npu_pipeline::framing::control::ControlRequest;
use npu_pipeline::framing::inference::{
    BYPASS_HEADER_SIZE, GENERIC_RAW_HEADER_SIZE, ImageFormat, ImageHeader, NormalizeMode,
    PaddingMode, RESULT_HEADER_SIZE, ResizeMode,
};
use npu_pipeline::host::HostDevice;
use npu_pipeline::pipeline::SimulatedSystem;
use npu_track::builder::{TrackerConfig, TrackersConfig, setup_trackers};
use npu_track::entity::Entity;
use npu_track::{error, info};

/// Command-line arguments.
#[derive(Parser)]
#[command(about = "Simulated inference pipeline workload")]
struct Cli {
    /// Enable logging to the console.
    #[arg(long, default_value = "false")]
    stdout: bool,

    /// Level of log message to display.
    #[arg(long, default_value = "Info")]
    stdout_level: log::Level,

    /// Set a regular expression for which entities should have logging level set
    /// to `--stdout-level`. Others will have level set to `Error`.
    #[arg(long, default_value = "")]
    stdout_filter_regex: String,

    /// Write log messages to this file as well.
    #[arg(long)]
    log_file: Option<String>,

    /// Level of log message to write to `--log-file`.
    #[arg(long, default_value = "Debug")]
    log_file_level: log::Level,

    /// Set a regular expression for which entities should have file logging
    /// level set to `--log-file-level`.
    #[arg(long, default_value = "")]
    log_file_filter_regex: String,

    /// TOML file of pipeline settings. `NPU_` environment variables override
    /// it, and the options below override both.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of parallel result slots.
    #[arg(long)]
    result_slots: Option<usize>,

    /// Wait for each inference to finish before dispatching the next.
    #[arg(long)]
    blocking: bool,

    /// Accelerator ticks spent on inference.
    #[arg(long)]
    inference_ticks: Option<u64>,

    /// Accelerator ticks spent on post-processing.
    #[arg(long)]
    postprocess_ticks: Option<u64>,

    /// Number of inference requests to send.
    #[arg(long, default_value = "100")]
    jobs: usize,

    /// Maximum number of requests the host keeps outstanding.
    #[arg(long, default_value = "4")]
    window: usize,

    /// Send raw model input with the bypass job rather than RGB565 images.
    #[arg(long)]
    bypass: bool,

    /// Width of each input image.
    #[arg(long, default_value = "224")]
    width: u32,

    /// Height of each input image.
    #[arg(long, default_value = "224")]
    height: u32,

    /// Bytes of output the model produces per inference.
    #[arg(long, default_value = "1000")]
    output_size: u32,

    /// Number of image buffers the device allocates.
    #[arg(long, default_value = "4")]
    image_buffers: usize,

    /// Number of result buffers the device allocates.
    #[arg(long, default_value = "4")]
    result_buffers: usize,

    /// Let the device drop the oldest queued image instead of stalling the
    /// link when it runs out of image buffers.
    #[arg(long)]
    droppable: bool,

    /// Show a progress bar of the results received.
    #[arg(long)]
    progress: bool,

    /// Configure a clock tick on which to terminate the simulation. Use 0 to
    /// run until completion.
    #[arg(long, default_value = "0")]
    finish_tick: u64,
}

const MODEL_ID: u32 = 1;

/// What the host saw of the workload.
#[derive(Default)]
struct Summary {
    sent_bytes: u64,
    received_bytes: u64,
    statuses: Vec<ErrorCode>,
    completed: usize,
}

impl Cli {
    fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut figment = PipelineConfig::figment(self.config.as_deref());
        if let Some(slots) = self.result_slots {
            figment = figment.merge(Serialized::default("result_slots", slots));
        }
        if self.blocking {
            figment = figment.merge(Serialized::default("parallel", false));
        }
        if let Some(ticks) = self.inference_ticks {
            figment = figment.merge(Serialized::default("accelerator.inference_ticks", ticks));
        }
        if let Some(ticks) = self.postprocess_ticks {
            figment = figment.merge(Serialized::default("accelerator.postprocess_ticks", ticks));
        }
        Ok(PipelineConfig::from_figment(&figment)?)
    }

    fn model(&self) -> ModelInfo {
        ModelInfo {
            model_id: MODEL_ID,
            input_count: 1,
            width: self.width,
            height: self.height,
            channels: 3,
            output_size: self.output_size,
        }
    }

    fn request_bytes(&self) -> usize {
        let pixels = (self.width * self.height) as usize;
        if self.bypass {
            BYPASS_HEADER_SIZE + pixels * 3
        } else {
            GENERIC_RAW_HEADER_SIZE + pixels * 2
        }
    }

    /// Buffers sized in whole queue units to hold one request and one result.
    fn queues(&self) -> FifoqConfig {
        FifoqConfig {
            image_count: self.image_buffers,
            image_size: self.request_bytes().div_ceil(QUEUE_SIZE_UNIT) * QUEUE_SIZE_UNIT,
            result_count: self.result_buffers,
            result_size: (RESULT_HEADER_SIZE + self.output_size as usize)
                .div_ceil(QUEUE_SIZE_UNIT)
                * QUEUE_SIZE_UNIT,
        }
    }
}

fn image_header(width: u32, height: u32) -> ImageHeader {
    ImageHeader {
        width,
        height,
        resize_mode: ResizeMode::Disable as u32,
        padding_mode: PaddingMode::Disable as u32,
        image_format: ImageFormat::Rgb565 as u32,
        normalize_mode: NormalizeMode::Kneron as u32,
        ..ImageHeader::default()
    }
}

/// Everything the host task needs to generate its requests.
struct Workload {
    jobs: usize,
    window: usize,
    bypass: bool,
    width: u32,
    height: u32,
    queues: FifoqConfig,
    droppable: bool,
}

impl Workload {
    fn send(&self, host: &HostDevice, number: u32, input: &[u8]) -> Result<(), ErrorCode> {
        if self.bypass {
            host.send_bypass(number, MODEL_ID, &[input])?;
        } else {
            host.send_generic_raw(number, MODEL_ID, &image_header(self.width, self.height), input)?;
        }
        Ok(())
    }
}

fn start_host(
    spawner: &Spawner,
    host: HostDevice,
    workload: Workload,
    summary: Rc<RefCell<Summary>>,
    progress_bar: ProgressBar,
) {
    spawner.spawn(async move {
        host.connect();
        if !host.configure_queues(&workload.queues).await? {
            return sim_error!("Device queues were already configured");
        }
        if workload.droppable {
            host.control(ControlRequest::droppable(true)).await?;
        }

        let pixels = (workload.width * workload.height) as usize;
        let input_len = if workload.bypass { pixels * 3 } else { pixels * 2 };
        let input: Vec<u8> = (0..input_len).map(|i| i as u8).collect();

        let mut sent = 0;
        while sent < workload.jobs.min(workload.window.max(1)) {
            workload.send(&host, sent as u32, &input)?;
            sent += 1;
        }

        for _ in 0..workload.jobs {
            let result = host.next_result(Timeout::Forever).await?;
            {
                let mut summary = summary.borrow_mut();
                summary.completed += 1;
                summary.received_bytes += result.output.len() as u64;
                summary.statuses.push(result.status());
            }
            progress_bar.inc(1);

            if sent < workload.jobs {
                workload.send(&host, sent as u32, &input)?;
                sent += 1;
            }
        }
        summary.borrow_mut().sent_bytes = (sent * input_len) as u64;

        host.disconnect();
        Ok(())
    });
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = args.pipeline_config()?;

    let tracker = setup_trackers(&TrackersConfig {
        stdout: TrackerConfig {
            enable: args.stdout,
            level: args.stdout_level,
            filter_regex: &args.stdout_filter_regex,
            file: None,
        },
        log_file: TrackerConfig {
            enable: args.log_file.is_some(),
            level: args.log_file_level,
            filter_regex: &args.log_file_filter_regex,
            file: args.log_file.as_deref(),
        },
    })?;

    let mut engine = Engine::new(&tracker);
    let spawner = engine.spawner();
    let clock = engine.default_clock();
    let top = engine.top().clone();

    info!(top ;
        "Sending {} {} requests of {}x{} with {} result slots ({}).",
        args.jobs,
        if args.bypass { "bypass" } else { "generic raw" },
        args.width,
        args.height,
        config.result_slots,
        if config.parallel { "parallel" } else { "blocking" },
    );

    let system = SimulatedSystem::new_and_register(&engine, config)?;
    system.device.install_models(vec![args.model()]);
    let accelerator = system.accelerator.clone();

    let summary = Rc::new(RefCell::new(Summary::default()));
    let progress_bar = if args.progress {
        ProgressBar::new(args.jobs as u64)
    } else {
        ProgressBar::hidden()
    };
    start_host(
        &spawner,
        system.host,
        Workload {
            jobs: args.jobs,
            window: args.window,
            bypass: args.bypass,
            width: args.width,
            height: args.height,
            queues: args.queues(),
            droppable: args.droppable,
        },
        summary.clone(),
        progress_bar.clone(),
    );

    if args.finish_tick != 0 {
        engine.finish_at(args.finish_tick);
    }

    if let Err(e) = engine.run() {
        if args.finish_tick == 0 || e.0 != FINISH_MESSAGE {
            error!(top ; "Simulation failed at {:.2}ns: {e}", clock.time_now_ns());
            tracker.shutdown();
            return Err(e.into());
        }
    }
    progress_bar.finish();

    let summary = summary.borrow();
    if args.finish_tick == 0 && summary.completed != args.jobs {
        error!(top ; "{}/{} results received", summary.completed, args.jobs);
        error!(top ; "Deadlock detected at {:.2}ns", clock.time_now_ns());
        tracker.shutdown();
        anyhow::bail!("Deadlock");
    }

    print_summary(&top, clock.time_now_ns(), &summary, accelerator.runs());
    tracker.shutdown();
    Ok(())
}

fn print_summary(top: &Rc<Entity>, time_now_ns: f64, summary: &Summary, runs: u64) {
    let time_now_s = time_now_ns / (1000.0 * 1000.0 * 1000.0);
    let (sent, sent_per_second) = compute_adjusted_value_and_rate(time_now_s, summary.sent_bytes);
    let (received, received_per_second) =
        compute_adjusted_value_and_rate(time_now_s, summary.received_bytes);

    info!(top ; "Completed {} jobs ({runs} accelerator runs) in {time_now_ns:.2}ns.", summary.completed);
    info!(top ; "Sent: {sent:.2} ({sent_per_second:.2}/s). Received: {received:.2} ({received_per_second:.2}/s).");
    let counts = summary.statuses.iter().counts();
    for (status, count) in counts.into_iter().sorted_by_key(|(status, _)| **status as i32) {
        info!(top ; "{status:?}: {count}");
    }
}

fn compute_adjusted_value_and_rate(time_now_s: f64, num_bytes: u64) -> (AdjustedByte, AdjustedByte) {
    // Convert to a binary-only unit (KiB, MiB, etc)
    let count = Byte::from_u64(num_bytes).get_appropriate_unit(UnitType::Binary);
    let rate = if time_now_s > 0.0 {
        num_bytes as f64 / time_now_s
    } else {
        0.0
    };
    let per_second = Byte::from_f64(rate).unwrap_or(Byte::from_u64(0));
    (count, per_second.get_appropriate_unit(UnitType::Binary))
}
