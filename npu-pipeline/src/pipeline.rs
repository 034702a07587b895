// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Assembly of a complete pipeline.
//!
//! [`Pipeline::new_and_register`] wires the tasks of one device pipeline
//! onto an engine:
//!
//! ```text
//!  host ──data-out──▶ Receiver ──image queue──▶ Dispatcher ──▶ accelerator
//!   ▲                   │ (commands)                │               │
//!   │                   ▼                           ▼               ▼
//!   └──data-in── Sender ◀──result queue── InferenceEngine ◀── ResultHandler
//! ```
//!
//! The control channel is served by a separate [`ControlHandler`].
//! [`SimulatedSystem`] adds the simulated link, device and accelerator and a
//! host client.

use std::rc::Rc;

use npu_engine::engine::Engine;
use npu_track::entity::Entity;
use npu_track::info;

use crate::accelerator::{Accelerator, SimAccelerator};
use crate::config::{ConfigError, PipelineConfig};
use crate::context::PipelineContext;
use crate::control_handler::ControlHandler;
use crate::device::{DeviceServices, SimDevice};
use crate::error::ErrorCode;
use crate::fifoq::FifoQueueManager;
use crate::host::HostDevice;
use crate::inference::InferenceApp;
use crate::inference::dispatcher::Dispatcher;
use crate::inference::engine::InferenceEngine;
use crate::inference::result_handler::{ResultHandler, ResultRing};
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::transport::{Transport, UsbLink};

pub struct Pipeline {
    pub entity: Rc<Entity>,
    pub ctx: Rc<PipelineContext>,
    pub inference: Rc<InferenceEngine>,
    pub dispatcher: Rc<Dispatcher>,
}

impl Pipeline {
    pub fn new_and_register(
        engine: &Engine,
        parent: &Rc<Entity>,
        config: PipelineConfig,
        transport: Rc<dyn Transport>,
        device: Rc<dyn DeviceServices>,
        accelerator: Rc<dyn Accelerator>,
    ) -> Result<Rc<Self>, ConfigError> {
        config.validate()?;

        let clock = engine.default_clock();
        let entity = Rc::new(Entity::new(parent, "pipeline"));
        let fifoq = FifoQueueManager::new_and_register(engine, &clock, &entity);
        let slots = config.result_slots;
        let ctx = PipelineContext::new(&entity, &clock, config, fifoq, device, transport);

        let ring = Rc::new(ResultRing::new(slots));
        let inference = InferenceEngine::new(&ctx, accelerator.clone(), engine.spawner(), ring.clone());
        ResultHandler::new_and_register(engine, &ctx, accelerator, ring);
        let dispatcher = Dispatcher::new_and_register(engine, &ctx, inference.clone());
        Receiver::new_and_register(engine, &ctx);
        Sender::new_and_register(engine, &ctx);
        ControlHandler::new_and_register(engine, &ctx);

        info!(entity ; "{} mode with {slots} result slots",
            if ctx.config.parallel { "parallel" } else { "blocking" });

        Ok(Rc::new(Self {
            entity,
            ctx,
            inference,
            dispatcher,
        }))
    }

    /// Serve custom job id `job_id` with `app`.
    pub fn register_app(&self, job_id: u32, app: Rc<dyn InferenceApp>) -> Result<(), ErrorCode> {
        self.dispatcher.register_app(job_id, app)
    }
}

/// A pipeline with simulated collaborators and a host attached to its link.
pub struct SimulatedSystem {
    pub link: Rc<UsbLink>,
    pub device: Rc<SimDevice>,
    pub accelerator: Rc<SimAccelerator>,
    pub pipeline: Rc<Pipeline>,
    pub host: HostDevice,
}

impl SimulatedSystem {
    pub fn new_and_register(engine: &Engine, config: PipelineConfig) -> Result<Self, ConfigError> {
        let clock = engine.default_clock();
        let top = engine.top();
        let link = UsbLink::new(&clock, top);
        let device = SimDevice::new(top, config.firmware);
        let accelerator = SimAccelerator::new_and_register(engine, &clock, top, config.accelerator);
        let host = HostDevice::new(top, link.host_port(), config.host_chunk_size);
        let pipeline = Pipeline::new_and_register(
            engine,
            top,
            config,
            link.clone(),
            device.clone(),
            accelerator.clone(),
        )?;
        Ok(Self {
            link,
            device,
            accelerator,
            pipeline,
            host,
        })
    }
}
