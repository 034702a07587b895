// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Hand complete jobs to their applications.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use npu_engine::engine::Engine;
use npu_engine::time::timeout::Timeout;
use npu_engine::traits::Runnable;
use npu_engine::types::SimResult;
use npu_track::entity::Entity;
use npu_track::{debug, info, warn};

use crate::context::PipelineContext;
use crate::error::ErrorCode;
use crate::framing::header::{FIRST_CUSTOM_JOB_ID, HeaderStamp};
use crate::framing::inference::{JOB_GENERIC_RAW, JOB_GENERIC_RAW_BYPASS};
use crate::inference::InferenceApp;
use crate::inference::apps::{BypassApp, GenericRawApp};
use crate::inference::engine::InferenceEngine;

pub struct Dispatcher {
    pub entity: Rc<Entity>,
    ctx: Rc<PipelineContext>,
    engine: Rc<InferenceEngine>,
    apps: RefCell<HashMap<u32, Rc<dyn InferenceApp>>>,
}

impl Dispatcher {
    pub fn new_and_register(
        engine: &Engine,
        ctx: &Rc<PipelineContext>,
        inference: Rc<InferenceEngine>,
    ) -> Rc<Self> {
        let mut apps: HashMap<u32, Rc<dyn InferenceApp>> = HashMap::new();
        apps.insert(JOB_GENERIC_RAW, Rc::new(GenericRawApp));
        apps.insert(JOB_GENERIC_RAW_BYPASS, Rc::new(BypassApp));

        let rc_self = Rc::new(Self {
            entity: Rc::new(Entity::new(&ctx.entity, "dispatcher")),
            ctx: ctx.clone(),
            engine: inference,
            apps: RefCell::new(apps),
        });
        engine.register(rc_self.clone());
        rc_self
    }

    /// Serve job id `job_id` with `app`. Only custom job ids can be
    /// registered; a later registration replaces an earlier one.
    pub fn register_app(&self, job_id: u32, app: Rc<dyn InferenceApp>) -> Result<(), ErrorCode> {
        if job_id < FIRST_CUSTOM_JOB_ID {
            return Err(ErrorCode::InvalidCustomizedJobId);
        }
        info!(self.entity ; "application registered for job {job_id}");
        self.apps.borrow_mut().insert(job_id, app);
        Ok(())
    }

    fn app_for(&self, job_id: u32) -> Option<Rc<dyn InferenceApp>> {
        self.apps.borrow().get(&job_id).cloned()
    }
}

#[async_trait(?Send)]
impl Runnable for Dispatcher {
    async fn run(&self) -> SimResult {
        self.ctx.fifoq.wait_allocated().await;

        loop {
            let job = self.ctx.fifoq.image_dequeue(Timeout::Forever).await?;
            let first = job.get(0).map(|buffer| buffer.bytes()).unwrap_or_default();

            match HeaderStamp::decode(first) {
                Ok(stamp) => {
                    debug!(self.entity ; "job {} with {} buffers", stamp.job_id, job.len());
                    let outcome = match self.app_for(stamp.job_id) {
                        Some(app) => app.run(&self.engine, stamp, &job).await,
                        None => Err(ErrorCode::UnknownApp),
                    };
                    if let Err(status) = outcome {
                        warn!(self.entity ; "job {} failed: {status}", stamp.job_id);
                        self.engine.reject(stamp.job_id, status).await;
                    }
                }
                Err(e) => warn!(self.entity ; "dropping job: {e}"),
            }

            self.ctx.fifoq.image_release(job).await;
        }
    }
}
