// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Serve requests on the control channel.
//!
//! Control requests are small and are answered at once; a request that is
//! not handled stalls on the host side.

use std::rc::Rc;

use async_trait::async_trait;
use npu_engine::engine::Engine;
use npu_engine::traits::Runnable;
use npu_engine::types::SimResult;
use npu_track::entity::Entity;
use npu_track::{debug, info, warn};

use crate::context::PipelineContext;
use crate::device::RebootKind;
use crate::fifoq::{ConfigureOutcome, FifoqConfig};
use crate::framing::control::{ControlOpcode, ControlRequest};
use crate::transport::Endpoint;

pub struct ControlHandler {
    pub entity: Rc<Entity>,
    ctx: Rc<PipelineContext>,
}

impl ControlHandler {
    pub fn new_and_register(engine: &Engine, ctx: &Rc<PipelineContext>) -> Rc<Self> {
        let rc_self = Rc::new(Self {
            entity: Rc::new(Entity::new(&ctx.entity, "control")),
            ctx: ctx.clone(),
        });
        engine.register(rc_self.clone());
        rc_self
    }

    /// Act on `request`. Returns whether it was handled.
    pub fn handle(&self, request: &ControlRequest) -> bool {
        debug!(self.entity ; "{request}");

        let Some(opcode) = request.opcode() else {
            warn!(self.entity ; "{request} not supported");
            return false;
        };

        match opcode {
            ControlOpcode::QueueReset => {
                if !self.ctx.fifoq.is_allocated() {
                    return false;
                }
                self.ctx.request_reset();
                self.ctx.set_droppable(false);
                self.ctx.transport.terminate(Endpoint::DataOut);
                self.ctx.transport.terminate(Endpoint::DataIn);
                true
            }
            ControlOpcode::QueueStatus => {
                match self.ctx.fifoq.status() {
                    Some(status) => info!(self.entity ; "{status:?}"),
                    None => info!(self.entity ; "queues not configured"),
                }
                true
            }
            ControlOpcode::QueueConfigure => {
                let config = FifoqConfig::from_control_words(request.value, request.index);
                match self.ctx.fifoq.configure(config) {
                    ConfigureOutcome::Allocated => true,
                    ConfigureOutcome::AlreadyConfigured => false,
                }
            }
            ControlOpcode::EnableDroppable => {
                self.ctx.set_droppable(request.value == 1);
                true
            }
            ControlOpcode::DdrHeapBoundary => {
                self.ctx.device.set_heap_boundary(request.address());
                true
            }
            ControlOpcode::Reboot => {
                self.ctx.device.reboot(RebootKind::Reboot);
                true
            }
            ControlOpcode::Shutdown => {
                self.ctx.device.reboot(RebootKind::Shutdown);
                true
            }
            ControlOpcode::RebootSystem => {
                self.ctx.device.reboot(RebootKind::RebootSystem);
                true
            }
        }
    }
}

#[async_trait(?Send)]
impl Runnable for ControlHandler {
    async fn run(&self) -> SimResult {
        loop {
            let transfer = self.ctx.transport.next_control().await;
            let handled = self.handle(&transfer.request);
            transfer.respond(handled);
        }
    }
}
