// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The send loop: results go to the host in queue order.

use std::cell::Cell;
use std::rc::Rc;

use async_trait::async_trait;
use npu_engine::engine::Engine;
use npu_engine::time::timeout::Timeout;
use npu_engine::traits::Runnable;
use npu_engine::types::SimResult;
use npu_track::entity::Entity;
use npu_track::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::context::PipelineContext;
use crate::framing::header::{HEADER_STAMP_SIZE, HeaderStamp, MagicType, magic_of};

pub struct Sender {
    pub entity: Rc<Entity>,
    ctx: Rc<PipelineContext>,
    in_checkpoint: Cell<bool>,
}

impl Sender {
    pub fn new_and_register(engine: &Engine, ctx: &Rc<PipelineContext>) -> Rc<Self> {
        let rc_self = Rc::new(Self {
            entity: Rc::new(Entity::new(&ctx.entity, "sender")),
            ctx: ctx.clone(),
            in_checkpoint: Cell::new(false),
        });
        engine.register(rc_self.clone());
        rc_self
    }

    async fn write(&self, bytes: &[u8]) {
        if let Err(e) = self.ctx.transport.write(bytes, Timeout::Forever).await {
            warn!(self.entity ; "{} byte message lost: {e}", bytes.len());
        }
    }

    async fn send(&self, buffer: Buffer) {
        let checkpoint = magic_of(buffer.bytes()) == Some(MagicType::Checkpoint.wire());
        if checkpoint {
            self.in_checkpoint.set(true);
        } else if self.in_checkpoint.replace(false) {
            debug!(self.entity ; "leaving checkpoint mode");
            let end = HeaderStamp::new(MagicType::Checkpoint, HEADER_STAMP_SIZE as u32, 0);
            self.write(&end.to_bytes()).await;
        }

        trace!(self.entity ; "send buffer {} ({} bytes)", buffer.id(), buffer.len());
        self.write(buffer.bytes()).await;
        self.ctx.fifoq.result_release(buffer).await;
    }
}

#[async_trait(?Send)]
impl Runnable for Sender {
    async fn run(&self) -> SimResult {
        self.ctx.fifoq.wait_allocated().await;
        loop {
            let buffer = self.ctx.fifoq.result_dequeue(Timeout::Forever).await?;
            self.send(buffer).await;
        }
    }
}
