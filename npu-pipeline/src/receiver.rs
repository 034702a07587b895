// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The receive loop.
//!
//! Every host message is read into one buffer: an image buffer once the
//! queues are configured, otherwise a scratch buffer. The header stamp at
//! the start of the first transfer decides what the message is and, for
//! inference input, how many bytes belong to it. Commands are executed
//! inline; inference buffers are handed to the FIFO queue manager.

use std::rc::Rc;

use async_trait::async_trait;
use npu_engine::engine::Engine;
use npu_engine::time::timeout::Timeout;
use npu_engine::traits::Runnable;
use npu_engine::types::SimResult;
use npu_track::entity::Entity;
use npu_track::{debug, error, info, trace, warn};

use crate::buffer::Buffer;
use crate::command_handler::CommandHandler;
use crate::context::PipelineContext;
use crate::error::{QueueError, TransportError};
use crate::framing::header::{HEADER_STAMP_SIZE, HeaderStamp};
use crate::framing::message::{Frame, classify, starts_command};

/// What became of one message.
#[derive(Debug, PartialEq, Eq)]
enum Received {
    /// Executed as a command; the buffer is free again.
    Handled,

    /// Discarded.
    Dropped,

    /// A complete inference buffer.
    Inference(HeaderStamp),
}

pub struct Receiver {
    pub entity: Rc<Entity>,
    ctx: Rc<PipelineContext>,
    commands: CommandHandler,
}

impl Receiver {
    pub fn new_and_register(engine: &Engine, ctx: &Rc<PipelineContext>) -> Rc<Self> {
        let rc_self = Rc::new(Self {
            entity: Rc::new(Entity::new(&ctx.entity, "receiver")),
            ctx: ctx.clone(),
            commands: CommandHandler::new(ctx),
        });
        engine.register(rc_self.clone());
        rc_self
    }

    /// Take an image buffer, or `None` while the queues are not configured.
    ///
    /// In droppable mode the oldest undelivered job is sacrificed rather
    /// than waiting; if every buffer is held by jobs in progress the loop
    /// polls once per tick.
    async fn acquire(&self) -> Option<Buffer> {
        let fifoq = &self.ctx.fifoq;
        while fifoq.is_allocated() {
            let (timeout, force_grab) = if self.ctx.droppable() {
                (Timeout::Immediate, true)
            } else {
                (Timeout::Forever, false)
            };
            match fifoq.image_get_free_buffer(timeout, force_grab).await {
                Ok(buffer) => return Some(buffer),
                Err(QueueError::ResourceExhausted | QueueError::Timeout) => {
                    self.ctx.clock.wait_ticks(1).await;
                }
                Err(e) => {
                    warn!(self.entity ; "no image buffer: {e}");
                    return None;
                }
            }
        }
        None
    }

    async fn release(&self, buffer: Buffer) {
        if let Err(rejected) = self
            .ctx
            .fifoq
            .image_put_free_buffer(buffer, Timeout::Forever)
            .await
        {
            error!(self.entity ; "lost image buffer {}: {}", rejected.item.id(), rejected.error);
        }
    }

    /// Receive and act on one message.
    async fn receive_one(&self, scratch: &mut [u8]) -> Result<(), TransportError> {
        let mut pooled = self.acquire().await;
        let received = self.receive_into(&mut pooled, scratch).await;

        if let Ok(Received::Inference(stamp)) = &received {
            if let Some(buffer) = pooled.take() {
                trace!(self.entity ; "job {} buffer {}/{} complete",
                    stamp.job_id, stamp.image_index, stamp.total_image);
                if let Err(rejected) = self
                    .ctx
                    .fifoq
                    .image_enqueue(
                        stamp.total_image as usize,
                        stamp.image_index as usize,
                        buffer,
                        Timeout::Forever,
                        false,
                    )
                    .await
                {
                    warn!(self.entity ; "job {} not queued: {}", stamp.job_id, rejected.error);
                    self.release(rejected.item).await;
                }
            }
        }
        if let Some(buffer) = pooled {
            self.release(buffer).await;
        }
        received.map(|_| ())
    }

    async fn receive_into(
        &self,
        pooled: &mut Option<Buffer>,
        scratch: &mut [u8],
    ) -> Result<Received, TransportError> {
        let transport = &self.ctx.transport;
        let mut scratch_len = 0;
        let frame = match pooled.as_mut() {
            Some(buffer) => {
                let n = transport.read(buffer.memory_mut(), Timeout::Forever).await?;
                buffer.set_len(n);
                classify(buffer.bytes())
            }
            None => {
                scratch_len = transport.read(scratch, Timeout::Forever).await?;
                classify(&scratch[..scratch_len])
            }
        };

        match frame {
            Frame::Command => {
                self.commands
                    .handle(message(pooled, &scratch[..scratch_len]))
                    .await;
                Ok(Received::Handled)
            }
            Frame::Legacy => {
                self.commands
                    .handle_legacy(message(pooled, &scratch[..scratch_len]))
                    .await;
                Ok(Received::Handled)
            }
            Frame::Inference(stamp) => {
                let wanted = stamp.total_size as usize;
                if pooled.is_none() {
                    // The queues may have been configured while waiting.
                    match self.acquire().await {
                        Some(mut buffer) => {
                            buffer.fill_from(&scratch[..scratch_len]);
                            *pooled = Some(buffer);
                        }
                        None => {
                            warn!(self.entity ; "job {} arrived before the queues were configured",
                                stamp.job_id);
                            self.drain(scratch, scratch_len, wanted).await?;
                            return Ok(Received::Dropped);
                        }
                    }
                }
                let Some(buffer) = pooled.as_mut() else {
                    return Ok(Received::Dropped);
                };

                if wanted > buffer.capacity() {
                    error!(self.entity ; "job {} declares {wanted} bytes, buffer holds {}",
                        stamp.job_id, buffer.capacity());
                    transport.teardown();
                    return Ok(Received::Dropped);
                }
                if wanted < HEADER_STAMP_SIZE {
                    warn!(self.entity ; "job {} declares only {wanted} bytes", stamp.job_id);
                    return Ok(Received::Dropped);
                }
                if self.complete(buffer, wanted).await? {
                    Ok(Received::Inference(stamp))
                } else {
                    Ok(Received::Dropped)
                }
            }
            Frame::Checkpoint(stamp) | Frame::Json(stamp) => {
                warn!(self.entity ; "unexpected message with magic {:#x} from host", stamp.magic_type);
                Ok(Received::Dropped)
            }
            Frame::Unknown(magic) => {
                warn!(self.entity ; "unknown message {magic:#x}");
                Ok(Received::Dropped)
            }
        }
    }

    /// Read the rest of an inference message into `buffer`. Returns false if
    /// the stream turned out to be out of step.
    async fn complete(&self, buffer: &mut Buffer, wanted: usize) -> Result<bool, TransportError> {
        let mut received = buffer.len();
        while received < wanted {
            let n = self
                .ctx
                .transport
                .read(&mut buffer.memory_mut()[received..], Timeout::Forever)
                .await?;
            if starts_command(&buffer.memory_mut()[received..received + n]) {
                warn!(self.entity ; "command inside an inference message after {received} bytes");
                // The stray command is lost along with the message.
                return Ok(false);
            }
            received += n;
        }
        if received > wanted {
            warn!(self.entity ; "received {received} bytes, expected {wanted}");
        }
        buffer.set_len(received);
        Ok(true)
    }

    /// Skip the remainder of a message that has nowhere to go.
    async fn drain(&self, scratch: &mut [u8], already: usize, wanted: usize) -> Result<(), TransportError> {
        let mut received = already;
        while received < wanted {
            let room = scratch.len().min(wanted - received);
            received += self
                .ctx
                .transport
                .read(&mut scratch[..room], Timeout::Forever)
                .await?;
        }
        debug!(self.entity ; "skipped {received} bytes");
        Ok(())
    }
}

/// The bytes of a message held in `pooled`, or else in `scratch`.
fn message<'a>(pooled: &'a Option<Buffer>, scratch: &'a [u8]) -> &'a [u8] {
    pooled.as_ref().map_or(scratch, Buffer::bytes)
}

#[async_trait(?Send)]
impl Runnable for Receiver {
    async fn run(&self) -> SimResult {
        let mut scratch = vec![0; self.ctx.config.scratch_buffer_size];

        loop {
            self.ctx.transport.wait_connected().await;
            info!(self.entity ; "receiving");

            loop {
                match self.receive_one(&mut scratch).await {
                    Ok(()) => {}
                    Err(TransportError::Terminated | TransportError::Timeout) => {
                        if self.ctx.take_reset_request() {
                            info!(self.entity ; "queue reset");
                            self.ctx.fifoq.clean_queues();
                        }
                    }
                    Err(TransportError::Disconnected) => {
                        info!(self.entity ; "link lost");
                        self.ctx.take_reset_request();
                        self.ctx.set_droppable(false);
                        self.ctx.fifoq.clean_queues();
                        break;
                    }
                }
            }
        }
    }
}
