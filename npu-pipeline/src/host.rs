// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A host-side client of the pipeline.
//!
//! [`HostDevice`] speaks the device's protocol over a [`HostPort`]: it
//! configures the queues through the control channel, frames commands and
//! inference requests, and reads back responses and results. Messages
//! longer than the chunk size are split into several bulk transfers, as a
//! USB host would.

use std::cell::RefCell;
use std::rc::Rc;

use npu_engine::time::timeout::Timeout;
use npu_track::entity::Entity;
use npu_track::{debug, trace};

use crate::error::{ErrorCode, TransportError};
use crate::fifoq::FifoqConfig;
use crate::framing::command::{Command, decode_response};
use crate::framing::control::ControlRequest;
use crate::framing::header::{HEADER_STAMP_SIZE, HeaderStamp, MagicType};
use crate::framing::inference::{
    BYPASS_HEADER_SIZE, BypassRequest, GENERIC_RAW_HEADER_SIZE, GenericRawRequest, ImageHeader,
    JOB_GENERIC_RAW, JOB_GENERIC_RAW_BYPASS, RESULT_HEADER_SIZE, ResultHeader,
};
use crate::framing::message::{Frame, classify};
use crate::transport::HostPort;

/// A result as the host sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostResult {
    pub stamp: HeaderStamp,

    /// Present for results of the built-in applications, unless the device
    /// answered with a bare stamp.
    pub header: Option<ResultHeader>,
    pub output: Vec<u8>,
}

impl HostResult {
    #[must_use]
    pub fn status(&self) -> ErrorCode {
        self.stamp.status()
    }

    fn parse(bytes: Vec<u8>) -> Result<Self, ErrorCode> {
        let stamp = HeaderStamp::decode(&bytes)?;
        let built_in = matches!(stamp.job_id, JOB_GENERIC_RAW | JOB_GENERIC_RAW_BYPASS);
        if !built_in || bytes.len() < RESULT_HEADER_SIZE {
            return Ok(Self {
                stamp,
                header: None,
                output: bytes.get(HEADER_STAMP_SIZE..).unwrap_or_default().to_vec(),
            });
        }
        let header = ResultHeader::decode(&bytes)?;
        Ok(Self {
            stamp,
            header: Some(header),
            output: bytes[RESULT_HEADER_SIZE..].to_vec(),
        })
    }
}

pub struct HostDevice {
    pub entity: Rc<Entity>,
    port: HostPort,
    chunk_size: usize,
    checkpoints: RefCell<Vec<Vec<u8>>>,
}

impl HostDevice {
    #[must_use]
    pub fn new(parent: &Rc<Entity>, port: HostPort, chunk_size: usize) -> Self {
        Self {
            entity: Rc::new(Entity::new(parent, "host")),
            port,
            chunk_size: chunk_size.max(1),
            checkpoints: RefCell::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn port(&self) -> &HostPort {
        &self.port
    }

    pub fn connect(&self) {
        self.port.connect();
    }

    pub fn disconnect(&self) {
        self.port.disconnect();
    }

    /// Ask the device to allocate its queues. Returns false when the device
    /// had already been configured.
    pub async fn configure_queues(&self, config: &FifoqConfig) -> Result<bool, ErrorCode> {
        let request = ControlRequest::configure_queues(config).ok_or(ErrorCode::InvalidParam)?;
        Ok(self.port.control(request).await?)
    }

    pub async fn control(&self, request: ControlRequest) -> Result<bool, TransportError> {
        self.port.control(request).await
    }

    /// Send one message, split into transfers of at most the chunk size.
    pub fn send_message(&self, bytes: &[u8]) -> Result<(), TransportError> {
        trace!(self.entity ; "send {} bytes", bytes.len());
        for chunk in bytes.chunks(self.chunk_size) {
            self.port.send(chunk)?;
        }
        Ok(())
    }

    pub async fn receive(&self, timeout: Timeout) -> Result<Vec<u8>, TransportError> {
        self.port.receive(timeout).await
    }

    /// Issue `command` and wait for its response.
    pub async fn command(&self, command: &Command, timeout: Timeout) -> Result<(ErrorCode, Vec<u32>), ErrorCode> {
        debug!(self.entity ; "command {:?}", command.id());
        self.port.send(&command.encode())?;
        let reply = self.port.receive(timeout).await?;
        Ok(decode_response(&reply)?)
    }

    /// Request a generic raw inference of a single image.
    pub fn send_generic_raw(
        &self,
        inference_number: u32,
        model_id: u32,
        image: &ImageHeader,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let request = GenericRawRequest {
            stamp: HeaderStamp::new(
                MagicType::Inference,
                (GENERIC_RAW_HEADER_SIZE + data.len()) as u32,
                JOB_GENERIC_RAW,
            ),
            inference_number,
            model_id,
            image: *image,
        };
        let mut bytes = Vec::with_capacity(GENERIC_RAW_HEADER_SIZE + data.len());
        request.encode_into(&mut bytes);
        bytes.extend_from_slice(data);
        self.send_message(&bytes)
    }

    /// Request an inference whose inputs skip pre-processing. Each entry of
    /// `inputs` becomes one buffer of the job.
    pub fn send_bypass(&self, inference_number: u32, model_id: u32, inputs: &[&[u8]]) -> Result<(), TransportError> {
        let total = inputs.len() as u32;
        for (index, data) in inputs.iter().enumerate() {
            let request = BypassRequest {
                stamp: HeaderStamp::new(
                    MagicType::Inference,
                    (BYPASS_HEADER_SIZE + data.len()) as u32,
                    JOB_GENERIC_RAW_BYPASS,
                )
                .with_image(total, index as u32),
                inference_number,
                model_id,
                image_buffer_size: data.len() as u32,
            };
            let mut bytes = Vec::with_capacity(BYPASS_HEADER_SIZE + data.len());
            request.encode_into(&mut bytes);
            bytes.extend_from_slice(data);
            self.send_message(&bytes)?;
        }
        Ok(())
    }

    /// Send a stamped message for a custom application: `payload` follows
    /// the stamp.
    pub fn send_custom(&self, job_id: u32, payload: &[u8]) -> Result<(), TransportError> {
        let stamp = HeaderStamp::new(
            MagicType::Inference,
            (HEADER_STAMP_SIZE + payload.len()) as u32,
            job_id,
        );
        let mut bytes = stamp.to_bytes();
        bytes.extend_from_slice(payload);
        self.send_message(&bytes)
    }

    /// Wait for the next inference result. Debug checkpoints that arrive
    /// first are kept aside; see [`take_checkpoints`](Self::take_checkpoints).
    pub async fn next_result(&self, timeout: Timeout) -> Result<HostResult, ErrorCode> {
        loop {
            let message = self.port.receive(timeout).await?;
            match classify(&message) {
                Frame::Checkpoint(stamp) => {
                    trace!(self.entity ; "checkpoint of {} bytes", stamp.total_size);
                    self.checkpoints.borrow_mut().push(message);
                }
                Frame::Inference(_) => return HostResult::parse(message),
                _ => return Err(ErrorCode::ReceiveIncorrectHeaderStamp),
            }
        }
    }

    /// The checkpoint messages seen so far.
    pub fn take_checkpoints(&self) -> Vec<Vec<u8>> {
        self.checkpoints.take()
    }
}
