// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The built-in inference applications.

use std::rc::Rc;

use async_trait::async_trait;

use crate::buffer::BufferObject;
use crate::error::ErrorCode;
use crate::framing::header::HeaderStamp;
use crate::framing::inference::{
    BYPASS_HEADER_SIZE, BypassRequest, GENERIC_RAW_HEADER_SIZE, GenericRawRequest,
};
use crate::inference::InferenceApp;
use crate::inference::engine::{InferenceEngine, InputImage, ResultMeta};

/// Raw inference with pre-processing done by the accelerator. Each buffer
/// carries a [`GenericRawRequest`] followed by its image.
pub struct GenericRawApp;

#[async_trait(?Send)]
impl InferenceApp for GenericRawApp {
    async fn run(
        &self,
        engine: &Rc<InferenceEngine>,
        stamp: HeaderStamp,
        job: &BufferObject,
    ) -> Result<(), ErrorCode> {
        let requests = job
            .iter()
            .map(|buffer| -> Result<_, ErrorCode> {
                let bytes = buffer.bytes();
                let request = GenericRawRequest::decode(bytes)?;
                let image = bytes.get(GENERIC_RAW_HEADER_SIZE..).unwrap_or_default();
                Ok((request, image))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let (first, _) = requests.first().ok_or(ErrorCode::WrongInputBufferCount)?;

        let inputs: Vec<_> = requests
            .iter()
            .map(|(request, image)| InputImage::Processed {
                header: request.image,
                image: *image,
            })
            .collect();
        let prepared = engine.prepare(first.model_id, &inputs)?;

        let meta = ResultMeta {
            job_id: stamp.job_id,
            inference_number: first.inference_number,
            crop_number: first.image.crop().map_or(0, |crop| crop.crop_number),
        };
        engine.dispatch(prepared, &inputs, meta).await
    }
}

/// Raw inference on data already in the model's input layout.
pub struct BypassApp;

#[async_trait(?Send)]
impl InferenceApp for BypassApp {
    async fn run(
        &self,
        engine: &Rc<InferenceEngine>,
        stamp: HeaderStamp,
        job: &BufferObject,
    ) -> Result<(), ErrorCode> {
        let requests = job
            .iter()
            .map(|buffer| -> Result<_, ErrorCode> {
                let bytes = buffer.bytes();
                let request = BypassRequest::decode(bytes)?;
                let payload = bytes.get(BYPASS_HEADER_SIZE..).unwrap_or_default();
                let image = &payload[..payload.len().min(request.image_buffer_size as usize)];
                Ok((request, image))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let (first, _) = requests.first().ok_or(ErrorCode::WrongInputBufferCount)?;

        let inputs: Vec<_> = requests
            .iter()
            .map(|(_, image)| InputImage::Bypass { image: *image })
            .collect();
        let prepared = engine.prepare(first.model_id, &inputs)?;

        let meta = ResultMeta {
            job_id: stamp.job_id,
            inference_number: first.inference_number,
            crop_number: 0,
        };
        engine.dispatch(prepared, &inputs, meta).await
    }
}
