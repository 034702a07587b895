// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Inference dispatch.
//!
//! The [`Dispatcher`](dispatcher::Dispatcher) takes complete jobs off the
//! image queue and hands each to the application registered for its job id.
//! Applications validate their input and run it through the
//! [`InferenceEngine`](engine::InferenceEngine), which either waits for the
//! accelerator (blocking mode) or parks the run in a result slot and returns
//! as soon as the inputs have been consumed (parallel mode). In parallel
//! mode the [`ResultHandler`](result_handler::ResultHandler) resolves each
//! slot in turn.

use async_trait::async_trait;

use crate::buffer::BufferObject;
use crate::error::ErrorCode;
use crate::framing::header::HeaderStamp;

pub mod apps;
pub mod dispatcher;
pub mod engine;
pub mod result_handler;

/// A handler for the jobs of one job id.
///
/// An application returns once it no longer needs the job's input buffers;
/// it is responsible for queueing a result. An error is answered with a
/// header-only result carrying the code.
#[async_trait(?Send)]
pub trait InferenceApp {
    async fn run(
        &self,
        engine: &std::rc::Rc<engine::InferenceEngine>,
        stamp: HeaderStamp,
        job: &BufferObject,
    ) -> Result<(), ErrorCode>;
}
