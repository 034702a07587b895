// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

#![doc(test(attr(warn(unused))))]

//! The device side of a host-to-accelerator inference pipeline.
//!
//! A host sends framed messages over a USB-like [transport](crate::transport).
//! The [receiver](crate::receiver) reads each message into a buffer owned by
//! the [FIFO queue manager](crate::fifoq): commands are executed at once by
//! the [command handler](crate::command_handler), while inference input is
//! collected into jobs on the image queue. The
//! [dispatcher](crate::inference::dispatcher) hands every job to its
//! application, which validates it and runs it on the
//! [accelerator](crate::accelerator) through the
//! [inference engine](crate::inference::engine). Results travel back through
//! the result queue to the [sender](crate::sender).
//!
//! Buffers are never shared: a [`Buffer`](crate::buffer::Buffer) is owned by
//! exactly one queue or task at a time and is handed over by value.
//!
//! Everything runs as tasks on an `npu_engine` engine, so a complete system
//! including host, link, device and accelerator can be simulated
//! deterministically; see [`SimulatedSystem`](crate::pipeline::SimulatedSystem).

pub mod accelerator;
pub mod buffer;
pub mod buffer_pool;
pub mod command_handler;
pub mod config;
pub mod context;
pub mod control_handler;
pub mod device;
pub mod error;
pub mod fifoq;
pub mod framing;
pub mod host;
pub mod inference;
pub mod pipeline;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod transport;
