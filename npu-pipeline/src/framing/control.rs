// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Requests sent out-of-band on the control channel.

use std::fmt;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::fifoq::{FifoqConfig, encode_queue_word};

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ControlOpcode {
    Reboot = 0xFF,
    Shutdown = 0xFE,
    QueueReset = 0x80,
    QueueStatus = 0x81,
    QueueConfigure = 0x82,
    EnableDroppable = 0x83,
    DdrHeapBoundary = 0x84,
    RebootSystem = 0x85,
}

/// One control transfer: a request byte and two 16-bit parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    #[must_use]
    pub fn new(opcode: ControlOpcode, value: u16, index: u16) -> Self {
        Self {
            request: opcode as u8,
            value,
            index,
        }
    }

    #[must_use]
    pub fn opcode(&self) -> Option<ControlOpcode> {
        ControlOpcode::from_u8(self.request)
    }

    /// A queue configuration request, if `config` can be expressed on the
    /// wire.
    #[must_use]
    pub fn configure_queues(config: &FifoqConfig) -> Option<Self> {
        let value = encode_queue_word(config.image_count, config.image_size)?;
        let index = encode_queue_word(config.result_count, config.result_size)?;
        Some(Self::new(ControlOpcode::QueueConfigure, value, index))
    }

    #[must_use]
    pub fn droppable(enable: bool) -> Self {
        Self::new(ControlOpcode::EnableDroppable, u16::from(enable), 0)
    }

    #[must_use]
    pub fn heap_boundary(address: u32) -> Self {
        Self::new(
            ControlOpcode::DdrHeapBoundary,
            (address >> 16) as u16,
            (address & 0xFFFF) as u16,
        )
    }

    /// The address carried by a heap boundary request.
    #[must_use]
    pub fn address(&self) -> u32 {
        (u32::from(self.value) << 16) | u32::from(self.index)
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(opcode) => write!(f, "{opcode:?}({:#06x}, {:#06x})", self.value, self.index),
            None => write!(
                f,
                "unknown request {:#04x}({:#06x}, {:#06x})",
                self.request, self.value, self.index
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_boundary_address_splits_into_words() {
        let request = ControlRequest::heap_boundary(0x8123_4560);
        assert_eq!(request.value, 0x8123);
        assert_eq!(request.index, 0x4560);
        assert_eq!(request.address(), 0x8123_4560);
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let request = ControlRequest {
            request: 0x10,
            value: 1,
            index: 2,
        };
        assert_eq!(request.opcode(), None);
        assert_eq!(request.to_string(), "unknown request 0x10(0x0001, 0x0002)");
    }
}
