// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Classification of raw messages.
//!
//! The newer framing is recognised by its magic word and is always tried
//! first; only when that fails is the legacy preamble checked.

use crate::framing::header::{HEADER_STAMP_SIZE, HeaderStamp, MagicType, magic_of};
use crate::framing::legacy::is_legacy;

/// What the first bytes of a message say it is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A bulk command. Its length is whatever arrived in one transfer.
    Command,

    /// An inference input buffer of `stamp.total_size` bytes.
    Inference(HeaderStamp),

    /// A debug checkpoint dump.
    Checkpoint(HeaderStamp),

    /// A diagnostic JSON message.
    Json(HeaderStamp),

    /// A message in the legacy framing.
    Legacy,

    /// Nothing this device understands; carries the first word (or zero).
    Unknown(u32),
}

/// Classify a message from its first bytes.
///
/// Stamped messages need the whole 24-byte stamp to be present; a shorter
/// message with an inference magic is reported as unknown.
#[must_use]
pub fn classify(bytes: &[u8]) -> Frame {
    let Some(magic) = magic_of(bytes) else {
        return if is_legacy(bytes) {
            Frame::Legacy
        } else {
            Frame::Unknown(0)
        };
    };

    let stamp = || {
        (bytes.len() >= HEADER_STAMP_SIZE)
            .then(|| HeaderStamp::decode(bytes).ok())
            .flatten()
    };

    match MagicType::from_wire(magic) {
        Some(MagicType::Command) => Frame::Command,
        Some(MagicType::Inference | MagicType::Customized) => {
            stamp().map_or(Frame::Unknown(magic), Frame::Inference)
        }
        Some(MagicType::Checkpoint) => stamp().map_or(Frame::Unknown(magic), Frame::Checkpoint),
        Some(MagicType::Json) => stamp().map_or(Frame::Unknown(magic), Frame::Json),
        None if is_legacy(bytes) => Frame::Legacy,
        None => Frame::Unknown(magic),
    }
}

/// True if a transfer that should continue a message instead starts a new
/// command, which means the stream is out of step.
#[must_use]
pub fn starts_command(chunk: &[u8]) -> bool {
    magic_of(chunk) == Some(MagicType::Command.wire())
}
