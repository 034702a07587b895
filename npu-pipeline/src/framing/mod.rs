// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The byte-level contract of every message crossing the transport.
//!
//! All integers are little-endian and every structure is a whole number of
//! 32-bit words. Each message starts with a [`HeaderStamp`](header::HeaderStamp)
//! (or, for commands, its first three words) whose magic type says how the
//! rest is interpreted; [`message::classify`] turns raw bytes into a tagged
//! [`Frame`](message::Frame).

use std::error::Error;
use std::fmt;

use crate::error::ErrorCode;

pub mod command;
pub mod control;
pub mod header;
pub mod inference;
pub mod legacy;
pub mod message;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the structure needs.
    Truncated { needed: usize, available: usize },

    /// A field held a value that the structure does not allow.
    InvalidField(&'static str),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated { needed, available } => {
                write!(f, "truncated message: need {needed} bytes, have {available}")
            }
            FrameError::InvalidField(field) => write!(f, "invalid field '{field}'"),
        }
    }
}

impl Error for FrameError {}

impl From<FrameError> for ErrorCode {
    fn from(_: FrameError) -> Self {
        ErrorCode::InvalidParam
    }
}

/// Sequential little-endian reader over a byte slice.
pub struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The bytes not yet read.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(FrameError::Truncated {
                needed: end,
                available: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u16(&mut self) -> Result<u16, FrameError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
}

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Read the little-endian word at byte `offset`, if present.
#[must_use]
pub fn word_at(bytes: &[u8], offset: usize) -> Option<u32> {
    let b = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Overwrite the little-endian word at byte `offset`.
pub fn set_word_at(bytes: &mut [u8], offset: usize, value: u32) -> Result<(), FrameError> {
    let available = bytes.len();
    let slot = bytes
        .get_mut(offset..offset + 4)
        .ok_or(FrameError::Truncated {
            needed: offset + 4,
            available,
        })?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_truncation() {
        let mut reader = WireReader::new(&[1, 0, 0, 0, 2, 0]);
        assert_eq!(reader.u32(), Ok(1));
        assert_eq!(reader.u16(), Ok(2));
        assert_eq!(
            reader.u32(),
            Err(FrameError::Truncated {
                needed: 10,
                available: 6
            })
        );
    }

    #[test]
    fn words_in_place() {
        let mut bytes = vec![0; 8];
        set_word_at(&mut bytes, 4, 0xDEAD_BEEF).unwrap();
        assert_eq!(word_at(&bytes, 4), Some(0xDEAD_BEEF));
        assert_eq!(word_at(&bytes, 6), None);
        assert!(set_word_at(&mut bytes, 5, 1).is_err());
    }
}
