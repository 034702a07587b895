// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The header stamp that starts every inference, result and checkpoint
//! message.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::ErrorCode;
use crate::framing::{FrameError, WireReader, put_u32, set_word_at, word_at};

/// Size in bytes of an encoded [`HeaderStamp`].
pub const HEADER_STAMP_SIZE: usize = 24;

/// Size in bytes of the prologue shared by every command request.
pub const COMMAND_PROLOGUE_SIZE: usize = 12;

/// Job ids from here up belong to user applications.
pub const FIRST_CUSTOM_JOB_ID: u32 = 1000;

const TOTAL_SIZE_OFFSET: usize = 4;
const STATUS_CODE_OFFSET: usize = 12;

/// Discriminates the payload that follows the stamp.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum MagicType {
    Command = 0xAB67_CD13,
    Inference = 0x11FF_22AA,
    Customized = 0x11FF_33CC,
    Checkpoint = 0x34AB_F977,
    Json = 0x22EE_3A86,
}

impl MagicType {
    #[must_use]
    pub fn from_wire(value: u32) -> Option<Self> {
        Self::from_u32(value)
    }

    #[must_use]
    pub fn wire(self) -> u32 {
        self as u32
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderStamp {
    pub magic_type: u32,
    pub total_size: u32,
    pub job_id: u32,
    pub status_code: u32,
    pub total_image: u32,
    pub image_index: u32,
}

impl HeaderStamp {
    /// A stamp for a single-buffer message.
    #[must_use]
    pub fn new(magic: MagicType, total_size: u32, job_id: u32) -> Self {
        Self {
            magic_type: magic.wire(),
            total_size,
            job_id,
            status_code: 0,
            total_image: 1,
            image_index: 0,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: ErrorCode) -> Self {
        self.status_code = status.as_wire();
        self
    }

    #[must_use]
    pub fn with_image(mut self, total_image: u32, image_index: u32) -> Self {
        self.total_image = total_image;
        self.image_index = image_index;
        self
    }

    #[must_use]
    pub fn magic(&self) -> Option<MagicType> {
        MagicType::from_wire(self.magic_type)
    }

    #[must_use]
    pub fn status(&self) -> ErrorCode {
        ErrorCode::from_wire(self.status_code)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::read(&mut WireReader::new(bytes))
    }

    pub fn read(reader: &mut WireReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            magic_type: reader.u32()?,
            total_size: reader.u32()?,
            job_id: reader.u32()?,
            status_code: reader.u32()?,
            total_image: reader.u32()?,
            image_index: reader.u32()?,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        for word in [
            self.magic_type,
            self.total_size,
            self.job_id,
            self.status_code,
            self.total_image,
            self.image_index,
        ] {
            put_u32(out, word);
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_STAMP_SIZE);
        self.encode_into(&mut out);
        out
    }
}

/// The magic word at the start of a message.
#[must_use]
pub fn magic_of(bytes: &[u8]) -> Option<u32> {
    word_at(bytes, 0)
}

/// Patch the total size of the message in `bytes`.
pub fn set_total_size(bytes: &mut [u8], total_size: u32) -> Result<(), FrameError> {
    set_word_at(bytes, TOTAL_SIZE_OFFSET, total_size)
}

/// Patch the status code of the message in `bytes`.
pub fn set_status_code(bytes: &mut [u8], status: ErrorCode) -> Result<(), FrameError> {
    set_word_at(bytes, STATUS_CODE_OFFSET, status.as_wire())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_round_trips() {
        let stamp = HeaderStamp::new(MagicType::Inference, 4096, 1000)
            .with_status(ErrorCode::InferenceTimeout)
            .with_image(3, 2);
        let bytes = stamp.to_bytes();
        assert_eq!(bytes.len(), HEADER_STAMP_SIZE);
        assert_eq!(&bytes[..4], &[0xAA, 0x22, 0xFF, 0x11]);

        let decoded = HeaderStamp::decode(&bytes).unwrap();
        assert_eq!(decoded, stamp);
        assert_eq!(decoded.magic(), Some(MagicType::Inference));
        assert_eq!(decoded.status(), ErrorCode::InferenceTimeout);
    }

    #[test]
    fn patch_in_place() {
        let mut bytes = HeaderStamp::new(MagicType::Inference, 24, 10).to_bytes();
        set_total_size(&mut bytes, 344).unwrap();
        set_status_code(&mut bytes, ErrorCode::UnknownApp).unwrap();
        let decoded = HeaderStamp::decode(&bytes).unwrap();
        assert_eq!(decoded.total_size, 344);
        assert_eq!(decoded.status(), ErrorCode::UnknownApp);
    }

    #[test]
    fn short_input_is_truncated() {
        assert!(matches!(
            HeaderStamp::decode(&[0; 20]),
            Err(FrameError::Truncated { needed: 24, .. })
        ));
    }

    #[test]
    fn unknown_magic() {
        assert_eq!(MagicType::from_wire(0x1234_5678), None);
        assert_eq!(
            MagicType::from_wire(0x34AB_F977),
            Some(MagicType::Checkpoint)
        );
    }
}
