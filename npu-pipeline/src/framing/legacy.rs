// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The older message framing still accepted for firmware and model updates
//! and a couple of status queries.
//!
//! A legacy frame starts with four `u16` words `{preamble, ctrl, cmd,
//! msg_len}`. Requests use the [`PREAMBLE_COMMAND`] preamble and responses
//! [`PREAMBLE_RESPONSE`]; a response command is the request command with
//! bit 15 set.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::framing::{FrameError, WireReader, put_u16, put_u32};

pub const PREAMBLE_COMMAND: u16 = 0xA583;
pub const PREAMBLE_RESPONSE: u16 = 0x8A35;

/// Size of a legacy frame header.
pub const LEGACY_HEADER_SIZE: usize = 8;

/// Size of the acknowledge frame and of the error reply.
pub const LEGACY_REPLY_SIZE: usize = 16;

/// Legacy update status: the image was applied.
pub const LEGACY_OK: u32 = 0;

/// Legacy update status: the image failed its checksum.
pub const LEGACY_AUTH_FAIL: u32 = 251;

/// Legacy update status: the image was incomplete or malformed.
pub const LEGACY_DATA_ERROR: u32 = 253;

const RESPONSE_BIT: u16 = 0x8000;
const RESPONSE_CTRL: u16 = 0xC;

/// Sent before an update is carried out.
pub const ACK_PACKET: [u8; LEGACY_REPLY_SIZE] = [
    0x35, 0x8A, 0xC, 0, 0x4, 0, 0x8, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum LegacyCommandId {
    SystemStatus = 0x21,
    UpdateFirmware = 0x22,
    UpdateModel = 0x23,
    GetKnNumber = 0x25,
}

impl LegacyCommandId {
    #[must_use]
    pub fn response(self) -> u16 {
        self as u16 | RESPONSE_BIT
    }
}

/// CPU whose firmware a legacy update replaces.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum FirmwareTarget {
    Scpu = 1,
    Ncpu = 2,
}

impl FirmwareTarget {
    #[must_use]
    pub fn from_id(fw_id: u32) -> Option<Self> {
        Self::from_u32(fw_id)
    }

    /// Every legacy firmware image has the fixed size of the CPU's
    /// instruction RAM, the last word being a checksum.
    #[must_use]
    pub fn image_size(self) -> usize {
        match self {
            FirmwareTarget::Scpu => 0x16000,
            FirmwareTarget::Ncpu => 0x10000,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LegacyHeader {
    pub preamble: u16,
    pub ctrl: u16,
    pub cmd: u16,
    pub msg_len: u16,
}

impl LegacyHeader {
    fn read(r: &mut WireReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            preamble: r.u16()?,
            ctrl: r.u16()?,
            cmd: r.u16()?,
            msg_len: r.u16()?,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        put_u16(out, self.preamble);
        put_u16(out, self.ctrl);
        put_u16(out, self.cmd);
        put_u16(out, self.msg_len);
    }

    fn response(command: LegacyCommandId, msg_len: u16) -> Self {
        Self {
            preamble: PREAMBLE_RESPONSE,
            ctrl: RESPONSE_CTRL,
            cmd: command.response(),
            msg_len,
        }
    }
}

/// True if `bytes` starts with the legacy command preamble.
#[must_use]
pub fn is_legacy(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && u16::from_le_bytes([bytes[0], bytes[1]]) == PREAMBLE_COMMAND
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LegacyRequest {
    SystemStatus,
    UpdateFirmware {
        fw_id: u32,
        auto_reboot: bool,
    },
    UpdateModel {
        fw_info_size: u32,
        all_models_size: u32,
        auto_reboot: bool,
    },
    GetKnNumber,
    /// A command this device does not implement.
    Unsupported(u16),
}

impl LegacyRequest {
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut r = WireReader::new(bytes);
        let header = LegacyHeader::read(&mut r)?;
        if header.preamble != PREAMBLE_COMMAND {
            return Err(FrameError::InvalidField("preamble"));
        }
        let request = match LegacyCommandId::from_u16(header.cmd) {
            Some(LegacyCommandId::SystemStatus) => LegacyRequest::SystemStatus,
            Some(LegacyCommandId::GetKnNumber) => LegacyRequest::GetKnNumber,
            Some(LegacyCommandId::UpdateFirmware) => LegacyRequest::UpdateFirmware {
                fw_id: r.u32()?,
                auto_reboot: r.u32()? == 1,
            },
            Some(LegacyCommandId::UpdateModel) => LegacyRequest::UpdateModel {
                fw_info_size: r.u32()?,
                all_models_size: r.u32()?,
                // Older hosts leave the reboot flag out.
                auto_reboot: r.u32().is_ok_and(|v| v == 1),
            },
            None => LegacyRequest::Unsupported(header.cmd),
        };
        Ok(request)
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let cmd = match self {
            LegacyRequest::SystemStatus => {
                put_u32(&mut body, 0);
                LegacyCommandId::SystemStatus as u16
            }
            LegacyRequest::GetKnNumber => {
                put_u32(&mut body, 0);
                LegacyCommandId::GetKnNumber as u16
            }
            LegacyRequest::UpdateFirmware { fw_id, auto_reboot } => {
                put_u32(&mut body, *fw_id);
                put_u32(&mut body, u32::from(*auto_reboot));
                LegacyCommandId::UpdateFirmware as u16
            }
            LegacyRequest::UpdateModel {
                fw_info_size,
                all_models_size,
                auto_reboot,
            } => {
                put_u32(&mut body, *fw_info_size);
                put_u32(&mut body, *all_models_size);
                put_u32(&mut body, u32::from(*auto_reboot));
                LegacyCommandId::UpdateModel as u16
            }
            LegacyRequest::Unsupported(cmd) => *cmd,
        };

        let mut out = Vec::with_capacity(LEGACY_HEADER_SIZE + body.len());
        LegacyHeader {
            preamble: PREAMBLE_COMMAND,
            ctrl: 0,
            cmd,
            msg_len: body.len() as u16,
        }
        .encode_into(&mut out);
        out.extend_from_slice(&body);
        out
    }
}

/// Reply to a firmware update, sent after the new image was applied.
#[must_use]
pub fn firmware_update_response(rsp_code: u32, fw_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEGACY_REPLY_SIZE);
    LegacyHeader::response(LegacyCommandId::UpdateFirmware, 8).encode_into(&mut out);
    put_u32(&mut out, rsp_code);
    put_u32(&mut out, fw_id);
    out
}

/// Reply to a model update; the status is carried twice.
#[must_use]
pub fn model_update_response(status: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEGACY_REPLY_SIZE);
    LegacyHeader::response(LegacyCommandId::UpdateModel, 8).encode_into(&mut out);
    put_u32(&mut out, status);
    put_u32(&mut out, status);
    out
}

#[must_use]
pub fn kn_number_response(kn_number: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEGACY_REPLY_SIZE);
    LegacyHeader::response(LegacyCommandId::GetKnNumber, 8).encode_into(&mut out);
    put_u32(&mut out, kn_number);
    put_u32(&mut out, 0);
    out
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemStatus {
    pub scpu_firmware_id: u32,
    pub scpu_build_id: u32,
    pub sys_status: u16,
    pub app_status: u16,
    pub ncpu_firmware_id: u32,
    pub ncpu_build_id: u32,
}

impl SystemStatus {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28);
        LegacyHeader::response(LegacyCommandId::SystemStatus, 20).encode_into(&mut out);
        put_u32(&mut out, self.scpu_firmware_id);
        put_u32(&mut out, self.scpu_build_id);
        put_u16(&mut out, self.sys_status);
        put_u16(&mut out, self.app_status);
        put_u32(&mut out, self.ncpu_firmware_id);
        put_u32(&mut out, self.ncpu_build_id);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut r = WireReader::new(bytes);
        let header = LegacyHeader::read(&mut r)?;
        if header.cmd != LegacyCommandId::SystemStatus.response() {
            return Err(FrameError::InvalidField("cmd"));
        }
        Ok(Self {
            scpu_firmware_id: r.u32()?,
            scpu_build_id: r.u32()?,
            sys_status: r.u16()?,
            app_status: r.u16()?,
            ncpu_firmware_id: r.u32()?,
            ncpu_build_id: r.u32()?,
        })
    }
}

/// The response command word and the two payload words of a 16-byte
/// legacy reply.
pub fn decode_reply(bytes: &[u8]) -> Result<(u16, u32, u32), FrameError> {
    let mut r = WireReader::new(bytes);
    let header = LegacyHeader::read(&mut r)?;
    Ok((header.cmd, r.u32()?, r.u32()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_packet_is_a_response_frame() {
        let (cmd, a, b) = decode_reply(&ACK_PACKET).unwrap();
        assert_eq!(&ACK_PACKET[..2], &PREAMBLE_RESPONSE.to_le_bytes());
        assert_eq!(cmd, 4);
        assert_eq!((a, b), (0, 0));
    }

    #[test]
    fn firmware_update_request() {
        let bytes = LegacyRequest::UpdateFirmware {
            fw_id: FirmwareTarget::Ncpu as u32,
            auto_reboot: true,
        }
        .encode();
        assert!(is_legacy(&bytes));
        assert_eq!(&bytes[4..6], &0x22u16.to_le_bytes());
        assert_eq!(
            LegacyRequest::decode(&bytes),
            Ok(LegacyRequest::UpdateFirmware {
                fw_id: 2,
                auto_reboot: true
            })
        );
    }

    #[test]
    fn model_update_without_reboot_flag() {
        let mut bytes = LegacyRequest::UpdateModel {
            fw_info_size: 64,
            all_models_size: 4096,
            auto_reboot: true,
        }
        .encode();
        bytes.truncate(16);
        assert_eq!(
            LegacyRequest::decode(&bytes),
            Ok(LegacyRequest::UpdateModel {
                fw_info_size: 64,
                all_models_size: 4096,
                auto_reboot: false
            })
        );
    }

    #[test]
    fn responses_carry_the_response_command() {
        assert_eq!(decode_reply(&kn_number_response(0x1234)), Ok((0x8025, 0x1234, 0)));
        assert_eq!(decode_reply(&model_update_response(3)), Ok((0x8023, 3, 3)));
        assert_eq!(
            decode_reply(&firmware_update_response(0, 1)),
            Ok((0x8022, 0, 1))
        );

        let status = SystemStatus {
            scpu_firmware_id: 0x0102_0300,
            scpu_build_id: 88,
            sys_status: 1,
            app_status: 2,
            ncpu_firmware_id: 0x0102_0300,
            ncpu_build_id: 88,
        };
        let bytes = status.encode();
        assert_eq!(bytes.len(), 28);
        assert_eq!(SystemStatus::decode(&bytes), Ok(status));
    }

    #[test]
    fn unknown_commands_are_unsupported() {
        let bytes = LegacyRequest::Unsupported(0x30).encode();
        assert_eq!(
            LegacyRequest::decode(&bytes),
            Ok(LegacyRequest::Unsupported(0x30))
        );
    }
}
