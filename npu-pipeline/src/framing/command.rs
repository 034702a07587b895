// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Bulk commands and their responses.
//!
//! A command request starts with `{magic_type, total_size, command_id}`
//! followed by command-specific words. Every response starts with a `u32`
//! return code. Data that accompanies a command (model images, memory
//! contents, flash pages) travels as separate bulk transfers after the
//! request or the response.

use std::fmt;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::ErrorCode;
use crate::framing::header::{COMMAND_PROLOGUE_SIZE, MagicType};
use crate::framing::{FrameError, WireReader, put_u32};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u32)]
pub enum CommandId {
    LoadModel = 0xA01,
    MemoryRead = 0xA02,
    MemoryWrite = 0xA03,
    GetSystemInfo = 0xA04,
    GetModelInfo = 0xA05,
    LoadFirmware = 0xA06,
    LoadModelFromFlash = 0xA07,
    SetCryptoKey = 0xA08,
    SetSecureBootKey = 0xA09,
    SetGpio = 0xA0A,
    SetDebugCheckpoint = 0xA0B,
    SetProfileEnable = 0xA0C,
    GetProfileStatistics = 0xA0D,
    GetDdrConfig = 0xA0E,
    LoadNef = 0xA0F,
    UpdateFirmware = 0xA10,
    SwitchBootMode = 0xA11,
    UpdateLoader = 0xA12,
    GetFifoqConfig = 0xA13,
    SetPerformanceMonitor = 0xA14,
    GetPerformanceMonitorStatistics = 0xA15,
    UpdateNef = 0xA16,
    ReadFlash = 0xA98,
    WriteFlash = 0xA99,
}

/// Reserved words that follow a load firmware request.
const FIRMWARE_BYPASS_WORDS: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    LoadModel { model_size: u32, fw_info: Vec<u8> },
    MemoryRead { start_address: u32, length: u32 },
    MemoryWrite { start_address: u32, length: u32 },
    GetSystemInfo,
    GetModelInfo { from_ddr: bool },
    LoadFirmware { fw_type: u32, fw_start: u32, fw_size: u32 },
    LoadModelFromFlash,
    SetCryptoKey { key: u32 },
    SetSecureBootKey { entry: u32, key: u32 },
    SetGpio { pin: u32, value: u32 },
    SetDebugCheckpoint { flags: u32, enable: bool },
    SetProfileEnable { enable: bool },
    GetProfileStatistics,
    GetDdrConfig,
    LoadNef { nef_size: u32 },
    UpdateFirmware { firmware_id: u32, firmware_size: u32 },
    SwitchBootMode { boot_mode: u32 },
    UpdateLoader { loader_size: u32 },
    GetFifoqConfig,
    SetPerformanceMonitor { enable: bool },
    GetPerformanceMonitorStatistics,
    UpdateNef { nef_size: u32, auto_reboot: bool },
    ReadFlash { offset: u32, length: u32 },
    WriteFlash { offset: u32, length: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandError {
    /// The command id is not one this device knows.
    Unknown(u32),

    /// The request is malformed.
    Frame(FrameError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Unknown(id) => write!(f, "unknown command {id:#x}"),
            CommandError::Frame(e) => write!(f, "{e}"),
        }
    }
}

impl From<FrameError> for CommandError {
    fn from(e: FrameError) -> Self {
        CommandError::Frame(e)
    }
}

fn flag(word: u32) -> bool {
    word & 0xFF != 0
}

impl Command {
    #[must_use]
    pub fn id(&self) -> CommandId {
        match self {
            Command::LoadModel { .. } => CommandId::LoadModel,
            Command::MemoryRead { .. } => CommandId::MemoryRead,
            Command::MemoryWrite { .. } => CommandId::MemoryWrite,
            Command::GetSystemInfo => CommandId::GetSystemInfo,
            Command::GetModelInfo { .. } => CommandId::GetModelInfo,
            Command::LoadFirmware { .. } => CommandId::LoadFirmware,
            Command::LoadModelFromFlash => CommandId::LoadModelFromFlash,
            Command::SetCryptoKey { .. } => CommandId::SetCryptoKey,
            Command::SetSecureBootKey { .. } => CommandId::SetSecureBootKey,
            Command::SetGpio { .. } => CommandId::SetGpio,
            Command::SetDebugCheckpoint { .. } => CommandId::SetDebugCheckpoint,
            Command::SetProfileEnable { .. } => CommandId::SetProfileEnable,
            Command::GetProfileStatistics => CommandId::GetProfileStatistics,
            Command::GetDdrConfig => CommandId::GetDdrConfig,
            Command::LoadNef { .. } => CommandId::LoadNef,
            Command::UpdateFirmware { .. } => CommandId::UpdateFirmware,
            Command::SwitchBootMode { .. } => CommandId::SwitchBootMode,
            Command::UpdateLoader { .. } => CommandId::UpdateLoader,
            Command::GetFifoqConfig => CommandId::GetFifoqConfig,
            Command::SetPerformanceMonitor { .. } => CommandId::SetPerformanceMonitor,
            Command::GetPerformanceMonitorStatistics => {
                CommandId::GetPerformanceMonitorStatistics
            }
            Command::UpdateNef { .. } => CommandId::UpdateNef,
            Command::ReadFlash { .. } => CommandId::ReadFlash,
            Command::WriteFlash { .. } => CommandId::WriteFlash,
        }
    }

    /// Encode the request, including its prologue.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Command::LoadModel {
                model_size,
                fw_info,
            } => {
                put_u32(&mut body, *model_size);
                put_u32(&mut body, fw_info.len() as u32);
                body.extend_from_slice(fw_info);
                body.resize(body.len().next_multiple_of(4), 0);
            }
            Command::MemoryRead {
                start_address,
                length,
            }
            | Command::MemoryWrite {
                start_address,
                length,
            } => {
                put_u32(&mut body, *start_address);
                put_u32(&mut body, *length);
            }
            Command::GetModelInfo { from_ddr } => put_u32(&mut body, u32::from(*from_ddr)),
            Command::LoadFirmware {
                fw_type,
                fw_start,
                fw_size,
            } => {
                put_u32(&mut body, *fw_type);
                put_u32(&mut body, *fw_start);
                put_u32(&mut body, *fw_size);
                body.resize(body.len() + 4 * FIRMWARE_BYPASS_WORDS, 0);
            }
            Command::SetCryptoKey { key } => put_u32(&mut body, *key),
            Command::SetSecureBootKey { entry, key } => {
                put_u32(&mut body, *entry);
                put_u32(&mut body, *key);
            }
            Command::SetGpio { pin, value } => {
                put_u32(&mut body, *pin);
                put_u32(&mut body, *value);
            }
            Command::SetDebugCheckpoint { flags, enable } => {
                put_u32(&mut body, *flags);
                put_u32(&mut body, u32::from(*enable));
            }
            Command::SetProfileEnable { enable } | Command::SetPerformanceMonitor { enable } => {
                put_u32(&mut body, u32::from(*enable));
            }
            Command::LoadNef { nef_size } => put_u32(&mut body, *nef_size),
            Command::UpdateFirmware {
                firmware_id,
                firmware_size,
            } => {
                put_u32(&mut body, *firmware_id);
                put_u32(&mut body, *firmware_size);
            }
            Command::SwitchBootMode { boot_mode } => put_u32(&mut body, *boot_mode),
            Command::UpdateLoader { loader_size } => put_u32(&mut body, *loader_size),
            Command::UpdateNef {
                nef_size,
                auto_reboot,
            } => {
                put_u32(&mut body, *nef_size);
                put_u32(&mut body, u32::from(*auto_reboot));
            }
            Command::ReadFlash { offset, length } | Command::WriteFlash { offset, length } => {
                put_u32(&mut body, *offset);
                put_u32(&mut body, *length);
            }
            Command::GetSystemInfo
            | Command::LoadModelFromFlash
            | Command::GetProfileStatistics
            | Command::GetDdrConfig
            | Command::GetFifoqConfig
            | Command::GetPerformanceMonitorStatistics => {}
        }

        let mut out = Vec::with_capacity(COMMAND_PROLOGUE_SIZE + body.len());
        put_u32(&mut out, MagicType::Command.wire());
        put_u32(&mut out, (COMMAND_PROLOGUE_SIZE + body.len()) as u32);
        put_u32(&mut out, self.id() as u32);
        out.extend_from_slice(&body);
        out
    }

    /// Decode a request, prologue included.
    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        let mut r = WireReader::new(bytes);
        let magic = r.u32()?;
        if magic != MagicType::Command.wire() {
            return Err(CommandError::Frame(FrameError::InvalidField("magic_type")));
        }
        let _total_size = r.u32()?;
        let raw_id = r.u32()?;
        let id = CommandId::from_u32(raw_id).ok_or(CommandError::Unknown(raw_id))?;

        let command = match id {
            CommandId::LoadModel => {
                let model_size = r.u32()?;
                let fw_info_size = r.u32()? as usize;
                let fw_info = r.take(fw_info_size)?.to_vec();
                Command::LoadModel {
                    model_size,
                    fw_info,
                }
            }
            CommandId::MemoryRead => Command::MemoryRead {
                start_address: r.u32()?,
                length: r.u32()?,
            },
            CommandId::MemoryWrite => Command::MemoryWrite {
                start_address: r.u32()?,
                length: r.u32()?,
            },
            CommandId::GetSystemInfo => Command::GetSystemInfo,
            CommandId::GetModelInfo => Command::GetModelInfo {
                from_ddr: flag(r.u32()?),
            },
            CommandId::LoadFirmware => Command::LoadFirmware {
                fw_type: r.u32()?,
                fw_start: r.u32()?,
                fw_size: r.u32()?,
            },
            CommandId::LoadModelFromFlash => Command::LoadModelFromFlash,
            CommandId::SetCryptoKey => Command::SetCryptoKey { key: r.u32()? },
            CommandId::SetSecureBootKey => Command::SetSecureBootKey {
                entry: r.u32()?,
                key: r.u32()?,
            },
            CommandId::SetGpio => Command::SetGpio {
                pin: r.u32()?,
                value: r.u32()?,
            },
            CommandId::SetDebugCheckpoint => Command::SetDebugCheckpoint {
                flags: r.u32()?,
                enable: flag(r.u32()?),
            },
            CommandId::SetProfileEnable => Command::SetProfileEnable {
                enable: flag(r.u32()?),
            },
            CommandId::GetProfileStatistics => Command::GetProfileStatistics,
            CommandId::GetDdrConfig => Command::GetDdrConfig,
            CommandId::LoadNef => Command::LoadNef { nef_size: r.u32()? },
            CommandId::UpdateFirmware => Command::UpdateFirmware {
                firmware_id: r.u32()?,
                firmware_size: r.u32()?,
            },
            CommandId::SwitchBootMode => Command::SwitchBootMode {
                boot_mode: r.u32()?,
            },
            CommandId::UpdateLoader => Command::UpdateLoader {
                loader_size: r.u32()?,
            },
            CommandId::GetFifoqConfig => Command::GetFifoqConfig,
            CommandId::SetPerformanceMonitor => Command::SetPerformanceMonitor {
                enable: flag(r.u32()?),
            },
            CommandId::GetPerformanceMonitorStatistics => {
                Command::GetPerformanceMonitorStatistics
            }
            CommandId::UpdateNef => Command::UpdateNef {
                nef_size: r.u32()?,
                auto_reboot: flag(r.u32()?),
            },
            CommandId::ReadFlash => Command::ReadFlash {
                offset: r.u32()?,
                length: r.u32()?,
            },
            CommandId::WriteFlash => Command::WriteFlash {
                offset: r.u32()?,
                length: r.u32()?,
            },
        };
        Ok(command)
    }
}

/// A response: the return code followed by `words`.
#[must_use]
pub fn response(code: ErrorCode, words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 * (1 + words.len()));
    put_u32(&mut out, code.as_wire());
    for word in words {
        put_u32(&mut out, *word);
    }
    out
}

/// Split a response into its return code and the words that follow.
pub fn decode_response(bytes: &[u8]) -> Result<(ErrorCode, Vec<u32>), FrameError> {
    let mut r = WireReader::new(bytes);
    let code = ErrorCode::from_wire(r.u32()?);
    let mut words = Vec::with_capacity(r.remaining().len() / 4);
    while r.remaining().len() >= 4 {
        words.push(r.u32()?);
    }
    Ok((code, words))
}

/// One entry of the model table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelInfo {
    pub model_id: u32,
    pub input_count: u32,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub output_size: u32,
}

const MODEL_INFO_WORDS: usize = 6;

/// Encode a model table: `{count, [model_id, input_count, width, height,
/// channels, output_size]...}`.
#[must_use]
pub fn encode_model_table(models: &[ModelInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 * MODEL_INFO_WORDS * models.len());
    put_u32(&mut out, models.len() as u32);
    for m in models {
        for word in [
            m.model_id,
            m.input_count,
            m.width,
            m.height,
            m.channels,
            m.output_size,
        ] {
            put_u32(&mut out, word);
        }
    }
    out
}

pub fn decode_model_table(bytes: &[u8]) -> Result<Vec<ModelInfo>, FrameError> {
    let mut r = WireReader::new(bytes);
    let count = r.u32()? as usize;
    if count > r.remaining().len() / (4 * MODEL_INFO_WORDS) {
        return Err(FrameError::Truncated {
            needed: 4 + count * 4 * MODEL_INFO_WORDS,
            available: bytes.len(),
        });
    }
    (0..count)
        .map(|_| {
            Ok(ModelInfo {
                model_id: r.u32()?,
                input_count: r.u32()?,
                width: r.u32()?,
                height: r.u32()?,
                channels: r.u32()?,
                output_size: r.u32()?,
            })
        })
        .collect()
}

/// Firmware identity reported by the system info command.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub reserved: u8,
    pub major: u8,
    pub minor: u8,
    pub update: u8,
    pub build: u32,
}

impl FirmwareVersion {
    #[must_use]
    pub fn to_words(&self) -> [u32; 2] {
        [
            u32::from_le_bytes([self.reserved, self.major, self.minor, self.update]),
            self.build,
        ]
    }

    #[must_use]
    pub fn from_words(packed: u32, build: u32) -> Self {
        let [reserved, major, minor, update] = packed.to_le_bytes();
        Self {
            reserved,
            major,
            minor,
            update,
            build,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}-build.{}",
            self.major, self.minor, self.update, self.build
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prologue_carries_size_and_id() {
        let bytes = Command::SetGpio { pin: 3, value: 1 }.encode();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[4..8], &20u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0xA0Au32.to_le_bytes());
    }

    #[test]
    fn decode_load_model() {
        let models = [ModelInfo {
            model_id: 211,
            input_count: 1,
            width: 224,
            height: 224,
            channels: 3,
            output_size: 4000,
        }];
        let command = Command::LoadModel {
            model_size: 1 << 20,
            fw_info: encode_model_table(&models),
        };
        let decoded = Command::decode(&command.encode()).unwrap();
        assert_eq!(decoded, command);
        if let Command::LoadModel { fw_info, .. } = decoded {
            assert_eq!(decode_model_table(&fw_info).unwrap(), models);
        }
    }

    #[test]
    fn unknown_and_truncated_commands() {
        let mut bytes = Command::GetSystemInfo.encode();
        bytes[8..12].copy_from_slice(&0xA55u32.to_le_bytes());
        assert_eq!(Command::decode(&bytes), Err(CommandError::Unknown(0xA55)));

        let bytes = Command::MemoryRead {
            start_address: 0x6000_0000,
            length: 16,
        }
        .encode();
        assert!(matches!(
            Command::decode(&bytes[..16]),
            Err(CommandError::Frame(FrameError::Truncated { .. }))
        ));
    }

    #[test]
    fn bool_fields_use_the_low_byte() {
        let mut bytes = Command::SetProfileEnable { enable: false }.encode();
        bytes[12..16].copy_from_slice(&0x0000_0101u32.to_le_bytes());
        assert_eq!(
            Command::decode(&bytes),
            Ok(Command::SetProfileEnable { enable: true })
        );
    }

    #[test]
    fn responses_split_into_words() {
        let bytes = response(ErrorCode::Success, &[2, 20480]);
        assert_eq!(decode_response(&bytes), Ok((ErrorCode::Success, vec![2, 20480])));
    }

    #[test]
    fn version_packs_into_a_word() {
        let version = FirmwareVersion {
            reserved: 0,
            major: 2,
            minor: 3,
            update: 0,
            build: 1234,
        };
        let [packed, build] = version.to_words();
        assert_eq!(FirmwareVersion::from_words(packed, build), version);
        assert_eq!(version.to_string(), "2.3.0-build.1234");
    }
}
