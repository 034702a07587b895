// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Status values used across the pipeline.
//!
//! Everything that crosses the transport is an [`ErrorCode`] from one flat
//! integer space. Inside the device the queues report a [`QueueError`] and
//! the transport a [`TransportError`].

use std::error::Error;
use std::fmt;

use npu_engine::types::SimError;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// The flat status space shared by the host and the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,

    // Host-side errors
    MemoryAllocationFailure = 9,
    DeviceNotExist = 10,
    DeviceIncorrectResponse = 11,
    InvalidParam = 12,
    SendDescFail = 13,
    SendDataFail = 14,
    SendDataTooLarge = 15,
    RecvDescFail = 16,
    RecvDataFail = 17,
    RecvDataTooLarge = 18,
    FwUpdateFailed = 19,
    FileOpenFailed = 20,
    InvalidModel = 21,
    ImageResolutionTooSmall = 22,
    ImageInvalidWidth = 23,
    InvalidFirmware = 24,
    ResetFailed = 25,
    DevicesNumber = 26,
    ConfigureDevice = 27,
    ConnectFailed = 28,
    DeviceGroupMixProduct = 29,
    ReceiveIncorrectHeaderStamp = 30,
    ReceiveSizeMismatch = 31,
    ReceiveJobIdMismatch = 32,
    InvalidCustomizedJobId = 33,
    FwLoadFailed = 34,
    ModelNotLoaded = 35,
    InvalidCheckpointData = 36,
    DbgCheckpointEnd = 37,
    InvalidHost = 38,
    MemoryFreeFailure = 39,
    UsbBootLoadSecondModel = 40,
    CheckFwVersionFailed = 41,
    FifoqInputBuffCountNotEnough = 42,
    FifoqSettingFailed = 43,
    UnsupportedDevice = 44,

    Other = 99,

    // Firmware errors
    UnknownApp = 100,
    InferenceError = 101,
    DdrMallocFailed = 102,
    InferenceTimeout = 103,
    LoadModelFailed = 104,
    PostProcMallocFailed = 105,
    PostProcNoSpace = 106,
    ImageSizeNotMatchModelInput = 107,
    NotSupportPreprocessing = 108,
    GetModelInfoFailed = 109,
    WrongInputBufferCount = 110,
    InvalidPreProcModelInputSize = 111,
    InvalidInputCropParam = 112,
    FwFileOpenFailed = 113,
    FileStateFailed = 114,
    FileReadFailed = 115,
    FileWriteFailed = 116,
    FileChmodFailed = 117,
    FileFailedOther = 118,
    InvalidBootConfig = 119,
    LoaderError = 120,
    PosixSpawnFailed = 121,
    UsbSendFailed = 122,
    UsbReceiveFailed = 123,

    // Co-processor errors
    NcpuErrBegin = 200,
    NcpuInvalidImage = 201,

    // eFuse errors
    EfuseCanNotBurn = 300,
    EfuseProtected = 301,
    EfuseOther = 302,
}

impl ErrorCode {
    /// Decode a raw status, mapping anything unknown to [`ErrorCode::Other`].
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        Self::from_i32(raw).unwrap_or(ErrorCode::Other)
    }

    /// Decode a status word as it appears on the wire.
    #[must_use]
    pub fn from_wire(raw: u32) -> Self {
        Self::from_raw(raw as i32)
    }

    #[must_use]
    pub fn as_raw(self) -> i32 {
        self.to_i32().unwrap_or(ErrorCode::Other as i32)
    }

    #[must_use]
    pub fn as_wire(self) -> u32 {
        self.as_raw() as u32
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// Human-readable description of the code.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Success => "No error",
            ErrorCode::MemoryAllocationFailure => "Memory allocation failed",
            ErrorCode::DeviceNotExist => "Device does not exist",
            ErrorCode::DeviceIncorrectResponse => "Device responded incorrectly",
            ErrorCode::InvalidParam => "Invalid parameter",
            ErrorCode::SendDescFail => "Sending the descriptor failed",
            ErrorCode::SendDataFail => "Sending data failed",
            ErrorCode::SendDataTooLarge => "Data to send is too large",
            ErrorCode::RecvDescFail => "Receiving the descriptor failed",
            ErrorCode::RecvDataFail => "Receiving data failed",
            ErrorCode::RecvDataTooLarge => "Received data is too large",
            ErrorCode::FwUpdateFailed => "Firmware update failed",
            ErrorCode::FileOpenFailed => "Failed to open file",
            ErrorCode::InvalidModel => "Invalid model",
            ErrorCode::ImageResolutionTooSmall => "Image resolution is smaller than model's",
            ErrorCode::ImageInvalidWidth => {
                "Image width is not compliant with the target platform's requirement"
            }
            ErrorCode::InvalidFirmware => "Invalid firmware",
            ErrorCode::ResetFailed => "Reset failed",
            ErrorCode::DevicesNumber => "Invalid number of devices",
            ErrorCode::ConfigureDevice => "Failed to configure device",
            ErrorCode::ConnectFailed => "Failed to connect device",
            ErrorCode::DeviceGroupMixProduct => "Device group mixes different products",
            ErrorCode::ReceiveIncorrectHeaderStamp => "Received an incorrect header stamp",
            ErrorCode::ReceiveSizeMismatch => "Received size does not match",
            ErrorCode::ReceiveJobIdMismatch => "Received job id does not match",
            ErrorCode::InvalidCustomizedJobId => "Customized job id is invalid",
            ErrorCode::FwLoadFailed => "Firmware load failed",
            ErrorCode::ModelNotLoaded => "Model is not loaded",
            ErrorCode::InvalidCheckpointData => "Invalid checkpoint data",
            ErrorCode::DbgCheckpointEnd => "End of debug checkpoints",
            ErrorCode::InvalidHost => "Invalid host",
            ErrorCode::MemoryFreeFailure => "Memory free failed",
            ErrorCode::UsbBootLoadSecondModel => "USB boot cannot load a second model",
            ErrorCode::CheckFwVersionFailed => "Firmware version check failed",
            ErrorCode::FifoqInputBuffCountNotEnough => "Not enough FIFO queue input buffers",
            ErrorCode::FifoqSettingFailed => "FIFO queue setting failed",
            ErrorCode::UnsupportedDevice => "Unsupported device",
            ErrorCode::Other => "Unknown error",
            ErrorCode::UnknownApp => "Unknown application",
            ErrorCode::InferenceError => "Inference error",
            ErrorCode::DdrMallocFailed => "DDR memory allocation failed",
            ErrorCode::InferenceTimeout => "Inference timeout",
            ErrorCode::LoadModelFailed => "Model load failed",
            ErrorCode::PostProcMallocFailed => "Post-processing memory allocation failed",
            ErrorCode::PostProcNoSpace => "Post-processing ran out of space",
            ErrorCode::ImageSizeNotMatchModelInput => "Image size does not match model input",
            ErrorCode::NotSupportPreprocessing => "Pre-processing combination not supported",
            ErrorCode::GetModelInfoFailed => "Failed to get model info",
            ErrorCode::WrongInputBufferCount => "Wrong number of input buffers",
            ErrorCode::InvalidPreProcModelInputSize => "Invalid pre-process model input size",
            ErrorCode::InvalidInputCropParam => "Invalid input crop parameter",
            ErrorCode::FwFileOpenFailed => "Firmware failed to open file",
            ErrorCode::FileStateFailed => "Failed to stat file",
            ErrorCode::FileReadFailed => "Failed to read file",
            ErrorCode::FileWriteFailed => "Failed to write file",
            ErrorCode::FileChmodFailed => "Failed to chmod file",
            ErrorCode::FileFailedOther => "File operation failed",
            ErrorCode::InvalidBootConfig => "Invalid boot configuration",
            ErrorCode::LoaderError => "Loader error",
            ErrorCode::PosixSpawnFailed => "Failed to spawn process",
            ErrorCode::UsbSendFailed => "USB send failed",
            ErrorCode::UsbReceiveFailed => "USB receive failed",
            ErrorCode::NcpuErrBegin => "Co-processor error",
            ErrorCode::NcpuInvalidImage => "Co-processor rejected the image",
            ErrorCode::EfuseCanNotBurn => "eFuse cannot be burned",
            ErrorCode::EfuseProtected => "eFuse is protected",
            ErrorCode::EfuseOther => "eFuse operation failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", ErrorCode::description(*self), self.as_raw())
    }
}

impl Error for ErrorCode {}

impl From<ErrorCode> for SimError {
    fn from(code: ErrorCode) -> Self {
        SimError(code.to_string())
    }
}

/// Failure of a queue operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The operation waited for its whole timeout.
    Timeout,

    /// The operation could not complete without waiting.
    ResourceExhausted,

    /// The request was malformed (or the queues do not exist yet).
    InvalidParameter,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Timeout => write!(f, "queue operation timed out"),
            QueueError::ResourceExhausted => write!(f, "queue resource exhausted"),
            QueueError::InvalidParameter => write!(f, "invalid queue parameter"),
        }
    }
}

impl Error for QueueError {}

impl From<QueueError> for SimError {
    fn from(error: QueueError) -> Self {
        SimError(error.to_string())
    }
}

/// A value handed to a queue that could not be accepted.
///
/// The item is given back so that a failed put never loses a buffer.
#[derive(Debug)]
pub struct Rejected<T> {
    pub item: T,
    pub error: QueueError,
}

impl<T> Rejected<T> {
    #[must_use]
    pub fn new(item: T, error: QueueError) -> Self {
        Self { item, error }
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected: {}", self.error)
    }
}

/// Failure on the transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// The link went away.
    Disconnected,

    /// The transfer on the endpoint was aborted locally.
    Terminated,

    /// The transfer did not complete in time.
    Timeout,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Disconnected => write!(f, "link disconnected"),
            TransportError::Terminated => write!(f, "transfer terminated"),
            TransportError::Timeout => write!(f, "transfer timed out"),
        }
    }
}

impl Error for TransportError {}

impl From<TransportError> for SimError {
    fn from(error: TransportError) -> Self {
        SimError(error.to_string())
    }
}

impl From<TransportError> for ErrorCode {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Disconnected => ErrorCode::DeviceNotExist,
            TransportError::Terminated => ErrorCode::RecvDataFail,
            TransportError::Timeout => ErrorCode::UsbReceiveFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_round_trip() {
        for code in [
            ErrorCode::Success,
            ErrorCode::UnsupportedDevice,
            ErrorCode::InferenceTimeout,
            ErrorCode::UsbReceiveFailed,
            ErrorCode::NcpuInvalidImage,
            ErrorCode::EfuseOther,
        ] {
            assert_eq!(ErrorCode::from_raw(code.as_raw()), code);
        }
    }

    #[test]
    fn unknown_values_are_other() {
        assert_eq!(ErrorCode::from_raw(45), ErrorCode::Other);
        assert_eq!(ErrorCode::from_raw(-1), ErrorCode::Other);
        assert_eq!(ErrorCode::from_wire(0xFFFF_FFFF), ErrorCode::Other);
    }

    #[test]
    fn display_includes_value() {
        assert_eq!(
            ErrorCode::WrongInputBufferCount.to_string(),
            "Wrong number of input buffers (110)"
        );
        let sim: SimError = ErrorCode::InferenceTimeout.into();
        assert_eq!(sim.to_string(), "Error: Inference timeout (103)");
    }
}
