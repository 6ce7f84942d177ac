use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::{io, result};

use num_enum::TryFromPrimitive;

pub type DeviceResult<T> = result::Result<T, DeviceError>;

/// Error codes reported by the SkyWatcher motor controller in `!<code>`
/// responses.
#[derive(Debug, Eq, PartialEq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum McErrorCode {
    UnknownCommand = 0,
    CommandLengthError = 1,
    MotorNotStopped = 2,
    InvalidCharacter = 3,
    NotInitialized = 4,
    DriverSleeping = 5,
    MountNotTracking = 6,
    PecTrainingRunning = 7,
    NoValidPecData = 8,
}

impl Display for McErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = match self {
            McErrorCode::UnknownCommand => "unknown command",
            McErrorCode::CommandLengthError => "command length error",
            McErrorCode::MotorNotStopped => "motor not stopped",
            McErrorCode::InvalidCharacter => "invalid character",
            McErrorCode::NotInitialized => "not initialized",
            McErrorCode::DriverSleeping => "driver sleeping",
            McErrorCode::MountNotTracking => "mount not tracking",
            McErrorCode::PecTrainingRunning => "PEC training running",
            McErrorCode::NoValidPecData => "no valid PEC data",
        };
        write!(f, "{}", msg)
    }
}

/// Failure of a single request/response transaction against a serial backend.
#[derive(Debug)]
pub enum DeviceError {
    /// No terminator arrived within the configured deadline.
    Timeout { partial: Vec<u8> },
    /// The axis did not report initialized within the allotted time.
    InitTimeout,
    /// Response framing did not match the protocol.
    MalformedResponse(String),
    /// The device answered with an error frame.
    Device(McErrorCode),
    /// The device answered with an error frame carrying an unrecognized code.
    UnknownDeviceError(u8),
    Io(io::Error),
    /// Panic or cancellation on the blocking offload.
    Internal(String),
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Timeout { partial } => {
                write!(f, "transaction timeout, got {:?}", partial)
            }
            DeviceError::InitTimeout => write!(f, "axis initialization timed out"),
            DeviceError::MalformedResponse(got) => write!(f, "malformed response: {}", got),
            DeviceError::Device(code) => write!(f, "device error: {}", code),
            DeviceError::UnknownDeviceError(code) => write!(f, "device error code {}", code),
            DeviceError::Io(e) => write!(f, "serial I/O error: {}", e),
            DeviceError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for DeviceError {}

impl From<io::Error> for DeviceError {
    fn from(e: io::Error) -> Self {
        DeviceError::Io(e)
    }
}

/// Coordinator-level failures surfaced to the protocol dispatcher.
#[derive(Debug)]
pub enum MountError {
    /// GOTO/SYNC need both target RA and DEC set beforehand.
    TargetNotSet,
    Device(DeviceError),
}

impl Display for MountError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MountError::TargetNotSet => {
                write!(f, "target not set; send :Sr and :Sd before GOTO/SYNC")
            }
            MountError::Device(e) => write!(f, "{}", e),
        }
    }
}

impl Error for MountError {}

impl From<DeviceError> for MountError {
    fn from(e: DeviceError) -> Self {
        MountError::Device(e)
    }
}
