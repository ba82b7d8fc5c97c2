//! Engine-level errors.

use thiserror::Error;

use crate::device::Variant;
use crate::events::Direction;
use crate::protocol::constants::MAX_PARAMS;
use crate::protocol::{Command, FrameError};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error(
        "Communication failure: incorrect magic 0x{last_magic:08X} after {attempts} attempts. \
         Unplug the USB cable, turn off the console, then try again"
    )]
    MagicMismatch { attempts: u32, last_magic: u32 },

    #[error("Get-version exchange failed: {0}")]
    Transport(#[source] TransportError),
}

#[derive(Error, Debug)]
pub enum DriveError {
    #[error("64drive device not found")]
    DeviceNotFound,

    #[error("Device initialization failed at {step}: {source}")]
    Initialization {
        step: &'static str,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("{direction} failed after {bytes_transferred} bytes: {source}")]
    TransferIo {
        direction: Direction,
        bytes_transferred: u64,
        #[source]
        source: TransportError,
    },

    #[error("{direction} stream error after {bytes_transferred} bytes: {source}")]
    Stream {
        direction: Direction,
        bytes_transferred: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} is not supported by hardware variant {variant}")]
    Unsupported {
        operation: &'static str,
        variant: Variant,
    },

    #[error("Too many command parameters: {count} (maximum {max})", max = MAX_PARAMS)]
    ParameterOverflow { count: usize },

    #[error("Command {command} failed: {source}")]
    Command {
        command: Command,
        #[source]
        source: TransportError,
    },

    #[error("Protocol error: {0}")]
    Protocol(FrameError),
}

impl From<FrameError> for DriveError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::TooManyParams { count } => DriveError::ParameterOverflow { count },
            other => DriveError::Protocol(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriveError>;
