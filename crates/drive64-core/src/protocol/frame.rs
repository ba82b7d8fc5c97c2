//! Command frames and the get-version response.
//!
//! Every host-to-device command is a single bulk write:
//!
//! ```text
//! [cmd:1]['C','M','D':3][param0:4 BE]...[paramN:4 BE]   N <= 7
//! ```
//!
//! The device is big-endian, so parameters are always encoded big-endian
//! regardless of host byte order.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::command::Command;
use super::constants::{
    COMMAND_TAG, DEV_MAGIC, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, MAX_PARAMS, VERSION_RESPONSE_MIN,
};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Too many parameters: {count} (maximum {max})", max = MAX_PARAMS)]
    TooManyParams { count: usize },
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Missing CMD tag: got {tag:02X?}")]
    MissingTag { tag: [u8; 3] },
    #[error("Unknown command code 0x{0:02X}")]
    UnknownCommand(u8),
    #[error("Parameter region is not word aligned: {0} bytes")]
    Misaligned(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A validated command frame (at most [`MAX_PARAMS`] parameters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    command: Command,
    params: [u32; MAX_PARAMS],
    count: usize,
}

impl CommandFrame {
    pub fn new(command: Command, params: &[u32]) -> Result<Self, FrameError> {
        if params.len() > MAX_PARAMS {
            return Err(FrameError::TooManyParams {
                count: params.len(),
            });
        }
        let mut words = [0u32; MAX_PARAMS];
        words[..params.len()].copy_from_slice(params);
        Ok(Self {
            command,
            params: words,
            count: params.len(),
        })
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn params(&self) -> &[u32] {
        &self.params[..self.count]
    }

    /// Encoded size: 4 + 4 * params.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.count * 4
    }

    /// Encode into `buf`, returning the number of bytes used.
    pub fn encode_into(&self, buf: &mut [u8; MAX_FRAME_SIZE]) -> usize {
        buf[0] = self.command.code();
        buf[1..FRAME_HEADER_SIZE].copy_from_slice(&COMMAND_TAG);
        for (i, &param) in self.params().iter().enumerate() {
            let at = FRAME_HEADER_SIZE + i * 4;
            BigEndian::write_u32(&mut buf[at..at + 4], param);
        }
        self.encoded_len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = self.encode_into(&mut buf);
        buf[..len].to_vec()
    }

    /// Decode a frame as the device would see it.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::BufferTooSmall {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let tag = [data[1], data[2], data[3]];
        if tag != COMMAND_TAG {
            return Err(FrameError::MissingTag { tag });
        }
        let command = Command::from_code(data[0]).ok_or(FrameError::UnknownCommand(data[0]))?;

        let body = &data[FRAME_HEADER_SIZE..];
        if body.len() % 4 != 0 {
            return Err(FrameError::Misaligned(body.len()));
        }
        let count = body.len() / 4;
        if count > MAX_PARAMS {
            return Err(FrameError::TooManyParams { count });
        }

        let mut params = [0u32; MAX_PARAMS];
        let mut cursor = Cursor::new(body);
        for slot in params.iter_mut().take(count) {
            *slot = cursor.read_u32::<BigEndian>()?;
        }
        Ok(Self {
            command,
            params,
            count,
        })
    }
}

/// Build the wire bytes for `command` with `params`.
///
/// Fails without producing anything when more than [`MAX_PARAMS`]
/// parameters are given.
pub fn frame(command: Command, params: &[u32]) -> Result<Vec<u8>, FrameError> {
    CommandFrame::new(command, params).map(|f| f.to_bytes())
}

/// Decoded get-version response.
///
/// Layout: bytes 0..3 variant tag, byte 3 unused, word at offset 4 magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionResponse {
    pub variant: [u8; 3],
    pub magic: u32,
}

impl VersionResponse {
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < VERSION_RESPONSE_MIN {
            return Err(FrameError::BufferTooSmall {
                expected: VERSION_RESPONSE_MIN,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(&data[4..]);
        Ok(Self {
            variant: [data[0], data[1], data[2]],
            magic: cursor.read_u32::<BigEndian>()?,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.magic == DEV_MAGIC
    }

    /// Composite identifier: variant bytes in the top three bytes.
    pub fn identifier(&self) -> u32 {
        (self.variant[0] as u32) << 24 | (self.variant[1] as u32) << 16 | (self.variant[2] as u32) << 8
    }

    /// Response bytes as the device sends them.
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[..3].copy_from_slice(&self.variant);
        BigEndian::write_u32(&mut buf[4..8], self.magic);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let bytes = frame(Command::LoadRam, &[0x0012_3456, 0x0108_0000]).unwrap();
        assert_eq!(
            bytes,
            vec![
                0x20, b'C', b'M', b'D', 0x00, 0x12, 0x34, 0x56, 0x01, 0x08, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_frame_length_for_every_param_count() {
        let params = [1u32, 0xDEAD_BEEF, 3, 4, 0x8000_0000, 6, 7];
        for n in 0..=MAX_PARAMS {
            let bytes = frame(Command::SiOperation, &params[..n]).unwrap();
            assert_eq!(bytes.len(), 4 + 4 * n);

            let decoded = CommandFrame::from_bytes(&bytes).unwrap();
            assert_eq!(decoded.command(), Command::SiOperation);
            assert_eq!(decoded.params(), &params[..n]);
        }
    }

    #[test]
    fn test_params_are_big_endian_on_any_host() {
        let bytes = frame(Command::SetCic, &[0x8000_0001]).unwrap();
        assert_eq!(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 0x8000_0001);
        assert_eq!(&bytes[4..8], &[0x80, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_too_many_params() {
        let err = frame(Command::GetVersion, &[0; 8]).unwrap_err();
        assert!(matches!(err, FrameError::TooManyParams { count: 8 }));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(matches!(
            CommandFrame::from_bytes(b"\x80CM"),
            Err(FrameError::BufferTooSmall { .. })
        ));
        assert!(matches!(
            CommandFrame::from_bytes(b"\x80XYZ"),
            Err(FrameError::MissingTag { .. })
        ));
        assert!(matches!(
            CommandFrame::from_bytes(b"\x01CMD"),
            Err(FrameError::UnknownCommand(0x01))
        ));
        assert!(matches!(
            CommandFrame::from_bytes(b"\x80CMD\x00\x00"),
            Err(FrameError::Misaligned(2))
        ));
    }

    #[test]
    fn test_version_response() {
        let raw = [b'B', b'2', b'A', 0, 0x55, 0x44, 0x45, 0x56, 0, 0, 0, 0];
        let resp = VersionResponse::parse(&raw).unwrap();
        assert!(resp.is_valid());
        assert_eq!(&resp.variant, b"B2A");
        assert_eq!(resp.identifier(), 0x4232_4100);
        assert_eq!(resp.to_bytes(), raw);
    }

    #[test]
    fn test_version_response_bad_magic() {
        let raw = [b'B', b'2', b'A', 0, 0x56, 0x45, 0x44, 0x55];
        let resp = VersionResponse::parse(&raw).unwrap();
        assert!(!resp.is_valid());
        assert!(VersionResponse::parse(&raw[..7]).is_err());
    }
}
