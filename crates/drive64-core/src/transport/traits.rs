//! USB Transport layer abstraction.
//!
//! Defines the `BulkTransport` trait for the FTDI-bridged bulk link,
//! allowing different implementations (nusb, mock, etc.).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Control request {request} failed: {message}")]
    ControlFailed {
        request: &'static str,
        message: String,
    },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bridge operating mode selected with `set_bitmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitMode {
    /// Back to the default serial/FIFO mode.
    Reset = 0x00,
    /// Synchronous 245 FIFO, required for full HW2 throughput.
    SyncFifo = 0x40,
}

/// Abstract transport interface.
///
/// Mirrors the bridge capabilities the protocol needs. A `write` or `read`
/// that returns `Ok(0)` moved nothing and is treated as a failed attempt.
pub trait BulkTransport {
    /// Reset the bridge (SIO reset).
    fn reset(&mut self) -> Result<(), TransportError>;

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<(), TransportError>;

    fn set_latency_timer(&mut self, ms: u8) -> Result<(), TransportError>;

    /// Drop stale bytes in both directions.
    fn purge_buffers(&mut self) -> Result<(), TransportError>;

    /// Largest single USB transfer used by `write`.
    fn set_write_chunk_size(&mut self, size: usize) -> Result<(), TransportError>;

    /// Largest single USB transfer used by `read`.
    fn set_read_chunk_size(&mut self, size: usize) -> Result<(), TransportError>;

    /// Write raw bytes, returning how many the device accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read into `buf`, returning how many bytes arrived.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;
}
