//! Protocol constants for the 64drive USB command interface.

// ============================================================================
// Device Identification
// ============================================================================

/// FTDI vendor ID (both hardware revisions use an FTDI bridge).
pub const FTDI_VENDOR_ID: u16 = 0x0403;

/// Hardware revision 2 (FT232H).
pub const HW2_PRODUCT_ID: u16 = 0x6014;

/// Hardware revision 1 (FT2232H).
pub const HW1_PRODUCT_ID: u16 = 0x6010;

/// Product strings reported by the bridge EEPROM.
pub const HW2_DESCRIPTION: &str = "64drive USB device";
pub const HW1_DESCRIPTION: &str = "64drive USB device A";

// ============================================================================
// Framing
// ============================================================================

/// Literal tag following the command byte in every frame.
pub const COMMAND_TAG: [u8; 3] = *b"CMD";

/// Command byte + tag.
pub const FRAME_HEADER_SIZE: usize = 4;

/// The device command buffer holds 32 bytes: header plus 7 words.
pub const MAX_PARAMS: usize = 7;

pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_PARAMS * 4;

/// Magic word at offset 4 of the get-version response.
pub const DEV_MAGIC: u32 = 0x5544_4556; // 'UDEV'

/// Receive buffer used for the get-version exchange.
pub const VERSION_RESPONSE_SIZE: usize = 64;

/// Smallest response that still carries the magic word.
pub const VERSION_RESPONSE_MIN: usize = 8;

/// Flag bit that marks a set-CIC parameter as valid.
pub const CIC_FLAG: u32 = 1 << 31;

/// Mask for the length field of the load/dump packed parameter.
pub const LENGTH_MASK: u32 = 0x00FF_FFFF;

/// Bank identifier position in the load/dump packed parameter.
pub const BANK_SHIFT: u32 = 24;

// ============================================================================
// Transfer Sizing
// ============================================================================

pub const ONE_K: u64 = 1024;
pub const ONE_MB: u64 = 1024 * 1024;

/// Chunk size granularity.
pub const CHUNK_QUANTUM: u64 = 128 * ONE_K;

/// Above this length transfers use `LARGE_CHUNK_UNITS`.
pub const LARGE_TRANSFER_THRESHOLD: u64 = 16 * ONE_MB;

/// Above this length transfers use `MEDIUM_CHUNK_UNITS`.
pub const MEDIUM_TRANSFER_THRESHOLD: u64 = 2 * ONE_MB;

pub const LARGE_CHUNK_UNITS: u64 = 32;
pub const MEDIUM_CHUNK_UNITS: u64 = 16;
pub const SMALL_CHUNK_UNITS: u64 = 4;

/// Download length when neither the caller nor the bank table knows better.
pub const MAX_REGION_SIZE: u64 = 256 * ONE_MB;

// ============================================================================
// Retry Bounds
// ============================================================================

/// Get-version exchanges before the handshake gives up.
pub const HANDSHAKE_ATTEMPTS: u32 = 4;

/// Bulk write/read attempts per chunk.
pub const BULK_ATTEMPTS: u32 = 5;

/// Delay before each bulk retry.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 10;

// ============================================================================
// Bridge Configuration
// ============================================================================

/// Latency timer value programmed during initialization (maximum).
pub const LATENCY_TIMER_MAX: u8 = 255;

/// Every data line participates in sync FIFO mode.
pub const BITMODE_ALL_PINS: u8 = 0xFF;
