//! Device identification: hardware revisions and firmware variant tags.

use std::fmt;

use crate::protocol::constants::{
    FTDI_VENDOR_ID, HW1_DESCRIPTION, HW1_PRODUCT_ID, HW2_DESCRIPTION, HW2_PRODUCT_ID,
};

/// Hardware revision, fixed by which USB identity answered the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HardwareVersion {
    #[default]
    Unknown,
    V1,
    V2,
}

impl HardwareVersion {
    pub fn number(self) -> u8 {
        match self {
            HardwareVersion::Unknown => 0,
            HardwareVersion::V1 => 1,
            HardwareVersion::V2 => 2,
        }
    }

    /// HW2 bridges run in synchronous FIFO mode.
    pub fn uses_sync_fifo(self) -> bool {
        self == HardwareVersion::V2
    }
}

impl fmt::Display for HardwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareVersion::Unknown => write!(f, "HW?"),
            other => write!(f, "HW{}", other.number()),
        }
    }
}

/// Firmware variant tag: the first three bytes of the get-version response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Variant(pub [u8; 3]);

impl Variant {
    /// Revision A boards cannot switch CIC mode.
    pub fn supports_cic(&self) -> bool {
        self.0[0] != b'A'
    }

    pub fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// USB identity of one hardware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
    pub version: HardwareVersion,
    pub description: &'static str,
}

/// Probe order used by discovery: newest revision first.
pub const KNOWN_DEVICES: &[DeviceId] = &[
    DeviceId {
        vendor_id: FTDI_VENDOR_ID,
        product_id: HW2_PRODUCT_ID,
        version: HardwareVersion::V2,
        description: HW2_DESCRIPTION,
    },
    DeviceId {
        vendor_id: FTDI_VENDOR_ID,
        product_id: HW1_PRODUCT_ID,
        version: HardwareVersion::V1,
        description: HW1_DESCRIPTION,
    },
];
