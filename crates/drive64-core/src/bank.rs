//! Memory banks addressable through load/dump commands.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::constants::{BANK_SHIFT, LENGTH_MASK, ONE_K, ONE_MB};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown bank '{0}' (expected rom, sram256, sram768, flash, pokemon, eeprom or 1-6)")]
pub struct ParseBankError(String);

/// Logical memory region on the cartridge.
///
/// The identifier goes into the top byte of the load/dump length word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Bank {
    Invalid = 0,
    /// Cartridge ROM.
    #[default]
    #[serde(rename = "rom")]
    CartRom = 1,
    /// 256 Kbit SRAM.
    Sram256 = 2,
    /// 768 Kbit SRAM (Dezaemon 3D).
    Sram768 = 3,
    /// 1 Mbit FlashRAM.
    #[serde(rename = "flash")]
    FlashRam1M = 4,
    /// 1 Mbit FlashRAM, Pokemon Stadium 2 layout.
    #[serde(rename = "pokemon")]
    FlashPkm1M = 5,
    /// 16 Kbit EEPROM.
    #[serde(rename = "eeprom")]
    Eeprom16 = 6,
}

impl Bank {
    pub const ALL: [Bank; 7] = [
        Bank::Invalid,
        Bank::CartRom,
        Bank::Sram256,
        Bank::Sram768,
        Bank::FlashRam1M,
        Bank::FlashPkm1M,
        Bank::Eeprom16,
    ];

    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Bank::Invalid => "invalid",
            Bank::CartRom => "rom",
            Bank::Sram256 => "sram256",
            Bank::Sram768 => "sram768",
            Bank::FlashRam1M => "flash",
            Bank::FlashPkm1M => "pokemon",
            Bank::Eeprom16 => "eeprom",
        }
    }

    /// Addressable size of the bank in bytes.
    pub fn capacity(self) -> Option<u64> {
        match self {
            Bank::Invalid => None,
            Bank::CartRom => Some(64 * ONE_MB),
            Bank::Sram256 => Some(32 * ONE_K),
            Bank::Sram768 => Some(96 * ONE_K),
            Bank::FlashRam1M | Bank::FlashPkm1M => Some(128 * ONE_K),
            Bank::Eeprom16 => Some(2 * ONE_K),
        }
    }

    /// Second load/dump parameter: 24-bit length with the bank id on top.
    pub fn packed_length(self, len: usize) -> u32 {
        (len as u32 & LENGTH_MASK) | ((self.id() as u32) << BANK_SHIFT)
    }
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Bank {
    type Err = ParseBankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(bank) = Self::ALL
            .into_iter()
            .find(|b| *b != Bank::Invalid && b.name().eq_ignore_ascii_case(s))
        {
            return Ok(bank);
        }
        // Numeric ids as accepted by the vendor tool.
        match s.parse::<u8>().ok().and_then(Bank::from_id) {
            Some(bank) if bank != Bank::Invalid => Ok(bank),
            _ => Err(ParseBankError(s.to_string())),
        }
    }
}
