//! CIC (boot lockout chip) variants the cartridge can emulate.

use std::fmt;

use thiserror::Error;

use crate::protocol::constants::CIC_FLAG;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown CIC {0} (expected 6101, 6102, 7101, 7102, 103, 105, 106, 5101 or 0-7)")]
pub struct UnknownCic(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cic {
    Cic6101 = 0,
    Cic6102 = 1,
    Cic7101 = 2,
    Cic7102 = 3,
    X103 = 4,
    X105 = 5,
    X106 = 6,
    Cic5101 = 7,
}

impl Cic {
    pub const ALL: [Cic; 8] = [
        Cic::Cic6101,
        Cic::Cic6102,
        Cic::Cic7101,
        Cic::Cic7102,
        Cic::X103,
        Cic::X105,
        Cic::X106,
        Cic::Cic5101,
    ];

    /// Protocol code (index into the firmware's table).
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Part number printed on the chip.
    pub fn number(self) -> u32 {
        match self {
            Cic::Cic6101 => 6101,
            Cic::Cic6102 => 6102,
            Cic::Cic7101 => 7101,
            Cic::Cic7102 => 7102,
            Cic::X103 => 103,
            Cic::X105 => 105,
            Cic::X106 => 106,
            Cic::Cic5101 => 5101,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Cic::Cic6101 => "Star Fox",
            Cic::Cic6102 => "most NTSC games",
            Cic::Cic7101 => "most PAL games",
            Cic::Cic7102 => "Lylat Wars",
            Cic::X103 => "covers 6103 and 7103",
            Cic::X105 => "covers 6105 and 7105",
            Cic::X106 => "covers 6106 and 7106",
            Cic::Cic5101 => "Aleck64",
        }
    }

    /// Look up by part number, or by table index (0-7) like the vendor tool.
    pub fn from_number(num: u32) -> Result<Self, UnknownCic> {
        Self::ALL
            .into_iter()
            .find(|c| c.number() == num || c.code() as u32 == num)
            .ok_or(UnknownCic(num))
    }

    /// Set-CIC parameter: flag bit plus code.
    pub fn command_param(self) -> u32 {
        CIC_FLAG | self.code() as u32
    }
}

impl fmt::Display for Cic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.description())
    }
}
