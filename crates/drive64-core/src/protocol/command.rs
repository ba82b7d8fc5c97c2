//! Command codes understood by the device firmware.

use std::fmt;

/// Device command byte (first byte of every frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Host to device RAM, followed by a bulk payload.
    LoadRam = 0x20,
    /// Device RAM to host, followed by a bulk read.
    DumpRam = 0x30,
    SetSaveType = 0x70,
    SetCic = 0x72,
    GetVersion = 0x80,
    Upgrade = 0x84,
    UpgradeReport = 0x85,
    StandardEnter = 0x88,
    StandardLeave = 0x89,
    PiRead32 = 0x90,
    PiWrite32 = 0x91,
    PiReadBurst = 0x92,
    PiWriteBurst = 0x93,
    PiWriteBlock = 0x94,
    PiWriteBlockLong = 0x95,
    SiOperation = 0x98,
}

impl Command {
    pub const ALL: [Command; 16] = [
        Command::LoadRam,
        Command::DumpRam,
        Command::SetSaveType,
        Command::SetCic,
        Command::GetVersion,
        Command::Upgrade,
        Command::UpgradeReport,
        Command::StandardEnter,
        Command::StandardLeave,
        Command::PiRead32,
        Command::PiWrite32,
        Command::PiReadBurst,
        Command::PiWriteBurst,
        Command::PiWriteBlock,
        Command::PiWriteBlockLong,
        Command::SiOperation,
    ];

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::LoadRam => "LOADRAM",
            Command::DumpRam => "DUMPRAM",
            Command::SetSaveType => "SETSAVE",
            Command::SetCic => "SETCIC",
            Command::GetVersion => "GETVER",
            Command::Upgrade => "UPGRADE",
            Command::UpgradeReport => "UPGREPORT",
            Command::StandardEnter => "STD_ENTER",
            Command::StandardLeave => "STD_LEAVE",
            Command::PiRead32 => "PI_RD_32",
            Command::PiWrite32 => "PI_WR_32",
            Command::PiReadBurst => "PI_RD_BURST",
            Command::PiWriteBurst => "PI_WR_BURST",
            Command::PiWriteBlock => "PI_WR_BL",
            Command::PiWriteBlockLong => "PI_WR_BL_LONG",
            Command::SiOperation => "SI_OP",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}
