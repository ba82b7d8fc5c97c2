//! Protocol module - 64drive command protocol definitions.

pub mod command;
pub mod constants;
pub mod frame;

pub use command::Command;
pub use constants::*;
pub use frame::{CommandFrame, FrameError, VersionResponse, frame};
