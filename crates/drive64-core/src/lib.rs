//! drive64-core: host-side protocol engine for the 64drive N64 development cartridge.
//!
//! The 64drive sits behind an FTDI USB bridge. This crate opens it, puts the
//! bridge into the right mode, verifies the firmware, and moves data between
//! host streams and the cartridge memory banks in retried bulk chunks.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Command codes, frame encoding, version response
//! - **Transport**: Bridge abstraction (nusb, mock)
//! - **Session**: Discovery, bridge setup, handshake, single commands
//! - **Transfer**: Chunk sizing, bulk retry, upload and download
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use drive64_core::{Bank, DriveConfig, DriveSession, Region};
//!
//! let mut session = DriveSession::open(DriveConfig::default()).expect("no 64drive");
//! let mut rom = File::open("game.z64").unwrap();
//! let len = rom.metadata().unwrap().len();
//! session
//!     .upload(Region::new(Bank::CartRom, 0), len, &mut rom)
//!     .expect("upload failed");
//! ```

pub mod bank;
pub mod cic;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use bank::Bank;
pub use cic::Cic;
pub use config::DriveConfig;
pub use device::{DeviceId, HardwareVersion, KNOWN_DEVICES, Variant};
pub use error::{DriveError, HandshakeError, Result};
pub use events::{Direction, DriveEvent, DriveObserver, NullObserver, SessionState, TracingObserver};
pub use protocol::{Command, CommandFrame, FrameError};
pub use session::DriveSession;
pub use transfer::{ChunkPlan, Region, RetryPolicy, TransferReport, stream_remaining};
pub use transport::{BulkTransport, MockTransport, NusbTransport, TransportError};
