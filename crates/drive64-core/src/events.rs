//! Event system for UI decoupling.
//!
//! Allows the CLI (or anything else) to follow session and transfer
//! progress without the engine printing anything itself.

use std::fmt;

use crate::device::HardwareVersion;
use crate::protocol::Command;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    /// Probing known USB identities.
    Opening,
    /// Bridge configured, verifying the firmware answers.
    Handshaking,
    /// Version verified; commands and transfers allowed.
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Closed => write!(f, "Closed"),
            SessionState::Opening => write!(f, "Opening"),
            SessionState::Handshaking => write!(f, "Handshaking"),
            SessionState::Ready => write!(f, "Ready"),
        }
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Upload,
    /// Device to host.
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// Events emitted by a drive session.
#[derive(Debug, Clone)]
pub enum DriveEvent {
    /// A known USB identity answered the probe.
    DeviceOpened {
        vid: u16,
        pid: u16,
        version: HardwareVersion,
    },
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Command frame written.
    CommandSent { command: Command, params: Vec<u32> },
    /// Get-version answered with the wrong magic.
    MagicMismatch { attempt: u32, magic: u32 },
    /// Transfer started with the chosen chunk size.
    TransferStarted {
        direction: Direction,
        total: u64,
        chunk_size: usize,
    },
    /// Progress after each chunk.
    Progress {
        direction: Direction,
        current: u64,
        total: u64,
    },
    /// Bulk attempt failed and will be retried.
    Retry {
        direction: Direction,
        attempt: u32,
        bytes_transferred: u64,
        /// Set when the purge before this retry failed.
        purge_error: Option<String>,
    },
    TransferComplete { direction: Direction, bytes: u64 },
}

/// Observer trait for receiving drive events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DriveObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DriveEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DriveObserver for NullObserver {
    fn on_event(&self, _event: &DriveEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DriveObserver for TracingObserver {
    fn on_event(&self, event: &DriveEvent) {
        match event {
            DriveEvent::DeviceOpened { vid, pid, version } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), version = %version, "Device opened");
            }
            DriveEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Session state changed");
            }
            DriveEvent::CommandSent { command, params } => {
                tracing::trace!(command = %command, params = ?params, "Command sent");
            }
            DriveEvent::MagicMismatch { attempt, magic } => {
                tracing::warn!(attempt, magic = %format!("0x{:08X}", magic), "Incorrect magic");
            }
            DriveEvent::TransferStarted {
                direction,
                total,
                chunk_size,
            } => {
                tracing::info!(direction = %direction, kbytes = total / 1024, chunk_size, "Transfer started");
            }
            DriveEvent::Progress {
                direction,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(direction = %direction, progress = %format!("{}%", pct), "Progress");
            }
            DriveEvent::Retry {
                direction,
                attempt,
                bytes_transferred,
                purge_error,
            } => {
                tracing::warn!(direction = %direction, attempt, bytes_transferred, purge_error = ?purge_error, "Bulk transfer failed, retrying");
            }
            DriveEvent::TransferComplete { direction, bytes } => {
                tracing::info!(direction = %direction, bytes, "Transfer complete");
            }
        }
    }
}
