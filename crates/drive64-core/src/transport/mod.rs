//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockStep, MockTransport};
pub use nusb::{DeviceSummary, NusbTransport, list_devices};
pub use traits::{BitMode, BulkTransport, TransportError};
