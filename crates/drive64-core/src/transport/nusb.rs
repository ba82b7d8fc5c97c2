//! nusb-based transport for the FTDI bridge in front of the 64drive.

use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, ControlOut, ControlType, In, Out, Recipient};
use nusb::{Endpoint, Interface, MaybeFuture};
use tracing::{debug, info, instrument, trace};

use super::traits::{BitMode, BulkTransport, TransportError};
use crate::device::DeviceId;
use crate::protocol::constants::FTDI_VENDOR_ID;

// FTDI vendor requests
const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

/// Channel A; FTDI request indices are 1-based.
const CHANNEL_A_INDEX: u16 = 1;
const WRITE_EP: u8 = 0x02;
const READ_EP: u8 = 0x81;

/// Modem status bytes prepended to every IN packet.
const STATUS_BYTES: usize = 2;
const MAX_EMPTY_READS: usize = 128;
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Wait for the transfer just submitted on `$ep`; cancel it on timeout and
/// collect the cancelled completion so the endpoint is idle again.
macro_rules! wait_or_cancel {
    ($ep:expr, $timeout:expr) => {{
        match $ep.wait_next_complete($timeout) {
            Some(completion) => Ok(completion),
            None => {
                $ep.cancel_all();
                $ep.wait_next_complete($timeout).ok_or(TransportError::Timeout {
                    timeout_ms: $timeout.as_millis() as u64,
                })
            }
        }
    }};
}

/// Whether `read` stops after a transfer that carried `payload` bytes.
///
/// A status-only transfer ends the read once data has arrived, like
/// libftdi's `ftdi_read_data`. Before any data, status-only transfers are
/// tolerated up to `MAX_EMPTY_READS`.
fn read_finished(total: usize, payload: usize, empty_reads: usize) -> bool {
    if payload > 0 {
        false
    } else if total > 0 {
        true
    } else {
        empty_reads >= MAX_EMPTY_READS
    }
}

/// An attached FTDI device as seen by enumeration.
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

/// List attached devices with the FTDI vendor ID.
pub fn list_devices() -> Result<Vec<DeviceSummary>, TransportError> {
    let devices = nusb::list_devices()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?
        .filter(|d| d.vendor_id() == FTDI_VENDOR_ID)
        .map(|d| DeviceSummary {
            vendor_id: d.vendor_id(),
            product_id: d.product_id(),
            manufacturer: d.manufacturer_string().map(str::to_owned),
            product: d.product_string().map(str::to_owned),
            serial: d.serial_number().map(str::to_owned),
        })
        .collect();
    Ok(devices)
}

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Interface,
    out_ep: Endpoint<Bulk, Out>,
    in_ep: Endpoint<Bulk, In>,
    write_chunk: usize,
    read_chunk: usize,
    timeout: Duration,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the device matching `id`.
    ///
    /// When the device reports a product string it must equal the
    /// identity's description, so other FTDI parts sharing the IDs are skipped.
    #[instrument(level = "info", skip(id), fields(vid = %format!("{:04X}", id.vendor_id), pid = %format!("{:04X}", id.product_id)))]
    pub fn open_device(id: &DeviceId, timeout: Duration) -> Result<Self, TransportError> {
        let device_info = nusb::list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| {
                d.vendor_id() == id.vendor_id
                    && d.product_id() == id.product_id
                    && d.product_string().is_none_or(|p| p == id.description)
            })
            .ok_or(TransportError::DeviceNotFound {
                vid: id.vendor_id,
                pid: id.product_id,
            })?;

        info!(
            product = device_info.product_string().unwrap_or("?"),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        let out_ep = interface.endpoint::<Bulk, Out>(WRITE_EP).map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: format!("bulk OUT 0x{:02X}: {}", WRITE_EP, e),
            }
        })?;
        let in_ep = interface.endpoint::<Bulk, In>(READ_EP).map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: format!("bulk IN 0x{:02X}: {}", READ_EP, e),
            }
        })?;

        debug!(max_packet = in_ep.max_packet_size(), "Endpoints ready");

        Ok(Self {
            interface,
            out_ep,
            in_ep,
            write_chunk: DEFAULT_CHUNK_SIZE,
            read_chunk: DEFAULT_CHUNK_SIZE,
            timeout,
            vid: id.vendor_id,
            pid: id.product_id,
        })
    }

    fn control_out(&self, name: &'static str, request: u8, value: u16) -> Result<(), TransportError> {
        trace!(request = name, value, "Control OUT");
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: CHANNEL_A_INDEX,
                    data: &[],
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request: name,
                message: e.to_string(),
            })
    }

    /// One IN transfer into `out`, status bytes stripped.
    fn read_packets(&mut self, out: &mut [u8]) -> Result<usize, TransportError> {
        let max_packet = self.in_ep.max_packet_size();
        if max_packet <= STATUS_BYTES {
            return Err(TransportError::ReadFailed(format!(
                "max packet size {} too small",
                max_packet
            )));
        }
        let payload_per_packet = max_packet - STATUS_BYTES;
        let packets = out.len().div_ceil(payload_per_packet).max(1);
        let request_len = (packets * max_packet).min(self.read_chunk.max(max_packet));
        let request_len = request_len.div_ceil(max_packet) * max_packet;

        let mut buf = Buffer::new(request_len);
        buf.set_requested_len(request_len);
        self.in_ep.submit(buf);
        let completion = wait_or_cancel!(self.in_ep, self.timeout)?;
        completion
            .status
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let received = &completion.buffer[..completion.actual_len];
        let mut taken = 0;
        for packet in received.chunks(max_packet) {
            if taken == out.len() {
                break;
            }
            if packet.len() <= STATUS_BYTES {
                continue;
            }
            let payload = &packet[STATUS_BYTES..];
            let n = payload.len().min(out.len() - taken);
            out[taken..taken + n].copy_from_slice(&payload[..n]);
            taken += n;
        }
        Ok(taken)
    }
}

impl BulkTransport for NusbTransport {
    fn reset(&mut self) -> Result<(), TransportError> {
        self.control_out("reset", SIO_RESET_REQUEST, SIO_RESET_SIO)
    }

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<(), TransportError> {
        let value = ((mode as u16) << 8) | mask as u16;
        self.control_out("set_bitmode", SIO_SET_BITMODE_REQUEST, value)
    }

    fn set_latency_timer(&mut self, ms: u8) -> Result<(), TransportError> {
        self.control_out("set_latency_timer", SIO_SET_LATENCY_TIMER_REQUEST, ms as u16)
    }

    fn purge_buffers(&mut self) -> Result<(), TransportError> {
        self.control_out("purge_rx", SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)?;
        self.control_out("purge_tx", SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)
    }

    fn set_write_chunk_size(&mut self, size: usize) -> Result<(), TransportError> {
        self.write_chunk = size.max(1);
        Ok(())
    }

    fn set_read_chunk_size(&mut self, size: usize) -> Result<(), TransportError> {
        self.read_chunk = size.max(1);
        Ok(())
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut written = 0;
        for chunk in data.chunks(self.write_chunk) {
            let mut buf = Buffer::new(chunk.len());
            buf.extend_from_slice(chunk);
            self.out_ep.submit(buf);
            let completion = match wait_or_cancel!(self.out_ep, self.timeout) {
                Ok(completion) => completion,
                Err(e) if written > 0 => {
                    debug!(written, error = %e, "Write stopped early");
                    return Ok(written);
                }
                Err(e) => return Err(e),
            };
            written += completion.actual_len;

            if let Err(e) = completion.status {
                if written > 0 {
                    debug!(written, error = %e, "Write stopped early");
                    return Ok(written);
                }
                return Err(TransportError::WriteFailed(e.to_string()));
            }
        }
        trace!(written, "Write complete");
        Ok(written)
    }

    #[instrument(level = "trace", skip(self, buf), fields(len = buf.len()))]
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut total = 0;
        let mut empty_reads = 0;

        while total < buf.len() {
            match self.read_packets(&mut buf[total..]) {
                Ok(n) => {
                    total += n;
                    empty_reads = if n == 0 { empty_reads + 1 } else { 0 };
                    if read_finished(total, n, empty_reads) {
                        break;
                    }
                }
                Err(e) if total > 0 => {
                    debug!(total, error = %e, "Read stopped early");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        trace!(total, "Read complete");
        Ok(total)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_stops_on_first_empty_transfer_after_data() {
        // 12-byte version reply into a 64-byte buffer
        assert!(!read_finished(12, 12, 0));
        assert!(read_finished(12, 0, 1));
    }

    #[test]
    fn test_read_waits_for_first_data() {
        assert!(!read_finished(0, 0, 1));
        assert!(!read_finished(0, 0, MAX_EMPTY_READS - 1));
        assert!(read_finished(0, 0, MAX_EMPTY_READS));
    }

    #[test]
    fn test_read_continues_while_payload_arrives() {
        assert!(!read_finished(4096, 510, 0));
    }
}
