//! Drive session - device discovery, bridge setup and the version handshake.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::cic::Cic;
use crate::config::DriveConfig;
use crate::device::{DeviceId, HardwareVersion, KNOWN_DEVICES, Variant};
use crate::error::{DriveError, HandshakeError, Result};
use crate::events::{DriveEvent, DriveObserver, SessionState, TracingObserver};
use crate::protocol::constants::{
    BITMODE_ALL_PINS, HANDSHAKE_ATTEMPTS, LATENCY_TIMER_MAX, MAX_FRAME_SIZE, VERSION_RESPONSE_SIZE,
};
use crate::protocol::{Command, CommandFrame, VersionResponse};
use crate::transport::{BitMode, BulkTransport, NusbTransport, TransportError};

/// An open, verified connection to one device.
///
/// Only constructed after the bridge is configured and the firmware
/// answered get-version with the right magic, so every method may talk to
/// the device.
pub struct DriveSession<T: BulkTransport, O: DriveObserver = TracingObserver> {
    pub(crate) transport: T,
    pub(crate) observer: Arc<O>,
    pub(crate) config: DriveConfig,
    version: HardwareVersion,
    variant: Variant,
    state: SessionState,
}

impl DriveSession<NusbTransport> {
    /// Open the first attached device, logging events through tracing.
    pub fn open(config: DriveConfig) -> Result<Self> {
        Self::open_with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: DriveObserver> DriveSession<NusbTransport, O> {
    /// Open the first attached device with a custom observer.
    pub fn open_with_observer(config: DriveConfig, observer: Arc<O>) -> Result<Self> {
        let timeout = config.io_timeout();
        Self::connect(
            |id| NusbTransport::open_device(id, timeout),
            config,
            observer,
        )
    }
}

impl<T: BulkTransport, O: DriveObserver> DriveSession<T, O> {
    /// Probe each known identity in order; the first that opens wins.
    #[instrument(level = "info", skip_all)]
    pub fn connect<F>(mut probe: F, config: DriveConfig, observer: Arc<O>) -> Result<Self>
    where
        F: FnMut(&DeviceId) -> std::result::Result<T, TransportError>,
    {
        observer.on_event(&DriveEvent::StateChanged {
            from: SessionState::Closed,
            to: SessionState::Opening,
        });

        for id in KNOWN_DEVICES {
            match probe(id) {
                Ok(transport) => {
                    info!(version = %id.version, "Found 64drive");
                    return Self::establish(transport, id.version, config, observer);
                }
                Err(TransportError::DeviceNotFound { vid, pid }) => {
                    debug!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Not present");
                }
                Err(e) => {
                    warn!(error = %e, version = %id.version, "Failed to open candidate device");
                }
            }
        }

        observer.on_event(&DriveEvent::StateChanged {
            from: SessionState::Opening,
            to: SessionState::Closed,
        });
        Err(DriveError::DeviceNotFound)
    }

    /// Configure the bridge and run the handshake on an opened transport.
    pub fn establish(
        transport: T,
        version: HardwareVersion,
        config: DriveConfig,
        observer: Arc<O>,
    ) -> Result<Self> {
        let mut session = Self {
            transport,
            observer,
            config,
            version,
            variant: Variant::default(),
            state: SessionState::Opening,
        };
        session.emit(DriveEvent::DeviceOpened {
            vid: session.transport.vendor_id(),
            pid: session.transport.product_id(),
            version,
        });

        session.initialize()?;
        session.set_state(SessionState::Handshaking);
        session.get_version()?;
        session.set_state(SessionState::Ready);
        Ok(session)
    }

    fn initialize(&mut self) -> Result<()> {
        fn step(name: &'static str) -> impl FnOnce(TransportError) -> DriveError {
            move |source| DriveError::Initialization { step: name, source }
        }

        debug!("Resetting device");
        self.transport.reset().map_err(step("reset"))?;

        if self.version.uses_sync_fifo() {
            debug!("Setting synchronous mode");
            self.transport
                .set_bitmode(BITMODE_ALL_PINS, BitMode::Reset)
                .map_err(step("set_bitmode(reset)"))?;
            self.transport
                .set_bitmode(BITMODE_ALL_PINS, BitMode::SyncFifo)
                .map_err(step("set_bitmode(sync_fifo)"))?;
        }

        self.transport
            .set_latency_timer(LATENCY_TIMER_MAX)
            .map_err(step("set_latency_timer"))?;

        debug!("Purging buffers");
        self.transport
            .purge_buffers()
            .map_err(step("purge_buffers"))?;
        Ok(())
    }

    /// Query the firmware variant and verify the protocol magic.
    ///
    /// Returns the variant bytes packed into the top three bytes of a word.
    /// A wrong magic is retried; a transport failure is not.
    #[instrument(skip(self))]
    pub fn get_version(&mut self) -> Result<u32> {
        let frame = CommandFrame::new(Command::GetVersion, &[])?;
        let mut response = [0u8; VERSION_RESPONSE_SIZE];
        let mut last_magic = 0;

        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            let n = self
                .exchange(&frame, Some(&mut response[..]))
                .map_err(HandshakeError::Transport)?;

            match VersionResponse::parse(&response[..n]) {
                Ok(resp) if resp.is_valid() => {
                    self.variant = Variant(resp.variant);
                    info!(variant = %self.variant, version = %self.version, "Firmware verified");
                    return Ok(resp.identifier());
                }
                Ok(resp) => last_magic = resp.magic,
                Err(e) => {
                    debug!(error = %e, "Short version response");
                    last_magic = 0;
                }
            }
            self.emit(DriveEvent::MagicMismatch {
                attempt,
                magic: last_magic,
            });
        }

        Err(HandshakeError::MagicMismatch {
            attempts: HANDSHAKE_ATTEMPTS,
            last_magic,
        }
        .into())
    }

    /// Select the CIC the cartridge presents to the console.
    #[instrument(skip(self, cic), fields(cic = cic.number()))]
    pub fn set_cic(&mut self, cic: Cic) -> Result<()> {
        if !self.variant.supports_cic() {
            return Err(DriveError::Unsupported {
                operation: "CIC mode selection",
                variant: self.variant,
            });
        }
        info!(cic = %cic, "Selecting CIC mode");
        self.send_command(Command::SetCic, &[cic.command_param()], None)?;
        Ok(())
    }

    /// Send one command, optionally reading a response into `response`.
    ///
    /// Returns the response length, or the frame length when no response
    /// was requested. Nothing is retried here.
    pub fn send_command(
        &mut self,
        command: Command,
        params: &[u32],
        response: Option<&mut [u8]>,
    ) -> Result<usize> {
        let frame = CommandFrame::new(command, params)?;
        self.exchange(&frame, response)
            .map_err(|source| DriveError::Command { command, source })
    }

    pub(crate) fn exchange(
        &mut self,
        frame: &CommandFrame,
        response: Option<&mut [u8]>,
    ) -> std::result::Result<usize, TransportError> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = frame.encode_into(&mut buf);
        let command = frame.command();

        let written = self.transport.write(&buf[..len])?;
        if written < len {
            return Err(TransportError::WriteFailed(format!(
                "{}: {} of {} bytes accepted",
                command.name(),
                written,
                len
            )));
        }
        self.emit(DriveEvent::CommandSent {
            command,
            params: frame.params().to_vec(),
        });

        match response {
            Some(resp) if !resp.is_empty() => {
                let n = self.transport.read(resp)?;
                if n == 0 {
                    return Err(TransportError::ReadFailed(format!(
                        "{}: no response",
                        command.name()
                    )));
                }
                Ok(n)
            }
            _ => Ok(written),
        }
    }

    pub fn version(&self) -> HardwareVersion {
        self.version
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Shut down and hand back the transport.
    pub fn into_transport(mut self) -> T {
        self.set_state(SessionState::Closed);
        self.transport
    }

    /// Shut down, releasing the device.
    pub fn close(self) {
        drop(self.into_transport());
    }

    pub(crate) fn emit(&self, event: DriveEvent) {
        self.observer.on_event(&event);
    }

    fn set_state(&mut self, to: SessionState) {
        let from = self.state;
        self.state = to;
        self.emit(DriveEvent::StateChanged { from, to });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::events::NullObserver;
    use crate::transport::MockTransport;

    pub fn quiet_config() -> DriveConfig {
        DriveConfig {
            progress: false,
            retry_delay_ms: 0,
            ..Default::default()
        }
    }

    /// Ready HW2 session over `mock`, plus a handle for inspection.
    pub fn ready_session(mock: &MockTransport) -> DriveSession<MockTransport, NullObserver> {
        DriveSession::establish(
            mock.clone(),
            HardwareVersion::V2,
            quiet_config(),
            Arc::new(NullObserver),
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::events::NullObserver;
    use crate::protocol::constants::{DEV_MAGIC, FTDI_VENDOR_ID, HW1_PRODUCT_ID};
    use crate::transport::{MockStep, MockTransport};

    fn establish(
        mock: &MockTransport,
        version: HardwareVersion,
    ) -> Result<DriveSession<MockTransport, NullObserver>> {
        DriveSession::establish(mock.clone(), version, quiet_config(), Arc::new(NullObserver))
    }

    #[test]
    fn test_handshake_succeeds_after_three_mismatches() {
        let mock = MockTransport::new();
        for _ in 0..3 {
            mock.queue_bad_magic(0x1234_5678);
        }

        let session = establish(&mock, HardwareVersion::V2).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.variant(), Variant(*b"B2A"));
        assert_eq!(mock.command_count(Command::GetVersion), 4);
    }

    #[test]
    fn test_handshake_gives_up_after_four_attempts() {
        let mock = MockTransport::new();
        for _ in 0..10 {
            mock.queue_bad_magic(!DEV_MAGIC);
        }

        let err = establish(&mock, HardwareVersion::V2).err().unwrap();
        match err {
            DriveError::Handshake(HandshakeError::MagicMismatch {
                attempts,
                last_magic,
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_magic, !DEV_MAGIC);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mock.command_count(Command::GetVersion), 4);
    }

    #[test]
    fn test_handshake_transport_failure_is_not_retried() {
        let mock = MockTransport::new();
        mock.fail_reads(0, 1);

        let err = establish(&mock, HardwareVersion::V2).err().unwrap();
        assert!(matches!(
            err,
            DriveError::Handshake(HandshakeError::Transport(_))
        ));
        assert_eq!(mock.command_count(Command::GetVersion), 1);
    }

    #[test]
    fn test_short_version_response_counts_as_mismatch() {
        let mock = MockTransport::new();
        mock.queue_version_response(b"B2A");

        let session = establish(&mock, HardwareVersion::V2).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(mock.command_count(Command::GetVersion), 2);
    }

    #[test]
    fn test_get_version_identifier() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        assert_eq!(session.get_version().unwrap(), 0x4232_4100);
    }

    #[test]
    fn test_hw2_initialization_sequence() {
        let mock = MockTransport::new();
        let _session = ready_session(&mock);

        assert_eq!(mock.resets(), 1);
        assert_eq!(
            mock.bitmodes(),
            vec![(0xFF, BitMode::Reset), (0xFF, BitMode::SyncFifo)]
        );
        assert_eq!(mock.latency(), Some(255));
        assert_eq!(mock.purges(), 1);
    }

    #[test]
    fn test_hw1_skips_sync_fifo() {
        let mock = MockTransport::new();
        let session = establish(&mock, HardwareVersion::V1).unwrap();
        assert_eq!(session.version(), HardwareVersion::V1);
        assert!(mock.bitmodes().is_empty());
        assert_eq!(mock.latency(), Some(255));
    }

    #[test]
    fn test_initialization_failure_is_fatal() {
        let mock = MockTransport::new();
        mock.fail_step(MockStep::Bitmode(BitMode::SyncFifo));

        let err = establish(&mock, HardwareVersion::V2).err().unwrap();
        assert!(matches!(
            err,
            DriveError::Initialization {
                step: "set_bitmode(sync_fifo)",
                ..
            }
        ));
        assert_eq!(mock.latency(), None);
        assert_eq!(mock.command_count(Command::GetVersion), 0);
    }

    #[test]
    fn test_connect_uses_first_identity_that_opens() {
        let mock = MockTransport::new();
        let mut probed = Vec::new();

        let session = DriveSession::connect(
            |id| {
                probed.push(id.product_id);
                if id.version == HardwareVersion::V2 {
                    Err(TransportError::DeviceNotFound {
                        vid: id.vendor_id,
                        pid: id.product_id,
                    })
                } else {
                    let mut t = mock.clone();
                    t.set_ids(id.vendor_id, id.product_id);
                    Ok(t)
                }
            },
            quiet_config(),
            Arc::new(NullObserver),
        )
        .unwrap();

        assert_eq!(probed, vec![0x6014, HW1_PRODUCT_ID]);
        assert_eq!(session.version(), HardwareVersion::V1);
        assert_eq!(session.transport().vendor_id(), FTDI_VENDOR_ID);
        assert_eq!(session.transport().product_id(), HW1_PRODUCT_ID);
    }

    #[test]
    fn test_connect_without_device() {
        let result = DriveSession::<MockTransport, NullObserver>::connect(
            |id| {
                Err(TransportError::DeviceNotFound {
                    vid: id.vendor_id,
                    pid: id.product_id,
                })
            },
            quiet_config(),
            Arc::new(NullObserver),
        );
        assert!(matches!(result, Err(DriveError::DeviceNotFound)));
    }

    #[test]
    fn test_set_cic_sends_flagged_code() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);

        session.set_cic(Cic::Cic6102).unwrap();
        let (cmd, params) = mock.commands().pop().unwrap();
        assert_eq!(cmd, Command::SetCic);
        assert_eq!(params, vec![0x8000_0001]);
    }

    #[test]
    fn test_set_cic_rejected_on_variant_a() {
        let mock = MockTransport::new();
        mock.set_variant(*b"A00");
        let mut session = ready_session(&mock);
        let writes_before = mock.write_calls();

        let err = session.set_cic(Cic::Cic7101).unwrap_err();
        assert!(matches!(err, DriveError::Unsupported { .. }));
        assert_eq!(mock.write_calls(), writes_before);
        assert_eq!(mock.command_count(Command::SetCic), 0);
    }

    #[test]
    fn test_parameter_overflow_performs_no_io() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        let writes_before = mock.write_calls();

        let err = session
            .send_command(Command::PiWriteBlock, &[0; 8], None)
            .unwrap_err();
        assert!(matches!(err, DriveError::ParameterOverflow { count: 8 }));
        assert_eq!(mock.write_calls(), writes_before);
    }

    #[test]
    fn test_send_command_reports_transport_error() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        mock.disconnect();

        let err = session
            .send_command(Command::SetCic, &[0x8000_0000], None)
            .unwrap_err();
        assert!(matches!(
            err,
            DriveError::Command {
                command: Command::SetCic,
                source: TransportError::Disconnected
            }
        ));
    }

    #[test]
    fn test_into_transport_closes_session() {
        let mock = MockTransport::new();
        let session = ready_session(&mock);
        let transport = session.into_transport();
        assert_eq!(transport.resets(), 1);
    }
}
