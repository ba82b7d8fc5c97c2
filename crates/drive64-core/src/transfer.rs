//! Chunked bulk transfers between host streams and device banks.
//!
//! Each chunk is announced with a load/dump command, then moved as one
//! bulk payload. Payload I/O is retried with a purge in between; command
//! frames are not.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::bank::Bank;
use crate::error::{DriveError, Result};
use crate::events::{Direction, DriveEvent, DriveObserver};
use crate::protocol::constants::{
    BULK_ATTEMPTS, CHUNK_QUANTUM, LARGE_CHUNK_UNITS, LARGE_TRANSFER_THRESHOLD, MAX_REGION_SIZE,
    MEDIUM_CHUNK_UNITS, MEDIUM_TRANSFER_THRESHOLD, SMALL_CHUNK_UNITS,
};
use crate::protocol::{Command, CommandFrame};
use crate::session::DriveSession;
use crate::transport::{BulkTransport, TransportError};

/// Where a transfer lands on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub bank: Bank,
    pub offset: u32,
}

impl Region {
    pub fn new(bank: Bank, offset: u32) -> Self {
        Self { bank, offset }
    }

    /// Bytes a download reads when no length is given.
    pub fn default_length(&self) -> u64 {
        self.bank
            .capacity()
            .map(|cap| cap.saturating_sub(self.offset as u64))
            .unwrap_or(MAX_REGION_SIZE)
    }
}

/// Chunk size chosen for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total: u64,
    pub chunk_size: usize,
}

impl ChunkPlan {
    /// Large transfers use bigger chunks; never more than the transfer itself.
    pub fn for_length(total: u64) -> Self {
        let units = if total > LARGE_TRANSFER_THRESHOLD {
            LARGE_CHUNK_UNITS
        } else if total > MEDIUM_TRANSFER_THRESHOLD {
            MEDIUM_CHUNK_UNITS
        } else {
            SMALL_CHUNK_UNITS
        };
        let chunk_size = (units * CHUNK_QUANTUM).min(total) as usize;
        Self { total, chunk_size }
    }

    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            0
        } else {
            self.total.div_ceil(self.chunk_size as u64)
        }
    }

    /// Length of the chunk starting after `done` bytes.
    pub fn next_len(&self, done: u64) -> usize {
        self.total.saturating_sub(done).min(self.chunk_size as u64) as usize
    }
}

/// Bounded retry for bulk payload I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self {
            max_attempts: BULK_ATTEMPTS,
            delay,
        }
    }

    /// Whether another attempt may follow `failed` failed ones.
    pub fn should_continue(&self, failed: u32) -> bool {
        failed < self.max_attempts
    }
}

/// Summary of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub direction: Direction,
    pub bytes: u64,
    pub chunk_size: usize,
    pub chunks: u64,
    pub retries: u32,
}

impl TransferReport {
    fn empty(direction: Direction) -> Self {
        Self {
            direction,
            bytes: 0,
            chunk_size: 0,
            chunks: 0,
            retries: 0,
        }
    }
}

/// Run `op` until it moves at least one byte or the policy gives up.
///
/// Returns the byte count and how many retries it took.
fn bulk_with_retry<T, O, F>(
    transport: &mut T,
    observer: &O,
    policy: &RetryPolicy,
    direction: Direction,
    moved: u64,
    mut op: F,
) -> std::result::Result<(usize, u32), TransportError>
where
    T: BulkTransport,
    O: DriveObserver + ?Sized,
    F: FnMut(&mut T) -> std::result::Result<usize, TransportError>,
{
    let mut failed = 0;
    loop {
        let error = match op(transport) {
            Ok(n) if n > 0 => return Ok((n, failed)),
            Ok(_) => match direction {
                Direction::Upload => TransportError::WriteFailed("no bytes accepted".into()),
                Direction::Download => TransportError::ReadFailed("no bytes received".into()),
            },
            Err(e) => e,
        };
        failed += 1;

        if !policy.should_continue(failed) {
            warn!(direction = %direction, attempts = failed, error = %error, "Giving up");
            return Err(error);
        }

        debug!(error = %error, attempt = failed, "Bulk attempt failed");
        thread::sleep(policy.delay);
        let purge_error = match transport.purge_buffers() {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "Purge before retry failed");
                Some(e.to_string())
            }
        };
        observer.on_event(&DriveEvent::Retry {
            direction,
            attempt: failed,
            bytes_transferred: moved,
            purge_error,
        });
    }
}

/// Bytes left between the current position and the end of `stream`.
///
/// The position is restored afterwards.
pub fn stream_remaining<S: Seek>(stream: &mut S) -> io::Result<u64> {
    let pos = stream.stream_position()?;
    let end = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(pos))?;
    Ok(end.saturating_sub(pos))
}

impl<T: BulkTransport, O: DriveObserver> DriveSession<T, O> {
    /// Copy `length` bytes from `source` into `region`.
    #[instrument(skip(self, source), fields(bank = %region.bank, offset = region.offset))]
    pub fn upload<R: Read>(
        &mut self,
        region: Region,
        length: u64,
        source: &mut R,
    ) -> Result<TransferReport> {
        let direction = Direction::Upload;
        if length == 0 {
            return Ok(TransferReport::empty(direction));
        }

        let plan = ChunkPlan::for_length(length);
        self.transport
            .set_write_chunk_size(plan.chunk_size)
            .map_err(|source| DriveError::TransferIo {
                direction,
                bytes_transferred: 0,
                source,
            })?;
        let policy = RetryPolicy::new(self.config.retry_delay());
        self.begin(direction, &plan);

        let mut buffer = vec![0u8; plan.chunk_size];
        let mut done = 0u64;
        let mut pending = 0usize;
        let mut retries = 0;

        while done < length {
            if pending == 0 {
                pending = plan.next_len(done);
                source
                    .read_exact(&mut buffer[..pending])
                    .map_err(|source| DriveError::Stream {
                        direction,
                        bytes_transferred: done,
                        source,
                    })?;
            }

            // Offsets wrap at 32 bits like the device's address register.
            let frame = CommandFrame::new(
                Command::LoadRam,
                &[
                    region.offset.wrapping_add(done as u32),
                    region.bank.packed_length(pending),
                ],
            )?;
            self.exchange(&frame, None)
                .map_err(|source| DriveError::TransferIo {
                    direction,
                    bytes_transferred: done,
                    source,
                })?;

            let chunk = &buffer[..pending];
            let (sent, tries) = bulk_with_retry(
                &mut self.transport,
                self.observer.as_ref(),
                &policy,
                direction,
                done,
                |t| t.write(chunk),
            )
            .map_err(|source| DriveError::TransferIo {
                direction,
                bytes_transferred: done,
                source,
            })?;
            retries += tries;

            let sent = sent.min(pending);
            if sent < pending {
                debug!(sent, pending, "Partial write, resending tail");
                buffer.copy_within(sent..pending, 0);
            }
            pending -= sent;
            done += sent as u64;
            self.progress(direction, done, length);
        }

        Ok(self.finish(direction, &plan, retries))
    }

    /// Copy `region` into `sink`. Without a length the rest of the bank is read.
    #[instrument(skip(self, sink), fields(bank = %region.bank, offset = region.offset))]
    pub fn download<W: Write>(
        &mut self,
        region: Region,
        length: Option<u64>,
        sink: &mut W,
    ) -> Result<TransferReport> {
        let direction = Direction::Download;
        let length = length.unwrap_or_else(|| region.default_length());
        if length == 0 {
            return Ok(TransferReport::empty(direction));
        }

        let plan = ChunkPlan::for_length(length);
        self.transport
            .set_read_chunk_size(plan.chunk_size)
            .map_err(|source| DriveError::TransferIo {
                direction,
                bytes_transferred: 0,
                source,
            })?;
        let policy = RetryPolicy::new(self.config.retry_delay());
        self.begin(direction, &plan);

        let mut buffer = vec![0u8; plan.chunk_size];
        let mut done = 0u64;
        let mut retries = 0;

        while done < length {
            let want = plan.next_len(done);
            let frame = CommandFrame::new(
                Command::DumpRam,
                &[
                    region.offset.wrapping_add(done as u32),
                    region.bank.packed_length(want),
                ],
            )?;
            self.exchange(&frame, None)
                .map_err(|source| DriveError::TransferIo {
                    direction,
                    bytes_transferred: done,
                    source,
                })?;

            let (got, tries) = bulk_with_retry(
                &mut self.transport,
                self.observer.as_ref(),
                &policy,
                direction,
                done,
                |t| t.read(&mut buffer[..want]),
            )
            .map_err(|source| DriveError::TransferIo {
                direction,
                bytes_transferred: done,
                source,
            })?;
            retries += tries;

            let got = got.min(want);
            sink.write_all(&buffer[..got])
                .map_err(|source| DriveError::Stream {
                    direction,
                    bytes_transferred: done,
                    source,
                })?;
            done += got as u64;
            self.progress(direction, done, length);
        }

        sink.flush().map_err(|source| DriveError::Stream {
            direction,
            bytes_transferred: done,
            source,
        })?;
        Ok(self.finish(direction, &plan, retries))
    }

    fn begin(&self, direction: Direction, plan: &ChunkPlan) {
        self.emit(DriveEvent::TransferStarted {
            direction,
            total: plan.total,
            chunk_size: plan.chunk_size,
        });
    }

    fn progress(&self, direction: Direction, current: u64, total: u64) {
        if self.config.progress {
            self.emit(DriveEvent::Progress {
                direction,
                current,
                total,
            });
        }
    }

    fn finish(&self, direction: Direction, plan: &ChunkPlan, retries: u32) -> TransferReport {
        self.emit(DriveEvent::TransferComplete {
            direction,
            bytes: plan.total,
        });
        TransferReport {
            direction,
            bytes: plan.total,
            chunk_size: plan.chunk_size,
            chunks: plan.chunk_count(),
            retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::DriveConfig;
    use crate::device::HardwareVersion;
    use crate::protocol::constants::ONE_MB;
    use crate::session::test_support::{quiet_config, ready_session};
    use crate::transport::{MockStep, MockTransport};

    const KB: u64 = 1024;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DriveEvent>>);

    impl DriveObserver for Recorder {
        fn on_event(&self, event: &DriveEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn progress(&self) -> Vec<u64> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    DriveEvent::Progress { current, .. } => Some(*current),
                    _ => None,
                })
                .collect()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    fn load_params(mock: &MockTransport) -> Vec<Vec<u32>> {
        mock.commands()
            .into_iter()
            .filter(|(c, _)| *c == Command::LoadRam)
            .map(|(_, p)| p)
            .collect()
    }

    #[test]
    fn test_chunk_sizes() {
        assert_eq!(ChunkPlan::for_length(20 * ONE_MB).chunk_size, 4 * ONE_MB as usize);
        assert_eq!(ChunkPlan::for_length(16 * ONE_MB).chunk_size, 2 * ONE_MB as usize);
        assert_eq!(ChunkPlan::for_length(5 * ONE_MB).chunk_size, 2 * ONE_MB as usize);
        assert_eq!(ChunkPlan::for_length(2 * ONE_MB).chunk_size, 512 * KB as usize);
        assert_eq!(ChunkPlan::for_length(ONE_MB).chunk_size, 512 * KB as usize);
        assert_eq!(ChunkPlan::for_length(100 * KB).chunk_size, 100 * KB as usize);
        assert_eq!(ChunkPlan::for_length(0).chunk_count(), 0);
        assert_eq!(ChunkPlan::for_length(ONE_MB + 1).chunk_count(), 3);
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::new(Duration::ZERO);
        assert!(policy.should_continue(4));
        assert!(!policy.should_continue(5));
    }

    #[test]
    fn test_default_download_length() {
        assert_eq!(Region::new(Bank::Eeprom16, 0).default_length(), 2048);
        assert_eq!(Region::new(Bank::Sram256, 0x100).default_length(), 32 * KB - 0x100);
        assert_eq!(Region::new(Bank::Invalid, 0).default_length(), 256 * ONE_MB);
    }

    #[test]
    fn test_upload_then_download_round_trip() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        let len = 3 * 512 * KB as usize + 17;
        let data = pattern(len);

        let report = session
            .upload(Region::new(Bank::CartRom, 0), len as u64, &mut Cursor::new(&data))
            .unwrap();
        assert_eq!(report.bytes, len as u64);
        assert_eq!(report.chunk_size, 512 * KB as usize);
        assert_eq!(report.chunks, 4);
        assert_eq!(mock.write_chunk_size(), Some(512 * KB as usize));

        let params = load_params(&mock);
        assert_eq!(params.len(), 4);
        assert_eq!(params[3], vec![3 * 512 * 1024, Bank::CartRom.packed_length(17)]);

        let mut out = Vec::new();
        session
            .download(Region::new(Bank::CartRom, 0), Some(len as u64), &mut out)
            .unwrap();
        assert_eq!(out, data);
        assert_eq!(mock.command_count(Command::DumpRam), 4);
    }

    #[test]
    fn test_upload_retries_then_succeeds() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        let purges = mock.purges();
        mock.fail_writes(0, 4);

        let data = pattern(4096);
        let report = session
            .upload(Region::new(Bank::Sram768, 0), 4096, &mut Cursor::new(&data))
            .unwrap();
        assert_eq!(report.retries, 4);
        assert_eq!(mock.purges(), purges + 4);
        assert_eq!(mock.memory(Bank::Sram768, 0, 4096), data);
        // Retries resend the payload, not the command
        assert_eq!(mock.command_count(Command::LoadRam), 1);
    }

    #[test]
    fn test_upload_gives_up_after_five_attempts() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        let len = 3 * 512 * KB as usize;
        mock.fail_writes(2, 5);

        let err = session
            .upload(Region::new(Bank::CartRom, 0), len as u64, &mut Cursor::new(pattern(len)))
            .unwrap_err();
        match err {
            DriveError::TransferIo {
                direction,
                bytes_transferred,
                ..
            } => {
                assert_eq!(direction, Direction::Upload);
                assert_eq!(bytes_transferred, 2 * 512 * KB);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mock.command_count(Command::LoadRam), 3);
    }

    #[test]
    fn test_download_gives_up_after_five_attempts() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        let len = 3 * 512 * KB as usize;
        let data = pattern(len);
        mock.load_memory(Bank::CartRom, 0, &data);
        mock.fail_reads(2, 5);

        let mut out = Vec::new();
        let err = session
            .download(Region::new(Bank::CartRom, 0), Some(len as u64), &mut out)
            .unwrap_err();
        match err {
            DriveError::TransferIo {
                direction,
                bytes_transferred,
                ..
            } => {
                assert_eq!(direction, Direction::Download);
                assert_eq!(bytes_transferred, 2 * 512 * KB);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Only the chunks read before the failure reach the sink
        assert_eq!(out, data[..2 * 512 * KB as usize]);
        assert_eq!(mock.command_count(Command::DumpRam), 3);
    }

    #[test]
    fn test_retry_reports_purge_failure() {
        let mock = MockTransport::new();
        let recorder = Arc::new(Recorder::default());
        let mut session = DriveSession::establish(
            mock.clone(),
            HardwareVersion::V2,
            quiet_config(),
            recorder.clone(),
        )
        .unwrap();
        mock.fail_step(MockStep::Purge);
        mock.fail_writes(0, 2);

        let data = pattern(1024);
        session
            .upload(Region::new(Bank::Sram256, 0), 1024, &mut Cursor::new(&data))
            .unwrap();
        assert_eq!(mock.memory(Bank::Sram256, 0, 1024), data);

        let events = recorder.0.lock().unwrap();
        let retries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DriveEvent::Retry {
                    attempt,
                    purge_error,
                    ..
                } => Some((*attempt, purge_error.is_some())),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![(1, true), (2, true)]);
    }

    #[test]
    fn test_partial_write_resends_tail() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        mock.limit_write_size(1000);

        let data = pattern(2500);
        session
            .upload(Region::new(Bank::CartRom, 0x10), 2500, &mut Cursor::new(&data))
            .unwrap();

        let params = load_params(&mock);
        let offsets: Vec<u32> = params.iter().map(|p| p[0]).collect();
        assert_eq!(offsets, vec![0x10, 0x10 + 1000, 0x10 + 2000]);
        assert_eq!(params[2][1], Bank::CartRom.packed_length(500));
        assert_eq!(mock.memory(Bank::CartRom, 0x10, 2500), data);
    }

    #[test]
    fn test_short_source_is_stream_error() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);

        let err = session
            .upload(Region::new(Bank::CartRom, 0), 100, &mut Cursor::new(vec![0u8; 40]))
            .unwrap_err();
        assert!(matches!(
            err,
            DriveError::Stream {
                direction: Direction::Upload,
                bytes_transferred: 0,
                ..
            }
        ));
        assert_eq!(mock.command_count(Command::LoadRam), 0);
    }

    #[test]
    fn test_download_retries_failed_read() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        let data = pattern(2048);
        mock.load_memory(Bank::Eeprom16, 0, &data);
        let purges = mock.purges();
        mock.fail_reads(0, 2);

        let mut out = Vec::new();
        let report = session
            .download(Region::new(Bank::Eeprom16, 0), None, &mut out)
            .unwrap();
        assert_eq!(out, data);
        assert_eq!(report.retries, 2);
        assert_eq!(mock.purges(), purges + 2);
        assert_eq!(mock.read_chunk_size(), Some(2048));
        assert_eq!(mock.commands().last().unwrap().1, vec![0, Bank::Eeprom16.packed_length(2048)]);
    }

    #[test]
    fn test_download_short_reads_are_accumulated() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        let data = pattern(3000);
        mock.load_memory(Bank::FlashRam1M, 0, &data);
        mock.limit_read_size(1024);

        let mut out = Vec::new();
        session
            .download(Region::new(Bank::FlashRam1M, 0), Some(3000), &mut out)
            .unwrap();
        assert_eq!(out, data);
        let offsets: Vec<u32> = mock
            .commands()
            .into_iter()
            .filter(|(c, _)| *c == Command::DumpRam)
            .map(|(_, p)| p[0])
            .collect();
        assert_eq!(offsets, vec![0, 1024, 2048]);
    }

    #[test]
    fn test_zero_length_touches_nothing() {
        let mock = MockTransport::new();
        let mut session = ready_session(&mock);
        let writes = mock.write_calls();

        let report = session
            .upload(Region::default(), 0, &mut io::empty())
            .unwrap();
        assert_eq!(report.bytes, 0);
        let report = session
            .download(Region::new(Bank::Eeprom16, 2048), None, &mut io::sink())
            .unwrap();
        assert_eq!(report.bytes, 0);
        assert_eq!(mock.write_calls(), writes);
    }

    #[test]
    fn test_progress_events() {
        let mock = MockTransport::new();
        let recorder = Arc::new(Recorder::default());
        let config = DriveConfig {
            progress: true,
            ..quiet_config()
        };
        let mut session = DriveSession::establish(
            mock.clone(),
            HardwareVersion::V2,
            config,
            recorder.clone(),
        )
        .unwrap();

        let len = ONE_MB + 100;
        session
            .upload(Region::default(), len, &mut Cursor::new(pattern(len as usize)))
            .unwrap();
        assert_eq!(recorder.progress(), vec![512 * KB, ONE_MB, len]);

        let events = recorder.0.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            DriveEvent::TransferStarted {
                direction: Direction::Upload,
                chunk_size,
                ..
            } if *chunk_size == 512 * KB as usize
        )));
        assert!(matches!(
            events.last(),
            Some(DriveEvent::TransferComplete { bytes, .. }) if *bytes == len
        ));
    }

    #[test]
    fn test_progress_disabled() {
        let mock = MockTransport::new();
        let recorder = Arc::new(Recorder::default());
        let mut session = DriveSession::establish(
            mock.clone(),
            HardwareVersion::V2,
            quiet_config(),
            recorder.clone(),
        )
        .unwrap();

        session
            .upload(Region::default(), 4096, &mut Cursor::new(pattern(4096)))
            .unwrap();
        assert!(recorder.progress().is_empty());
    }

    #[test]
    fn test_stream_remaining() {
        let mut cursor = Cursor::new(vec![0u8; 100]);
        cursor.set_position(30);
        assert_eq!(stream_remaining(&mut cursor).unwrap(), 70);
        assert_eq!(cursor.position(), 30);
    }
}
