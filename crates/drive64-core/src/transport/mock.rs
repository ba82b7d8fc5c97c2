//! Mock transport for testing.
//!
//! Behaves like a 64drive behind its bridge: decodes command frames, keeps
//! per-bank memory, answers get-version, and streams load/dump payloads.
//! Faults can be injected on bulk payloads and on individual setup steps.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::traits::{BitMode, BulkTransport, TransportError};
use crate::bank::Bank;
use crate::protocol::constants::{BANK_SHIFT, DEV_MAGIC, HW2_PRODUCT_ID, FTDI_VENDOR_ID, LENGTH_MASK};
use crate::protocol::{Command, CommandFrame, VersionResponse};

/// Setup step that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockStep {
    Reset,
    Bitmode(BitMode),
    Latency,
    Purge,
    ChunkSize,
}

#[derive(Debug, Clone)]
enum Pending {
    Load { bank: u8, offset: usize, len: usize },
    Dump { bank: u8, offset: usize, len: usize },
    Response(Vec<u8>),
}

/// Fault window: let `skip` operations through, then fail `count`.
#[derive(Debug, Default, Clone, Copy)]
struct Fault {
    skip: usize,
    count: usize,
}

impl Fault {
    fn trips(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            false
        } else if self.count > 0 {
            self.count -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct MockState {
    memory: HashMap<u8, Vec<u8>>,
    pending: Option<Pending>,
    version_responses: VecDeque<Vec<u8>>,
    variant: [u8; 3],
    commands: Vec<(Command, Vec<u32>)>,
    write_calls: usize,
    read_calls: usize,
    purges: usize,
    resets: usize,
    bitmodes: Vec<(u8, BitMode)>,
    latency: Option<u8>,
    write_chunk_size: Option<usize>,
    read_chunk_size: Option<usize>,
    write_fault: Fault,
    read_fault: Fault,
    max_write: Option<usize>,
    max_read: Option<usize>,
    failing_step: Option<MockStep>,
    connected: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            memory: HashMap::new(),
            pending: None,
            version_responses: VecDeque::new(),
            variant: *b"B2A",
            commands: Vec::new(),
            write_calls: 0,
            read_calls: 0,
            purges: 0,
            resets: 0,
            bitmodes: Vec::new(),
            latency: None,
            write_chunk_size: None,
            read_chunk_size: None,
            write_fault: Fault::default(),
            read_fault: Fault::default(),
            max_write: None,
            max_read: None,
            failing_step: None,
            connected: true,
        }
    }
}

impl MockState {
    fn step(&self, step: MockStep) -> Result<(), TransportError> {
        if self.failing_step == Some(step) {
            return Err(TransportError::ControlFailed {
                request: "mock",
                message: format!("simulated {:?} failure", step),
            });
        }
        Ok(())
    }

    fn bank_mut(&mut self, bank: u8, end: usize) -> &mut Vec<u8> {
        let mem = self.memory.entry(bank).or_default();
        if mem.len() < end {
            mem.resize(end, 0);
        }
        mem
    }

    fn handle_command(&mut self, frame: &CommandFrame) {
        let params = frame.params();
        let word = |i: usize| params.get(i).copied().unwrap_or(0);
        match frame.command() {
            Command::LoadRam | Command::DumpRam => {
                let offset = word(0) as usize;
                let len = (word(1) & LENGTH_MASK) as usize;
                let bank = (word(1) >> BANK_SHIFT) as u8;
                self.pending = Some(if frame.command() == Command::LoadRam {
                    Pending::Load { bank, offset, len }
                } else {
                    Pending::Dump { bank, offset, len }
                });
            }
            Command::GetVersion => {
                let response = self.version_responses.pop_front().unwrap_or_else(|| {
                    VersionResponse {
                        variant: self.variant,
                        magic: DEV_MAGIC,
                    }
                    .to_bytes()
                    .to_vec()
                });
                self.pending = Some(Pending::Response(response));
            }
            _ => {}
        }
        self.commands.push((frame.command(), params.to_vec()));
    }
}

/// Mock transport for unit testing protocol and transfer logic.
///
/// Clones share state, so a test can keep one handle for inspection while
/// the session owns another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    vid: u16,
    pid: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            vid: FTDI_VENDOR_ID,
            pid: HW2_PRODUCT_ID,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set VID/PID reported by the transport.
    pub fn set_ids(&mut self, vid: u16, pid: u16) {
        self.vid = vid;
        self.pid = pid;
    }

    /// Variant tag used for default get-version responses.
    pub fn set_variant(&self, variant: [u8; 3]) {
        self.state().variant = variant;
    }

    /// Queue a raw get-version response (consumed before the default one).
    pub fn queue_version_response(&self, bytes: &[u8]) {
        self.state().version_responses.push_back(bytes.to_vec());
    }

    /// Queue a response carrying `magic` instead of the real one.
    pub fn queue_bad_magic(&self, magic: u32) {
        let variant = self.state().variant;
        self.queue_version_response(&VersionResponse { variant, magic }.to_bytes());
    }

    /// After `skip` successful payload writes, fail the next `count`.
    pub fn fail_writes(&self, skip: usize, count: usize) {
        self.state().write_fault = Fault { skip, count };
    }

    /// After `skip` successful reads, fail the next `count`.
    pub fn fail_reads(&self, skip: usize, count: usize) {
        self.state().read_fault = Fault { skip, count };
    }

    /// Accept at most `n` bytes per payload write.
    pub fn limit_write_size(&self, n: usize) {
        self.state().max_write = Some(n);
    }

    /// Return at most `n` bytes per read.
    pub fn limit_read_size(&self, n: usize) {
        self.state().max_read = Some(n);
    }

    pub fn fail_step(&self, step: MockStep) {
        self.state().failing_step = Some(step);
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state().connected = false;
    }

    /// Preload bank memory.
    pub fn load_memory(&self, bank: Bank, offset: usize, data: &[u8]) {
        let mut state = self.state();
        let mem = state.bank_mut(bank.id(), offset + data.len());
        mem[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Snapshot of `len` bytes of bank memory (zero where never written).
    pub fn memory(&self, bank: Bank, offset: usize, len: usize) -> Vec<u8> {
        let state = self.state();
        let mut out = vec![0u8; len];
        if let Some(mem) = state.memory.get(&bank.id()) {
            let end = mem.len().min(offset + len);
            if offset < end {
                out[..end - offset].copy_from_slice(&mem[offset..end]);
            }
        }
        out
    }

    /// Every command frame received, in order.
    pub fn commands(&self) -> Vec<(Command, Vec<u32>)> {
        self.state().commands.clone()
    }

    pub fn command_count(&self, command: Command) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|(c, _)| *c == command)
            .count()
    }

    /// Total `write` calls, commands and payloads alike.
    pub fn write_calls(&self) -> usize {
        self.state().write_calls
    }

    pub fn read_calls(&self) -> usize {
        self.state().read_calls
    }

    pub fn purges(&self) -> usize {
        self.state().purges
    }

    pub fn resets(&self) -> usize {
        self.state().resets
    }

    pub fn bitmodes(&self) -> Vec<(u8, BitMode)> {
        self.state().bitmodes.clone()
    }

    pub fn latency(&self) -> Option<u8> {
        self.state().latency
    }

    pub fn write_chunk_size(&self) -> Option<usize> {
        self.state().write_chunk_size
    }

    pub fn read_chunk_size(&self) -> Option<usize> {
        self.state().read_chunk_size
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkTransport for MockTransport {
    fn reset(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.step(MockStep::Reset)?;
        state.resets += 1;
        state.pending = None;
        Ok(())
    }

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<(), TransportError> {
        let mut state = self.state();
        state.step(MockStep::Bitmode(mode))?;
        state.bitmodes.push((mask, mode));
        Ok(())
    }

    fn set_latency_timer(&mut self, ms: u8) -> Result<(), TransportError> {
        let mut state = self.state();
        state.step(MockStep::Latency)?;
        state.latency = Some(ms);
        Ok(())
    }

    fn purge_buffers(&mut self) -> Result<(), TransportError> {
        // Only counted: a pending load/dump survives so retries can finish.
        let mut state = self.state();
        state.step(MockStep::Purge)?;
        state.purges += 1;
        Ok(())
    }

    fn set_write_chunk_size(&mut self, size: usize) -> Result<(), TransportError> {
        let mut state = self.state();
        state.step(MockStep::ChunkSize)?;
        state.write_chunk_size = Some(size);
        Ok(())
    }

    fn set_read_chunk_size(&mut self, size: usize) -> Result<(), TransportError> {
        let mut state = self.state();
        state.step(MockStep::ChunkSize)?;
        state.read_chunk_size = Some(size);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.write_calls += 1;

        if let Some(Pending::Load { bank, offset, len }) = state.pending.clone() {
            if state.write_fault.trips() {
                return Ok(0);
            }
            let n = data.len().min(len).min(state.max_write.unwrap_or(usize::MAX));
            let mem = state.bank_mut(bank, offset + n);
            mem[offset..offset + n].copy_from_slice(&data[..n]);
            state.pending = None;
            return Ok(n);
        }

        let frame = CommandFrame::from_bytes(data)
            .map_err(|e| TransportError::WriteFailed(format!("mock: bad frame: {}", e)))?;
        state.handle_command(&frame);
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.read_calls += 1;
        if state.read_fault.trips() {
            return Err(TransportError::Timeout { timeout_ms: 5000 });
        }

        let limit = buf.len().min(state.max_read.unwrap_or(usize::MAX));
        match state.pending.take() {
            Some(Pending::Response(bytes)) => {
                let n = limit.min(bytes.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Some(Pending::Dump { bank, offset, len }) => {
                let n = limit.min(len);
                let mem = state.bank_mut(bank, offset + n);
                buf[..n].copy_from_slice(&mem[offset..offset + n]);
                if n < len {
                    state.pending = Some(Pending::Dump {
                        bank,
                        offset: offset + n,
                        len: len - n,
                    });
                }
                Ok(n)
            }
            other => {
                state.pending = other;
                Ok(0)
            }
        }
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
