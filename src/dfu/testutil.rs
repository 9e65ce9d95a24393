//! Test doubles plugged in at the transport seam.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crc32fast::Hasher;

use super::config::{DfuOpcode, ObjectType, RESPONSE_PREFIX};
use super::error::{DfuError, DfuResult};
use super::transport::DfuTransport;

// ============================================================================
// ScriptTransport: canned responses for protocol-level tests
// ============================================================================

#[derive(Default)]
struct ScriptState {
    sent: Vec<Vec<u8>>,
    data: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
}

/// Records every outgoing frame and plays back canned responses in order.
pub struct ScriptTransport {
    state: Arc<Mutex<ScriptState>>,
}

/// Read-side handle that outlives the transport once the protocol owns it.
pub struct ScriptHandle(Arc<Mutex<ScriptState>>);

impl ScriptTransport {
    pub fn with_replies(replies: Vec<Vec<u8>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                replies: replies.into(),
                ..ScriptState::default()
            })),
        }
    }

    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle(Arc::clone(&self.state))
    }
}

impl ScriptHandle {
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().sent.clone()
    }

    pub fn data_written(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().data.clone()
    }
}

impl DfuTransport for ScriptTransport {
    fn write_control(&mut self, request: &[u8]) -> DfuResult<()> {
        self.state.lock().unwrap().sent.push(request.to_vec());
        Ok(())
    }

    fn read_control(&mut self, _timeout: Duration) -> DfuResult<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .replies
            .pop_front()
            .ok_or(DfuError::Timeout)
    }

    fn write_data(&mut self, chunk: &[u8]) -> DfuResult<()> {
        self.state.lock().unwrap().data.push(chunk.to_vec());
        Ok(())
    }

    fn link_mtu(&self) -> Option<u16> {
        None
    }

    fn chunk_size(&self, mtu: u16) -> usize {
        mtu as usize
    }
}

// ============================================================================
// FakeBootloader: object slots with real CRC tracking for engine tests
// ============================================================================

struct Slot {
    object: u8,
    received: Vec<u8>,
}

struct FakeState {
    command_max: u32,
    data_max: u32,
    mtu: u16,
    command_select: (u32, u32),
    data_select: (u32, u32),
    slot: Option<Slot>,
    executed_command: Vec<u8>,
    executed_data: Vec<u8>,
    drop_pings: u32,
    corrupt_skip: u32,
    corrupt_count: u32,
    desync_crc_echo: bool,
    ops: Vec<String>,
    pending: VecDeque<Vec<u8>>,
}

/// In-memory bootloader good enough to drive a whole upgrade: per-type
/// object slots, real CRC32 bookkeeping, and scripted faults.
pub struct FakeBootloader {
    state: Arc<Mutex<FakeState>>,
}

/// Assertion-side handle kept by the test after the engine takes the
/// transport.
pub struct FakeHandle(Arc<Mutex<FakeState>>);

impl FakeBootloader {
    pub fn new(command_max: u32, data_max: u32, mtu: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                command_max,
                data_max,
                mtu,
                command_select: (0, 0),
                data_select: (0, 0),
                slot: None,
                executed_command: Vec::new(),
                executed_data: Vec::new(),
                drop_pings: 0,
                corrupt_skip: 0,
                corrupt_count: 0,
                desync_crc_echo: false,
                ops: Vec::new(),
                pending: VecDeque::new(),
            })),
        }
    }

    /// Swallow the first `count` pings without answering.
    pub fn drop_pings(self, count: u32) -> Self {
        self.state.lock().unwrap().drop_pings = count;
        self
    }

    /// Report a wrong CRC for `count` CalcCrc requests, after letting the
    /// first `skip` reports through untouched.
    pub fn corrupt_crc_reports(self, skip: u32, count: u32) -> Self {
        let mut state = self.state.lock().unwrap();
        state.corrupt_skip = skip;
        state.corrupt_count = count;
        drop(state);
        self
    }

    /// Answer the next CalcCrc with an Execute opcode echo.
    pub fn desync_crc_echo(self) -> Self {
        self.state.lock().unwrap().desync_crc_echo = true;
        self
    }

    /// Seed the progress Select reports for Data, as left by an earlier
    /// session.
    pub fn data_progress(self, offset: u32, crc: u32) -> Self {
        self.state.lock().unwrap().data_select = (offset, crc);
        self
    }

    pub fn handle(&self) -> FakeHandle {
        FakeHandle(Arc::clone(&self.state))
    }
}

impl FakeHandle {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }

    /// Trace of control operations, in arrival order.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn executed_command(&self) -> Vec<u8> {
        self.lock().executed_command.clone()
    }

    pub fn executed_data(&self) -> Vec<u8> {
        self.lock().executed_data.clone()
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

impl FakeState {
    fn respond(&mut self, opcode: u8, payload: &[u8]) {
        let mut frame = vec![RESPONSE_PREFIX, opcode, 0x01];
        frame.extend_from_slice(payload);
        self.pending.push_back(frame);
    }

    fn handle_request(&mut self, request: &[u8]) {
        let opcode = request[0];
        match opcode {
            op if op == DfuOpcode::Ping as u8 => {
                self.ops.push("Ping".into());
                if self.drop_pings > 0 {
                    self.drop_pings -= 1;
                    return;
                }
                self.respond(opcode, &request[1..2]);
            }
            op if op == DfuOpcode::ReceiptNotifSet as u8 => {
                let prn = u16::from_le_bytes([request[1], request[2]]);
                self.ops.push(format!("SetPrn({prn})"));
                self.respond(opcode, &[]);
            }
            op if op == DfuOpcode::SerialMtuGet as u8 => {
                self.ops.push("MtuGet".into());
                let mtu = self.mtu.to_le_bytes();
                self.respond(opcode, &mtu);
            }
            op if op == DfuOpcode::ObjectSelect as u8 => {
                let object = request[1];
                self.ops.push(format!("Select({object})"));
                let (max, (offset, crc)) = if object == ObjectType::Command as u8 {
                    (self.command_max, self.command_select)
                } else {
                    (self.data_max, self.data_select)
                };
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&max.to_le_bytes());
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&crc.to_le_bytes());
                self.respond(opcode, &payload);
            }
            op if op == DfuOpcode::ObjectCreate as u8 => {
                let object = request[1];
                let size = u32::from_le_bytes([request[2], request[3], request[4], request[5]]);
                self.ops.push(format!("Create({object}, {size})"));
                self.slot = Some(Slot {
                    object,
                    received: Vec::new(),
                });
                self.respond(opcode, &[]);
            }
            op if op == DfuOpcode::CrcGet as u8 => {
                self.ops.push("CalcCrc".into());
                let (offset, mut crc) = match &self.slot {
                    Some(slot) => (slot.received.len() as u32, crc32(&slot.received)),
                    None => (0, 0),
                };
                if self.corrupt_skip > 0 {
                    self.corrupt_skip -= 1;
                } else if self.corrupt_count > 0 {
                    self.corrupt_count -= 1;
                    crc ^= 0x5A5A_5A5A;
                }
                let echo = if self.desync_crc_echo {
                    self.desync_crc_echo = false;
                    DfuOpcode::ObjectExecute as u8
                } else {
                    opcode
                };
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&crc.to_le_bytes());
                self.respond(echo, &payload);
            }
            op if op == DfuOpcode::ObjectExecute as u8 => {
                self.ops.push("Execute".into());
                if let Some(slot) = self.slot.take() {
                    if slot.object == ObjectType::Command as u8 {
                        self.executed_command.extend_from_slice(&slot.received);
                    } else {
                        self.executed_data.extend_from_slice(&slot.received);
                    }
                }
                self.respond(opcode, &[]);
            }
            other => {
                self.ops.push(format!("Unknown({other:#04x})"));
            }
        }
    }
}

impl DfuTransport for FakeBootloader {
    fn write_control(&mut self, request: &[u8]) -> DfuResult<()> {
        let mut state = self.state.lock().unwrap();
        // A real transport clears stale input before each request.
        state.pending.clear();
        state.handle_request(request);
        Ok(())
    }

    fn read_control(&mut self, _timeout: Duration) -> DfuResult<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .pending
            .pop_front()
            .ok_or(DfuError::Timeout)
    }

    fn write_data(&mut self, chunk: &[u8]) -> DfuResult<()> {
        if let Some(slot) = self.state.lock().unwrap().slot.as_mut() {
            slot.received.extend_from_slice(chunk);
        }
        Ok(())
    }

    fn link_mtu(&self) -> Option<u16> {
        None
    }

    fn chunk_size(&self, mtu: u16) -> usize {
        // Same budget a framed serial link would leave.
        (mtu as usize).saturating_sub(3) / 2
    }
}
