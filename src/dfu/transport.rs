//! Transport abstraction for DFU communication.
//!
//! The control channel is request/response with an asynchronously arriving
//! response stream; the data channel is write-only. The serial
//! implementation lives here, the BLE implementation in [`super::ble`].

use std::collections::VecDeque;
use std::io::Read;
use std::time::{Duration, Instant};

use log::warn;
use serialport::SerialPort;

use super::config::{
    DfuOpcode, DFU_BAUD_RATE, MAX_FRAMING_ERRORS, SERIAL_FRAME_OVERHEAD,
};
use super::error::{DfuError, DfuResult};
use super::slip::{self, FrameDecoder};

/// Byte-oriented transport under the DFU protocol.
///
/// `read_control` returns complete response frames only; partial framing is
/// handled inside the transport.
pub trait DfuTransport: Send {
    /// Send one control request.
    fn write_control(&mut self, request: &[u8]) -> DfuResult<()>;

    /// Block until a complete control response arrives or the timeout
    /// expires.
    fn read_control(&mut self, timeout: Duration) -> DfuResult<Vec<u8>>;

    /// Send one chunk on the data channel. No per-chunk response exists.
    fn write_data(&mut self, chunk: &[u8]) -> DfuResult<()>;

    /// MTU negotiated by the link layer, when the transport knows it without
    /// asking the bootloader. Serial returns `None` and the engine queries
    /// the bootloader instead.
    fn link_mtu(&self) -> Option<u16>;

    /// Largest data chunk guaranteed to fit one data-channel write of `mtu`
    /// bytes.
    fn chunk_size(&self, mtu: u16) -> usize;

    /// Release the transport.
    fn close(&mut self) {}
}

/// Serial port transport with SLIP framing.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    decoder: FrameDecoder,
    backlog: VecDeque<u8>,
    framing_errors: u32,
}

impl SerialTransport {
    /// Open a serial port for DFU communication (115200 8N1).
    pub fn open(port_name: &str) -> DfuResult<Self> {
        Self::open_with_baud(port_name, DFU_BAUD_RATE)
    }

    /// Open a serial port with a specific baud rate.
    pub fn open_with_baud(port_name: &str, baud_rate: u32) -> DfuResult<Self> {
        let normalized = normalize_port_name(port_name);

        let port = serialport::new(&normalized, baud_rate)
            .timeout(Duration::from_millis(1000))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        // Drop anything a previous session left in the receive buffer.
        port.clear(serialport::ClearBuffer::Input).ok();

        Ok(Self {
            port,
            decoder: FrameDecoder::new(),
            backlog: VecDeque::new(),
            framing_errors: 0,
        })
    }

    /// Run buffered bytes through the decoder until a frame completes.
    fn poll_frame(&mut self) -> DfuResult<Option<Vec<u8>>> {
        while let Some(byte) = self.backlog.pop_front() {
            match self.decoder.push(byte) {
                Some(Ok(frame)) => return Ok(Some(frame)),
                Some(Err(err)) => {
                    self.framing_errors += 1;
                    if self.framing_errors >= MAX_FRAMING_ERRORS {
                        return Err(DfuError::FramingLimit {
                            count: self.framing_errors,
                        });
                    }
                    warn!("dropped malformed control frame: {err}");
                }
                None => {}
            }
        }
        Ok(None)
    }
}

impl DfuTransport for SerialTransport {
    fn write_control(&mut self, request: &[u8]) -> DfuResult<()> {
        use std::io::Write;

        // One response per request: stale input can only belong to an
        // abandoned exchange, so clear it before sending.
        self.port.clear(serialport::ClearBuffer::Input).ok();
        self.decoder.reset();
        self.backlog.clear();

        self.port.write_all(&slip::encode(request)).map_err(DfuError::Io)
    }

    fn read_control(&mut self, timeout: Duration) -> DfuResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];

        loop {
            if let Some(frame) = self.poll_frame()? {
                return Ok(frame);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return Err(DfuError::Timeout),
            };
            self.port.set_timeout(remaining)?;

            match self.port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => self.backlog.extend(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(DfuError::Timeout)
                }
                Err(e) => return Err(DfuError::Io(e)),
            }
        }
    }

    fn write_data(&mut self, chunk: &[u8]) -> DfuResult<()> {
        use std::io::Write;

        self.port.write_all(&data_frame(chunk)).map_err(DfuError::Io)
    }

    fn link_mtu(&self) -> Option<u16> {
        None
    }

    fn chunk_size(&self, mtu: u16) -> usize {
        serial_chunk_size(mtu)
    }

    fn close(&mut self) {
        use std::io::Write;

        self.port.flush().ok();
    }
}

/// Largest chunk that still fits `mtu` framed bytes when every payload byte
/// escapes to two, on top of the opcode and terminator.
fn serial_chunk_size(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(SERIAL_FRAME_OVERHEAD) / 2
}

/// Frame one data chunk for the serial data channel.
fn data_frame(chunk: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(chunk.len() + 1);
    payload.push(DfuOpcode::ObjectWrite as u8);
    payload.extend_from_slice(chunk);
    slip::encode(&payload)
}

/// Normalize a port name for cross-platform compatibility.
fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. so opening does not block on DCD.
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need the \\.\ prefix.
        if name.starts_with("COM") {
            if let Ok(n) = name[3..].parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}
