//! SLIP framing for the serial control and data channels.
//!
//! Each frame is a byte-stuffed payload followed by a single `0xC0`
//! terminator. `0xC0` inside the payload becomes `0xDB 0xDC`, `0xDB`
//! becomes `0xDB 0xDD`.

use super::config::{MAX_FRAME_LEN, SLIP_END, SLIP_ESC, SLIP_ESC_END, SLIP_ESC_ESC};
use super::error::{DfuError, DfuResult};

/// Encode one payload as a terminated frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + payload.len() / 4 + 1);

    for &byte in payload {
        match byte {
            SLIP_END => framed.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => framed.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            _ => framed.push(byte),
        }
    }

    framed.push(SLIP_END);
    framed
}

/// Streaming frame decoder.
///
/// Bytes arrive from the port in arbitrary slices; the decoder yields one
/// payload per terminator. A malformed escape fails the frame being
/// assembled, after which the decoder discards input until the next
/// terminator and starts clean.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    escaped: bool,
    resyncing: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64),
            escaped: false,
            resyncing: false,
        }
    }

    /// Feed a single byte.
    ///
    /// Returns `Some(Ok(payload))` on a completed frame, `Some(Err(_))` when
    /// the current frame is malformed, `None` while more input is needed.
    pub fn push(&mut self, byte: u8) -> Option<DfuResult<Vec<u8>>> {
        if self.resyncing {
            if byte == SLIP_END {
                self.resyncing = false;
            }
            return None;
        }

        if byte == SLIP_END {
            if self.escaped {
                // Terminator in the middle of an escape sequence. The
                // terminator itself already resynchronizes the stream.
                self.escaped = false;
                self.buf.clear();
                return Some(Err(DfuError::InvalidEscape));
            }
            if self.buf.is_empty() {
                // Stray terminator between frames.
                return None;
            }
            return Some(Ok(std::mem::take(&mut self.buf)));
        }

        if self.escaped {
            self.escaped = false;
            match byte {
                SLIP_ESC_END => self.buf.push(SLIP_END),
                SLIP_ESC_ESC => self.buf.push(SLIP_ESC),
                _ => {
                    self.abort_frame();
                    return Some(Err(DfuError::InvalidEscape));
                }
            }
        } else if byte == SLIP_ESC {
            self.escaped = true;
        } else {
            if self.buf.len() >= MAX_FRAME_LEN {
                self.abort_frame();
                return Some(Err(DfuError::FrameTooLong { max: MAX_FRAME_LEN }));
            }
            self.buf.push(byte);
        }

        None
    }

    /// Drop any partial frame and wait for the next terminator.
    fn abort_frame(&mut self) {
        self.buf.clear();
        self.escaped = false;
        self.resyncing = true;
    }

    /// Forget all decoder state, including pending resynchronization.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.escaped = false;
        self.resyncing = false;
    }
}
