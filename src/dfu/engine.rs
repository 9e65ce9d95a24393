//! The upgrade engine: drives a bootloader through a complete firmware
//! update.
//!
//! One engine performs one upgrade: probe the bootloader, negotiate the
//! data chunk size, then move the init packet and the firmware image across
//! as object streams. Every object is streamed in a burst of data-channel
//! writes, checked against the bootloader's CRC32, and only then committed
//! with Execute. A CRC mismatch throws away at most one object: the engine
//! re-creates it and streams it again.

use std::time::Duration;

use crc32fast::Hasher;
use log::{debug, info, warn};

use super::config::{ObjectType, MAX_OBJECT_ATTEMPTS, PING_ATTEMPTS, REQUEST_TIMEOUT};
use super::error::{DfuError, DfuResult};
use super::protocol::{DfuProtocol, ObjectStatus};
use super::transport::DfuTransport;

/// Upgrade progress reported to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuProgress {
    /// Checking that the bootloader is alive and negotiating transfer
    /// parameters.
    Probing,
    /// Transferring the init packet.
    SendingInit,
    /// Transferring the firmware image.
    Uploading { sent: usize, total: usize },
    /// The last object is committed; the bootloader activates the image.
    Complete,
}

impl DfuProgress {
    /// Rough percentage for progress bars.
    pub fn percent(&self) -> f32 {
        match self {
            DfuProgress::Probing => 0.0,
            DfuProgress::SendingInit => 5.0,
            DfuProgress::Uploading { sent, total } => {
                if *total == 0 {
                    10.0
                } else {
                    10.0 + (*sent as f32 / *total as f32) * 90.0
                }
            }
            DfuProgress::Complete => 100.0,
        }
    }

    /// Human-readable message for this stage.
    pub fn message(&self) -> String {
        match self {
            DfuProgress::Probing => "Probing bootloader...".into(),
            DfuProgress::SendingInit => "Sending init packet...".into(),
            DfuProgress::Uploading { sent, total } => {
                format!("Uploading firmware... {sent}/{total} bytes")
            }
            DfuProgress::Complete => "Upgrade complete".into(),
        }
    }
}

/// Options for one upgrade run.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Packet receipt notification interval requested from the bootloader.
    /// The engine polls CalcCrc after every burst either way.
    pub prn: u16,
    /// Control-channel response deadline.
    pub request_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            prn: 0,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

/// Drives one complete upgrade over any [`DfuTransport`].
pub struct DfuEngine<T: DfuTransport, F: Fn(DfuProgress)> {
    protocol: DfuProtocol<T>,
    options: EngineOptions,
    on_progress: F,
    chunk: usize,
}

impl<T: DfuTransport, F: Fn(DfuProgress)> DfuEngine<T, F> {
    pub fn new(transport: T, options: EngineOptions, on_progress: F) -> Self {
        Self {
            protocol: DfuProtocol::new(transport, options.request_timeout),
            options,
            on_progress,
            chunk: 0,
        }
    }

    /// Run the whole upgrade: init packet first, then the firmware image.
    ///
    /// Committing the final firmware object activates the new image; there
    /// is no separate activation request.
    pub fn run(&mut self, init: &[u8], firmware: &[u8]) -> DfuResult<()> {
        (self.on_progress)(DfuProgress::Probing);
        self.probe()?;

        (self.on_progress)(DfuProgress::SendingInit);
        self.transfer(ObjectType::Command, init)?;
        self.transfer(ObjectType::Data, firmware)?;

        (self.on_progress)(DfuProgress::Complete);
        Ok(())
    }

    /// Confirm the bootloader responds, disable receipt notifications and
    /// settle on the data chunk size.
    fn probe(&mut self) -> DfuResult<()> {
        let mut ping_id = 0u8;
        for attempt in 1..=PING_ATTEMPTS {
            ping_id = ping_id.wrapping_add(1);
            match self.protocol.ping(ping_id) {
                Ok(()) => {
                    debug!("bootloader answered ping {ping_id} (attempt {attempt})");
                    break;
                }
                Err(DfuError::Timeout) if attempt < PING_ATTEMPTS => {
                    warn!("ping attempt {attempt} timed out, retrying");
                }
                Err(err) => return Err(err),
            }
        }

        self.protocol.set_receipt_notification(self.options.prn)?;

        let mtu = match self.protocol.link_mtu() {
            Some(mtu) => mtu,
            None => self.protocol.get_mtu()?,
        };
        self.chunk = self.protocol.chunk_size(mtu);
        if self.chunk == 0 {
            return Err(DfuError::ProtocolDesync {
                reason: format!("unusable MTU {mtu}"),
            });
        }
        debug!("mtu {mtu}, data chunk {} bytes", self.chunk);
        Ok(())
    }

    /// Move one payload across as a sequence of objects.
    fn transfer(&mut self, object: ObjectType, payload: &[u8]) -> DfuResult<()> {
        let status = self.protocol.select(object)?;
        let max_size = status.max_size as usize;
        if max_size == 0 {
            return Err(DfuError::ProtocolDesync {
                reason: format!("select reports zero object size for {object:?}"),
            });
        }
        debug!(
            "{object:?}: {} bytes in objects of at most {max_size} (target at offset {}, crc {:#010x})",
            payload.len(),
            status.offset,
            status.crc,
        );

        let total = payload.len();
        let mut base = resume_offset(object, payload, &status);
        while base < total {
            let len = usize::min(max_size, total - base);
            self.write_object(object, &payload[base..base + len], base)?;
            base += len;
            if object == ObjectType::Data {
                (self.on_progress)(DfuProgress::Uploading { sent: base, total });
            }
        }
        Ok(())
    }

    /// One Create/burst/CalcCrc/Execute cycle. On a CRC mismatch the object
    /// is created again from scratch; a partially accepted burst is never
    /// resumed.
    fn write_object(&mut self, object: ObjectType, bytes: &[u8], base: usize) -> DfuResult<()> {
        let len = bytes.len() as u32;
        let mut attempts = 0u8;
        loop {
            attempts += 1;
            self.protocol.create(object, len)?;
            let crc = self.stream_burst(bytes)?;

            let report = self.protocol.calculate_crc()?;
            if report.offset == len && report.crc == crc {
                self.protocol.execute()?;
                return Ok(());
            }

            warn!(
                "{object:?} object at offset {base}: target reports {}/{:#010x}, expected {len}/{crc:#010x} (attempt {attempts})",
                report.offset, report.crc,
            );
            if attempts >= MAX_OBJECT_ATTEMPTS {
                return Err(DfuError::CrcMismatch {
                    attempts,
                    expected: crc,
                    actual: report.crc,
                });
            }
        }
    }

    /// Write one object's bytes in MTU-sized chunks, returning the CRC32
    /// over exactly the bytes handed to the transport.
    fn stream_burst(&mut self, bytes: &[u8]) -> DfuResult<u32> {
        let mut hasher = Hasher::new();
        for piece in bytes.chunks(self.chunk) {
            self.protocol.write_data(piece)?;
            hasher.update(piece);
        }
        Ok(hasher.finalize())
    }
}

/// Decide where an interrupted transfer may pick up.
///
/// The bootloader's staged progress is only trusted when its CRC matches
/// ours over the same prefix; anything else restarts the payload from the
/// beginning.
fn resume_offset(object: ObjectType, payload: &[u8], status: &ObjectStatus) -> usize {
    let offset = status.offset as usize;
    if offset == 0 || offset > payload.len() {
        return 0;
    }

    let mut hasher = Hasher::new();
    hasher.update(&payload[..offset]);
    if hasher.finalize() == status.crc {
        info!("resuming {object:?} transfer at offset {offset}");
        offset
    } else {
        debug!("stale {object:?} progress on target (crc differs at offset {offset}), restarting");
        0
    }
}
