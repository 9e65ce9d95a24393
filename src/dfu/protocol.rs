//! Typed request/response layer on top of a [`DfuTransport`].
//!
//! Encodes each control operation as `[opcode, params...]` with
//! little-endian parameters, validates the `0x60` response marker and the
//! opcode echo, and maps result codes onto error kinds.

use std::time::Duration;

use log::trace;

use super::config::{DfuOpcode, DfuResultCode, ObjectType, PING_TIMEOUT, RESPONSE_PREFIX};
use super::error::{DfuError, DfuResult};
use super::transport::DfuTransport;

/// Per-type object size and transfer progress reported by Select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStatus {
    /// Largest object the bootloader accepts for this type.
    pub max_size: u32,
    /// Bytes already staged for this type.
    pub offset: u32,
    /// CRC32 over those bytes.
    pub crc: u32,
}

/// Offset and CRC32 of the current object, reported by CalcCrc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcReport {
    pub offset: u32,
    pub crc: u32,
}

/// Control-channel client for the Secure DFU protocol.
pub struct DfuProtocol<T: DfuTransport> {
    transport: T,
    timeout: Duration,
}

impl<T: DfuTransport> DfuProtocol<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// MTU already negotiated by the link layer, if any.
    pub fn link_mtu(&self) -> Option<u16> {
        self.transport.link_mtu()
    }

    /// Data chunk budget for a given MTU.
    pub fn chunk_size(&self, mtu: u16) -> usize {
        self.transport.chunk_size(mtu)
    }

    /// Probe bootloader liveness. The echoed identifier must match.
    pub fn ping(&mut self, id: u8) -> DfuResult<()> {
        let payload = self.request_with_timeout(DfuOpcode::Ping, &[id], PING_TIMEOUT)?;
        match payload.first() {
            Some(&echo) if echo == id => Ok(()),
            Some(&echo) => Err(DfuError::ProtocolDesync {
                reason: format!("ping echoed id {echo:#04x}, expected {id:#04x}"),
            }),
            None => Err(DfuError::ProtocolDesync {
                reason: "ping response carries no id".into(),
            }),
        }
    }

    /// Set the packet receipt notification interval (0 disables).
    pub fn set_receipt_notification(&mut self, prn: u16) -> DfuResult<()> {
        self.request(DfuOpcode::ReceiptNotifSet, &prn.to_le_bytes())?;
        Ok(())
    }

    /// Query the serial packet size budget.
    pub fn get_mtu(&mut self) -> DfuResult<u16> {
        let payload = self.request(DfuOpcode::SerialMtuGet, &[])?;
        match payload.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(DfuError::ProtocolDesync {
                reason: format!("MTU response too short: {payload:02x?}"),
            }),
        }
    }

    /// Query object size and progress for one object type.
    pub fn select(&mut self, object: ObjectType) -> DfuResult<ObjectStatus> {
        let payload = self.request(DfuOpcode::ObjectSelect, &[object as u8])?;
        if payload.len() < 12 {
            return Err(DfuError::ProtocolDesync {
                reason: format!("select response too short: {payload:02x?}"),
            });
        }
        Ok(ObjectStatus {
            max_size: read_u32(&payload[0..4]),
            offset: read_u32(&payload[4..8]),
            crc: read_u32(&payload[8..12]),
        })
    }

    /// Allocate a new object. Resets the bootloader's offset and CRC for
    /// this object type.
    pub fn create(&mut self, object: ObjectType, size: u32) -> DfuResult<()> {
        let mut params = [0u8; 5];
        params[0] = object as u8;
        params[1..5].copy_from_slice(&size.to_le_bytes());
        self.request(DfuOpcode::ObjectCreate, &params)?;
        Ok(())
    }

    /// Ask for the bootloader's view of the current object.
    pub fn calculate_crc(&mut self) -> DfuResult<CrcReport> {
        let payload = self.request(DfuOpcode::CrcGet, &[])?;
        if payload.len() < 8 {
            return Err(DfuError::ProtocolDesync {
                reason: format!("CRC response too short: {payload:02x?}"),
            });
        }
        Ok(CrcReport {
            offset: read_u32(&payload[0..4]),
            crc: read_u32(&payload[4..8]),
        })
    }

    /// Commit the current object.
    pub fn execute(&mut self) -> DfuResult<()> {
        self.request(DfuOpcode::ObjectExecute, &[])?;
        Ok(())
    }

    /// Stream one chunk on the data channel. Fire-and-forget.
    pub fn write_data(&mut self, chunk: &[u8]) -> DfuResult<()> {
        self.transport.write_data(chunk)
    }

    fn request(&mut self, opcode: DfuOpcode, params: &[u8]) -> DfuResult<Vec<u8>> {
        self.request_with_timeout(opcode, params, self.timeout)
    }

    fn request_with_timeout(
        &mut self,
        opcode: DfuOpcode,
        params: &[u8],
        timeout: Duration,
    ) -> DfuResult<Vec<u8>> {
        let mut frame = Vec::with_capacity(1 + params.len());
        frame.push(opcode as u8);
        frame.extend_from_slice(params);
        trace!("-> {frame:02x?}");

        self.transport.write_control(&frame)?;
        let response = self.transport.read_control(timeout)?;
        trace!("<- {response:02x?}");

        self.parse_response(opcode, &response)
    }

    fn parse_response(&self, opcode: DfuOpcode, response: &[u8]) -> DfuResult<Vec<u8>> {
        let (&prefix, rest) = response.split_first().ok_or(DfuError::ProtocolDesync {
            reason: "empty response frame".into(),
        })?;
        if prefix != RESPONSE_PREFIX || rest.len() < 2 {
            return Err(DfuError::ProtocolDesync {
                reason: format!("not a response frame: {response:02x?}"),
            });
        }

        let (echo, result, payload) = (rest[0], rest[1], &rest[2..]);
        if echo != opcode as u8 {
            return Err(DfuError::ProtocolDesync {
                reason: format!(
                    "response echoes opcode {echo:#04x}, request was {:#04x}",
                    opcode as u8
                ),
            });
        }

        match DfuResultCode::from_byte(result) {
            Some(DfuResultCode::Success) => Ok(payload.to_vec()),
            Some(code) => Err(DfuError::Target {
                opcode: opcode as u8,
                code,
                extended: match code {
                    DfuResultCode::ExtendedError => payload.first().copied(),
                    _ => None,
                },
            }),
            None => Err(DfuError::ProtocolDesync {
                reason: format!("unknown result code {result:#04x}"),
            }),
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
