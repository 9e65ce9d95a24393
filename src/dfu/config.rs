//! Configuration constants for the Secure DFU protocol.

use std::time::Duration;

use uuid::{uuid, Uuid};

// ============================================================================
// Defaults
// ============================================================================

/// Default serial device of the DFU target.
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB0";

/// Default BLE host interface.
pub const DEFAULT_BLE_INTERFACE: &str = "hci0";

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate for DFU communication with the bootloader (8N1, no flow control).
pub const DFU_BAUD_RATE: u32 = 115_200;

// ============================================================================
// Protocol Timeouts and Retries
// ============================================================================

/// Timeout waiting for a control-channel response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Shorter timeout for the initial Ping probe; an unresponsive bootloader
/// should not hold the whole request timeout per attempt.
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of Ping probes before giving up on the bootloader.
pub const PING_ATTEMPTS: u32 = 3;

/// Attempts to transfer a single object before the upgrade fails.
pub const MAX_OBJECT_ATTEMPTS: u8 = 3;

/// Malformed control frames tolerated per session before aborting.
pub const MAX_FRAMING_ERRORS: u32 = 3;

/// Time allowed for the target to reboot into the bootloader and start
/// advertising after a buttonless entry request.
pub const BOOTLOADER_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed to discover the target during the initial BLE scan.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// SLIP Framing
// ============================================================================

/// Frame terminator.
pub const SLIP_END: u8 = 0xC0;

/// Escape introducer.
pub const SLIP_ESC: u8 = 0xDB;

/// Escaped terminator (0xC0 encoded as 0xDB 0xDC).
pub const SLIP_ESC_END: u8 = 0xDC;

/// Escaped escape (0xDB encoded as 0xDB 0xDD).
pub const SLIP_ESC_ESC: u8 = 0xDD;

/// Upper bound on a decoded control frame. Real responses are a handful of
/// bytes; anything larger is line noise.
pub const MAX_FRAME_LEN: usize = 512;

// ============================================================================
// Data-Channel Sizing
// ============================================================================

/// Serial framing overhead per data write: the write opcode, the frame
/// terminator and a byte of slack.
pub const SERIAL_FRAME_OVERHEAD: usize = 3;

/// ATT header margin subtracted from the link MTU on the data characteristic.
pub const BLE_ATT_MARGIN: usize = 3;

/// Link MTU assumed when the host stack does not report one.
pub const BLE_DEFAULT_MTU: u16 = 247;

// ============================================================================
// GATT UUIDs
// ============================================================================

/// Secure DFU service.
pub const DFU_SERVICE_UUID: Uuid = uuid!("0000fe59-0000-1000-8000-00805f9b34fb");

/// DFU control point characteristic (write + notify).
pub const DFU_CONTROL_UUID: Uuid = uuid!("8ec90001-f315-4f60-9fb8-838830daea50");

/// DFU data characteristic (write without response).
pub const DFU_DATA_UUID: Uuid = uuid!("8ec90002-f315-4f60-9fb8-838830daea50");

/// Buttonless DFU characteristic on the running application (write + indicate).
pub const DFU_BUTTONLESS_UUID: Uuid = uuid!("8ec90003-f315-4f60-9fb8-838830daea50");

// ============================================================================
// Opcodes and Result Codes
// ============================================================================

/// Marker byte prefixing every control-channel response.
pub const RESPONSE_PREFIX: u8 = 0x60;

/// Secure DFU control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuOpcode {
    /// Allocate a new object of a given type and size.
    ObjectCreate = 0x01,
    /// Set the packet receipt notification interval.
    ReceiptNotifSet = 0x02,
    /// Ask for the offset and CRC32 of the current object.
    CrcGet = 0x03,
    /// Commit the current object.
    ObjectExecute = 0x04,
    /// Query per-type object size and transfer progress.
    ObjectSelect = 0x06,
    /// Query the serial packet size budget.
    SerialMtuGet = 0x07,
    /// Data write; implicit opcode on the serial data channel.
    ObjectWrite = 0x08,
    /// Liveness probe with an echoed identifier.
    Ping = 0x09,
}

/// The two object streams of an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// Init packet.
    Command = 0x01,
    /// Firmware image.
    Data = 0x02,
}

/// Result codes returned by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuResultCode {
    InvalidCode = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtendedError = 0x0B,
}

impl DfuResultCode {
    /// Parse a result code from a response byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(DfuResultCode::InvalidCode),
            0x01 => Some(DfuResultCode::Success),
            0x02 => Some(DfuResultCode::OpCodeNotSupported),
            0x03 => Some(DfuResultCode::InvalidParameter),
            0x04 => Some(DfuResultCode::InsufficientResources),
            0x05 => Some(DfuResultCode::InvalidObject),
            0x07 => Some(DfuResultCode::UnsupportedType),
            0x08 => Some(DfuResultCode::OperationNotPermitted),
            0x0A => Some(DfuResultCode::OperationFailed),
            0x0B => Some(DfuResultCode::ExtendedError),
            _ => None,
        }
    }

    /// Human-readable description of the code.
    pub fn description(&self) -> &'static str {
        match self {
            DfuResultCode::InvalidCode => "invalid opcode",
            DfuResultCode::Success => "success",
            DfuResultCode::OpCodeNotSupported => "opcode not supported",
            DfuResultCode::InvalidParameter => "missing or invalid parameter",
            DfuResultCode::InsufficientResources => "insufficient resources",
            DfuResultCode::InvalidObject => "invalid object",
            DfuResultCode::UnsupportedType => "unsupported object type",
            DfuResultCode::OperationNotPermitted => "operation not permitted",
            DfuResultCode::OperationFailed => "operation failed",
            DfuResultCode::ExtendedError => "extended error",
        }
    }
}

impl std::fmt::Display for DfuResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_roundtrip() {
        for byte in 0u8..=0x0B {
            if let Some(code) = DfuResultCode::from_byte(byte) {
                assert_eq!(code as u8, byte);
            }
        }
        assert_eq!(DfuResultCode::from_byte(0x06), None);
        assert_eq!(DfuResultCode::from_byte(0xFF), None);
    }

    #[test]
    fn test_result_code_description() {
        assert_eq!(DfuResultCode::Success.description(), "success");
        assert_eq!(
            DfuResultCode::from_byte(0x05).unwrap().description(),
            "invalid object"
        );
    }
}
