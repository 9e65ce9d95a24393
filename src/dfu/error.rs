//! Error types for the Secure DFU implementation.

// Some variants and helpers are part of the error API surface without a
// caller in every build configuration.
#![allow(dead_code)]

use thiserror::Error;
use uuid::Uuid;

use super::config::DfuResultCode;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors that can occur during a firmware upgrade.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Serial port error from the serialport crate.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// BLE stack error from the btleplug crate.
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON parsing error for manifest.json.
    #[error("manifest error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid escape sequence in a serial control frame.
    #[error("invalid escape sequence in serial frame")]
    InvalidEscape,

    /// A control frame grew past any plausible response size.
    #[error("serial frame exceeds {max} bytes")]
    FrameTooLong { max: usize },

    /// Too many malformed frames on the control channel.
    #[error("giving up after {count} malformed control frames")]
    FramingLimit { count: u32 },

    /// No response within the deadline.
    #[error("timed out waiting for a response")]
    Timeout,

    /// The response stream no longer matches the request stream.
    #[error("protocol desync: {reason}")]
    ProtocolDesync { reason: String },

    /// The bootloader rejected a request.
    #[error("target rejected request {opcode:#04x}: {code}{}", extended_suffix(.extended))]
    Target {
        opcode: u8,
        code: DfuResultCode,
        extended: Option<u8>,
    },

    /// An object kept failing its CRC check after transfer.
    #[error(
        "object CRC mismatch after {attempts} attempts: expected {expected:#010x}, target reports {actual:#010x}"
    )]
    CrcMismatch {
        attempts: u8,
        expected: u32,
        actual: u32,
    },

    /// Required file missing from the firmware package.
    #[error("missing file in package: {filename}")]
    MissingFile { filename: String },

    /// Manifest parsed but does not describe an application image.
    #[error("invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// A package member exists but contains no data.
    #[error("empty member in package: {filename}")]
    EmptyMember { filename: String },

    /// No usable Bluetooth adapter on this host.
    #[error("no usable Bluetooth adapter ({name})")]
    NoAdapter { name: String },

    /// The BLE address could not be parsed.
    #[error("invalid BLE address '{address}'")]
    InvalidAddress { address: String },

    /// The target never showed up during scanning.
    #[error("no DFU target at {address}")]
    TargetNotFound { address: String },

    /// A required GATT characteristic is absent.
    #[error("characteristic {uuid} not found on target")]
    CharacteristicNotFound { uuid: Uuid },

    /// The transport went away while a response was pending.
    #[error("transport closed while waiting for a response")]
    Cancelled,
}

fn extended_suffix(extended: &Option<u8>) -> String {
    match extended {
        Some(code) => format!(" (extended code {code:#04x})"),
        None => String::new(),
    }
}

impl DfuError {
    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DfuError::Timeout | DfuError::CrcMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retriable() {
        assert!(DfuError::Timeout.is_retriable());
        assert!(DfuError::CrcMismatch {
            attempts: 3,
            expected: 0x1234_5678,
            actual: 0x8765_4321,
        }
        .is_retriable());
        assert!(!DfuError::Cancelled.is_retriable());
        assert!(!DfuError::InvalidEscape.is_retriable());
    }

    #[test]
    fn test_target_error_display() {
        let plain = DfuError::Target {
            opcode: 0x01,
            code: DfuResultCode::InvalidObject,
            extended: None,
        };
        assert_eq!(
            plain.to_string(),
            "target rejected request 0x01: invalid object"
        );

        let extended = DfuError::Target {
            opcode: 0x04,
            code: DfuResultCode::ExtendedError,
            extended: Some(0x07),
        };
        assert!(extended.to_string().ends_with("(extended code 0x07)"));
    }
}
