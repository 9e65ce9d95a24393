//! Secure DFU client for Nordic-style bootloaders.
//!
//! Implements the object-transfer protocol used to replace application
//! firmware on a target device, over either a SLIP-framed serial link or
//! BLE GATT.
//!
//! # Protocol Overview
//!
//! An upgrade moves two payloads from a firmware package to the target:
//!
//! 1. **Probe** - Ping the bootloader, disable receipt notifications,
//!    negotiate the data chunk size
//! 2. **Init packet** - Transferred as one or more Command objects
//! 3. **Firmware image** - Transferred as a sequence of Data objects
//!
//! Each object is created, streamed over the data channel, verified
//! against the bootloader's CRC32 and committed with Execute. Committing
//! the final Data object activates the new firmware. An interrupted
//! transfer resumes at the last offset the bootloader can vouch for.

pub mod ble;
pub mod config;
mod engine;
mod error;
mod package;
mod protocol;
mod slip;
mod transport;

#[cfg(test)]
mod testutil;

pub use ble::{BleOptions, BleTransport};
pub use engine::{DfuEngine, DfuProgress, EngineOptions};
pub use error::{DfuError, DfuResult};
pub use package::DfuPackage;
pub use transport::{DfuTransport, SerialTransport};
