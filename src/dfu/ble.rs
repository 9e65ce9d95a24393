//! BLE GATT transport for the Secure DFU service.
//!
//! Control requests go to the control point characteristic (write +
//! notify), data chunks to the data characteristic (write without
//! response). Notifications from the control point are forwarded into a
//! channel the blocking `read_control` waits on; the channel is drained
//! before every request so a response can never be matched to an earlier
//! exchange.
//!
//! Targets still running their application are rebooted into the
//! bootloader through the Buttonless DFU characteristic, after which the
//! bootloader advertises with the most-significant address octet
//! incremented by one.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Runtime;
use uuid::Uuid;

use super::config::{
    BLE_ATT_MARGIN, BLE_DEFAULT_MTU, BOOTLOADER_SCAN_TIMEOUT, DFU_BUTTONLESS_UUID,
    DFU_CONTROL_UUID, DFU_DATA_UUID, DFU_SERVICE_UUID, SCAN_TIMEOUT,
};
use super::error::{DfuError, DfuResult};
use super::transport::DfuTransport;

/// BLE address type of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AddressType {
    Public,
    Random,
}

/// Connection options for a BLE target.
#[derive(Debug, Clone)]
pub struct BleOptions {
    /// Target address, `AA:BB:CC:DD:EE:FF`.
    pub address: String,
    pub address_type: AddressType,
    /// Host adapter, e.g. `hci0`.
    pub adapter: String,
}

/// GATT transport over the DFU control and data characteristics.
pub struct BleTransport {
    runtime: Runtime,
    peripheral: Peripheral,
    control: Characteristic,
    data: Characteristic,
    notifications: mpsc::Receiver<Vec<u8>>,
}

impl BleTransport {
    /// Connect to the DFU target described by `options`.
    ///
    /// If the target is still running its application (no DFU control
    /// point, but a Buttonless characteristic), it is rebooted into the
    /// bootloader first and the connection moves to the bumped address.
    pub fn connect(options: &BleOptions) -> DfuResult<Self> {
        debug!(
            "connecting to {} ({:?}) via {}",
            options.address, options.address_type, options.adapter
        );
        let runtime = Runtime::new()?;

        let (adapter, peripheral) = runtime.block_on(async {
            let adapter = find_adapter(&options.adapter).await?;
            let peripheral =
                find_peripheral(&adapter, &options.address, SCAN_TIMEOUT).await?;
            peripheral.connect().await?;
            peripheral.discover_services().await?;
            Ok::<_, DfuError>((adapter, peripheral))
        })?;

        if !peripheral
            .services()
            .iter()
            .any(|service| service.uuid == DFU_SERVICE_UUID)
        {
            warn!("target does not expose the DFU service");
        }

        let peripheral = if characteristic(&peripheral, DFU_CONTROL_UUID).is_ok() {
            peripheral
        } else {
            info!("target is in application mode, requesting bootloader entry");
            let target = bootloader_address(&options.address)?;
            runtime.block_on(async {
                enter_bootloader(&peripheral).await?;
                info!("reconnecting to bootloader at {target}");
                let peripheral =
                    find_peripheral(&adapter, &target, BOOTLOADER_SCAN_TIMEOUT).await?;
                peripheral.connect().await?;
                peripheral.discover_services().await?;
                Ok::<_, DfuError>(peripheral)
            })?
        };

        let control = characteristic(&peripheral, DFU_CONTROL_UUID)?;
        let data = characteristic(&peripheral, DFU_DATA_UUID)?;

        let (tx, rx) = mpsc::channel();
        runtime.block_on(peripheral.subscribe(&control))?;
        let mut stream = runtime.block_on(peripheral.notifications())?;
        runtime.spawn(async move {
            while let Some(event) = stream.next().await {
                if event.uuid == DFU_CONTROL_UUID {
                    if tx.send(event.value).is_err() {
                        break;
                    }
                } else {
                    debug!("discarding notification from {}", event.uuid);
                }
            }
        });

        Ok(Self {
            runtime,
            peripheral,
            control,
            data,
            notifications: rx,
        })
    }
}

impl DfuTransport for BleTransport {
    fn write_control(&mut self, request: &[u8]) -> DfuResult<()> {
        // One response per request: anything still queued belongs to an
        // abandoned exchange.
        while let Ok(stale) = self.notifications.try_recv() {
            warn!("discarding stale control notification: {stale:02x?}");
        }
        self.runtime.block_on(self.peripheral.write(
            &self.control,
            request,
            WriteType::WithResponse,
        ))?;
        Ok(())
    }

    fn read_control(&mut self, timeout: Duration) -> DfuResult<Vec<u8>> {
        match self.notifications.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(DfuError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DfuError::Cancelled),
        }
    }

    fn write_data(&mut self, chunk: &[u8]) -> DfuResult<()> {
        self.runtime.block_on(self.peripheral.write(
            &self.data,
            chunk,
            WriteType::WithoutResponse,
        ))?;
        Ok(())
    }

    fn link_mtu(&self) -> Option<u16> {
        // The host stack negotiates ATT MTU on its own; assume the common
        // data-length-extended value.
        Some(BLE_DEFAULT_MTU)
    }

    fn chunk_size(&self, mtu: u16) -> usize {
        (mtu as usize).saturating_sub(BLE_ATT_MARGIN)
    }

    fn close(&mut self) {
        self.runtime.block_on(self.peripheral.disconnect()).ok();
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reboot an application-mode target into its bootloader.
///
/// Writes 0x01 to the Buttonless characteristic and waits for the
/// confirming indication before disconnecting; the target then resets and
/// comes back up as the bootloader.
async fn enter_bootloader(peripheral: &Peripheral) -> DfuResult<()> {
    let buttonless = characteristic(peripheral, DFU_BUTTONLESS_UUID)?;
    peripheral.subscribe(&buttonless).await?;
    let mut stream = peripheral.notifications().await?;

    peripheral
        .write(&buttonless, &[0x01], WriteType::WithResponse)
        .await?;

    let deadline = Instant::now() + BOOTLOADER_SCAN_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(DfuError::Timeout)?;
        let event = tokio::time::timeout(remaining, stream.next())
            .await
            .map_err(|_| DfuError::Timeout)?
            .ok_or(DfuError::Cancelled)?;

        if event.uuid != DFU_BUTTONLESS_UUID {
            debug!("discarding notification from {}", event.uuid);
            continue;
        }
        debug!("buttonless response: {:02x?}", event.value);
        match event.value.get(2) {
            Some(&0x01) => break,
            _ => {
                return Err(DfuError::ProtocolDesync {
                    reason: format!("unexpected buttonless response {:02x?}", event.value),
                })
            }
        }
    }

    peripheral.disconnect().await?;
    Ok(())
}

async fn find_adapter(name: &str) -> DfuResult<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    for adapter in &adapters {
        let info = adapter.adapter_info().await.unwrap_or_default();
        if info.contains(name) {
            return Ok(adapter.clone());
        }
    }

    match adapters.into_iter().next() {
        Some(adapter) => {
            warn!("adapter {name} not found, using the first available one");
            Ok(adapter)
        }
        None => Err(DfuError::NoAdapter {
            name: name.to_string(),
        }),
    }
}

/// Scan until a peripheral with the given address shows up.
async fn find_peripheral(
    adapter: &Adapter,
    address: &str,
    timeout: Duration,
) -> DfuResult<Peripheral> {
    adapter.start_scan(ScanFilter::default()).await?;
    let deadline = Instant::now() + timeout;

    let found = 'search: loop {
        for peripheral in adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            if properties
                .address
                .to_string()
                .eq_ignore_ascii_case(address)
            {
                break 'search Some(peripheral);
            }
        }
        if Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    adapter.stop_scan().await.ok();
    found.ok_or_else(|| DfuError::TargetNotFound {
        address: address.to_string(),
    })
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> DfuResult<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(DfuError::CharacteristicNotFound { uuid })
}

/// Address the bootloader advertises from: the application address with the
/// most-significant octet incremented by one.
fn bootloader_address(address: &str) -> DfuResult<String> {
    let mut octets = parse_address(address)?;
    octets[0] = octets[0].wrapping_add(1);
    Ok(format_address(&octets))
}

fn parse_address(address: &str) -> DfuResult<[u8; 6]> {
    let invalid = || DfuError::InvalidAddress {
        address: address.to_string(),
    };

    let mut octets = [0u8; 6];
    let mut parts = address.split(':');
    for octet in octets.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(octets)
}

fn format_address(octets: &[u8; 6]) -> String {
    octets
        .iter()
        .map(|octet| format!("{octet:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
