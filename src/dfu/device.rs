//! Device detection for STM32 bootloaders in DFU mode.
//!
//! Detects devices by USB VID/PID through libusb.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::config::{is_dfu_bootloader, DEVICE_SCAN_INTERVAL};
use super::error::{DfuError, DfuResult};

/// VID/PID/bcdDevice of an attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice, which the ST bootloader uses for its version.
    pub bootloader_version: u16,
}

/// Information about a detected DFU device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfuDeviceInfo {
    /// USB bus number.
    pub bus: u8,
    /// Device address on the bus.
    pub address: u8,
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// bcdDevice (bootloader version).
    pub bootloader_version: u16,
    /// Product name (if readable).
    pub product_name: Option<String>,
    /// Device serial number (if readable).
    pub serial_number: Option<String>,
}

impl DfuDeviceInfo {
    /// Get a display label for this device.
    pub fn display_label(&self) -> String {
        if let Some(ref name) = self.product_name {
            format!("{} (bus {} addr {})", name, self.bus, self.address)
        } else if is_dfu_bootloader(self.vid, self.pid) {
            format!(
                "STM32 Bootloader v{:04X} (bus {} addr {})",
                self.bootloader_version, self.bus, self.address
            )
        } else {
            format!(
                "USB {:04X}:{:04X} (bus {} addr {})",
                self.vid, self.pid, self.bus, self.address
            )
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.vid,
            product_id: self.pid,
            bootloader_version: self.bootloader_version,
        }
    }
}

/// Re-pack rusb's decoded version into the raw bcdDevice word.
pub fn bcd_device_version(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

/// Find all connected devices matching `vid`/`pid`.
///
/// Devices whose strings cannot be read (usually a permissions problem) are
/// still listed, without product name or serial number.
pub fn find_dfu_devices(vid: u16, pid: u16) -> Vec<DfuDeviceInfo> {
    let mut devices = Vec::new();

    let list = match rusb::devices() {
        Ok(list) => list,
        Err(e) => {
            log::warn!("Unable to enumerate USB devices: {}", e);
            return devices;
        }
    };

    for device in list.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(_) => continue,
        };
        if descriptor.vendor_id() != vid || descriptor.product_id() != pid {
            continue;
        }

        let (product_name, serial_number) = match device.open() {
            Ok(handle) => (
                handle.read_product_string_ascii(&descriptor).ok(),
                handle.read_serial_number_string_ascii(&descriptor).ok(),
            ),
            Err(e) => {
                log::debug!(
                    "Cannot open {:04X}:{:04X} for strings: {}",
                    vid,
                    pid,
                    e
                );
                (None, None)
            }
        };

        devices.push(DfuDeviceInfo {
            bus: device.bus_number(),
            address: device.address(),
            vid,
            pid,
            bootloader_version: bcd_device_version(descriptor.device_version()),
            product_name,
            serial_number,
        });
    }

    devices
}

/// Wait for a DFU device to (re)appear.
///
/// After read protection is removed the bootloader resets and re-enumerates.
/// When `serial` is given only that unit is accepted.
///
/// # Arguments
/// * `vid` / `pid` - USB identifiers to match
/// * `serial` - Optional serial number to match
/// * `timeout_ms` - Maximum time to wait in milliseconds
pub fn wait_for_dfu_device(
    vid: u16,
    pid: u16,
    serial: Option<&str>,
    timeout_ms: u64,
) -> DfuResult<DfuDeviceInfo> {
    let timeout = Duration::from_millis(timeout_ms);
    let start = Instant::now();

    while start.elapsed() < timeout {
        if let Some(device) = find_dfu_devices(vid, pid)
            .into_iter()
            .find(|d| serial.is_none() || d.serial_number.as_deref() == serial)
        {
            log::info!("Found {} after {:?}", device.display_label(), start.elapsed());
            return Ok(device);
        }
        std::thread::sleep(DEVICE_SCAN_INTERVAL);
    }

    Err(DfuError::ReenumerateTimeout { timeout_ms })
}
