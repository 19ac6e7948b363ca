//! USB control-transfer transport layer for DFU communication.
//!
//! Provides a trait-based abstraction over control transfers,
//! enabling both real hardware and simulated bootloaders in tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use rusb::{DeviceHandle, GlobalContext};

use super::config::DFU_INTERFACE;
use super::device::{bcd_device_version, DeviceIdentity};
use super::error::{DfuError, DfuResult};

/// Trait for DFU transport operations.
///
/// Calls are synchronous and must not overlap: the device-side state machine
/// has no request framing to tell interleaved sequences apart.
#[cfg_attr(test, automock)]
pub trait DfuTransport: Send {
    /// Host-to-device control transfer.
    ///
    /// # Returns
    /// Number of bytes transferred
    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> DfuResult<usize>;

    /// Device-to-host control transfer into `buffer`.
    ///
    /// # Returns
    /// Number of bytes received
    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> DfuResult<usize>;

    /// VID/PID/bcdDevice read from the device descriptor.
    fn identity(&self) -> DfuResult<DeviceIdentity>;

    /// Release the USB connection. Used when the device is about to reset.
    fn release(&mut self) -> DfuResult<()>;
}

impl<T: DfuTransport + ?Sized> DfuTransport for Box<T> {
    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> DfuResult<usize> {
        (**self).control_out(request_type, request, value, index, data, timeout)
    }

    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> DfuResult<usize> {
        (**self).control_in(request_type, request, value, index, buffer, timeout)
    }

    fn identity(&self) -> DfuResult<DeviceIdentity> {
        (**self).identity()
    }

    fn release(&mut self) -> DfuResult<()> {
        (**self).release()
    }
}

/// Revocable handle to the one open transport.
///
/// The host replaces or clears the inner transport whenever a device appears
/// or disappears. Once cleared, every call fails with
/// [`DfuError::NotConnected`] instead of touching a stale handle.
#[derive(Clone, Default)]
pub struct SharedTransport {
    inner: Arc<Mutex<Option<Box<dyn DfuTransport>>>>,
}

impl SharedTransport {
    /// Create a handle holding `transport`.
    pub fn new<T: DfuTransport + 'static>(transport: T) -> Self {
        let shared = Self::default();
        shared.replace(Some(Box::new(transport)));
        shared
    }

    /// Swap in a new transport (or none), returning the previous one.
    pub fn replace(
        &self,
        transport: Option<Box<dyn DfuTransport>>,
    ) -> Option<Box<dyn DfuTransport>> {
        match self.inner.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, transport),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), transport),
        }
    }

    /// Drop the current transport without releasing it.
    pub fn revoke(&self) {
        self.replace(None);
    }

    /// Check whether a transport is currently attached.
    pub fn is_connected(&self) -> bool {
        self.inner
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn with<R>(&self, f: impl FnOnce(&mut dyn DfuTransport) -> DfuResult<R>) -> DfuResult<R> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| DfuError::transport("transport access", "lock poisoned"))?;
        match guard.as_mut() {
            Some(transport) => f(transport.as_mut()),
            None => Err(DfuError::NotConnected),
        }
    }
}

impl DfuTransport for SharedTransport {
    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> DfuResult<usize> {
        self.with(|t| t.control_out(request_type, request, value, index, data, timeout))
    }

    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> DfuResult<usize> {
        self.with(|t| t.control_in(request_type, request, value, index, buffer, timeout))
    }

    fn identity(&self) -> DfuResult<DeviceIdentity> {
        self.with(|t| t.identity())
    }

    fn release(&mut self) -> DfuResult<()> {
        match self.replace(None) {
            Some(mut transport) => transport.release(),
            None => Err(DfuError::NotConnected),
        }
    }
}

/// libusb transport implementation.
pub struct RusbTransport {
    handle: Option<DeviceHandle<GlobalContext>>,
    identity: DeviceIdentity,
    interface: u8,
}

impl RusbTransport {
    /// Open the first device matching `vid`/`pid` and claim its DFU interface.
    pub fn open(vid: u16, pid: u16) -> DfuResult<Self> {
        for device in rusb::devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() == vid && descriptor.product_id() == pid {
                return Self::open_device(&device);
            }
        }
        Err(DfuError::NotConnected)
    }

    /// Open a specific USB device.
    pub fn open_device(device: &rusb::Device<GlobalContext>) -> DfuResult<Self> {
        let descriptor = device.device_descriptor()?;
        let mut handle = device.open()?;

        // Not supported on every platform; claiming still works without it.
        handle.set_auto_detach_kernel_driver(true).ok();
        handle.claim_interface(DFU_INTERFACE)?;

        let identity = DeviceIdentity {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            bootloader_version: bcd_device_version(descriptor.device_version()),
        };
        log::info!(
            "Opened DFU device {:04X}:{:04X} (bootloader 0x{:04X}) on bus {} address {}",
            identity.vendor_id,
            identity.product_id,
            identity.bootloader_version,
            device.bus_number(),
            device.address()
        );

        Ok(Self {
            handle: Some(handle),
            identity,
            interface: DFU_INTERFACE,
        })
    }

    fn handle(&self) -> DfuResult<&DeviceHandle<GlobalContext>> {
        self.handle.as_ref().ok_or(DfuError::NotConnected)
    }
}

impl DfuTransport for RusbTransport {
    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> DfuResult<usize> {
        Ok(self
            .handle()?
            .write_control(request_type, request, value, index, data, timeout)?)
    }

    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> DfuResult<usize> {
        Ok(self
            .handle()?
            .read_control(request_type, request, value, index, buffer, timeout)?)
    }

    fn identity(&self) -> DfuResult<DeviceIdentity> {
        Ok(self.identity)
    }

    fn release(&mut self) -> DfuResult<()> {
        if let Some(mut handle) = self.handle.take() {
            // The device may already be resetting; a failed release is expected then.
            if let Err(e) = handle.release_interface(self.interface) {
                log::debug!("Releasing interface {} failed: {}", self.interface, e);
            }
            log::info!("USB was released");
        }
        Ok(())
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        self.release().ok();
    }
}
