//! Programming workflows built on the DfuSe protocol.
//!
//! The full workflow (`program_firmware`) is:
//! 1. Compatibility check against the connected bootloader
//! 2. Read protection check (removing it resets the device)
//! 3. Blank check, mass-erasing until flash reads back erased
//! 4. Write the image
//! 5. Verify, re-erasing and rewriting on mismatch
//! 6. Write option bytes, which resets the device into the new firmware

use std::fmt;
use std::ops::BitOr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::blocks::{read_image, write_image};
use super::config::{
    max_block_size, DEVICE_FEATURE_ADDRESS, ERASED_BYTE, FAST_OPERATIONS_VALUE,
    INTERNAL_FLASH_SIZE, INTERNAL_FLASH_START, MAX_PROGRAM_RETRIES, OPTION_BYTES_START,
};
use super::error::{CompatibilityError, DfuError, DfuResult};
use super::events::DfuEvent;
use super::firmware_reader::FirmwareImage;
use super::protocol::{DfuProtocol, PollMode};
use super::status::DfuState;
use super::transport::DfuTransport;

/// How the blank check decides that flash is erased.
///
/// The two modes differ on real hardware: erased flash reads back as all
/// 0xFF, whose legacy hash almost never equals the element length, so
/// `LegacyHash` reports nearly every device as not blank and the full
/// workflow spends its erase attempts until it gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlankCheck {
    /// Every byte reads back as 0xFF.
    #[default]
    ErasedValue,
    /// Element length equals the absolute value of the Java `ByteBuffer`
    /// hash of the read-back bytes. Kept for parity with older tooling.
    LegacyHash,
}

impl BlankCheck {
    pub fn is_blank(&self, contents: &[u8], element_length: u32) -> bool {
        match self {
            BlankCheck::ErasedValue => contents.iter().all(|&b| b == ERASED_BYTE),
            BlankCheck::LegacyHash => {
                i64::from(element_length) == i64::from(legacy_buffer_hash(contents).wrapping_abs())
            }
        }
    }
}

/// `java.nio.ByteBuffer.hashCode()` over `bytes`: elements are visited from
/// last to first as signed bytes.
pub fn legacy_buffer_hash(bytes: &[u8]) -> i32 {
    bytes
        .iter()
        .rev()
        .fold(1i32, |h, &b| h.wrapping_mul(31).wrapping_add(i32::from(b as i8)))
}

/// STM32F4 user option byte word (FLASH_OPTCR bits 15:0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionBytes(u16);

impl OptionBytes {
    /// Read protection disabled.
    pub const RDP_OFF: OptionBytes = OptionBytes(0xAA00);
    /// Read protection level 1.
    pub const RDP_LEVEL_1: OptionBytes = OptionBytes(0x3300);
    /// Software watchdog.
    pub const WDG_SW: OptionBytes = OptionBytes(0x20);
    /// No reset when entering Stop mode.
    pub const NRST_STOP: OptionBytes = OptionBytes(0x40);
    /// No reset when entering Standby mode.
    pub const NRST_STDBY: OptionBytes = OptionBytes(0x80);
    pub const BOR_LEVEL_1: OptionBytes = OptionBytes(0x08);
    pub const BOR_LEVEL_2: OptionBytes = OptionBytes(0x04);
    pub const BOR_LEVEL_3: OptionBytes = OptionBytes(0x00);
    pub const BOR_OFF: OptionBytes = OptionBytes(0x0C);

    pub const fn from_bits(bits: u16) -> Self {
        OptionBytes(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Value written at the end of a full programming run.
    pub const fn production() -> Self {
        OptionBytes(
            Self::RDP_OFF.0
                | Self::WDG_SW.0
                | Self::NRST_STOP.0
                | Self::NRST_STDBY.0
                | Self::BOR_LEVEL_1.0,
        )
    }
}

impl Default for OptionBytes {
    fn default() -> Self {
        Self::production()
    }
}

impl BitOr for OptionBytes {
    type Output = OptionBytes;

    fn bitor(self, rhs: OptionBytes) -> OptionBytes {
        OptionBytes(self.0 | rhs.0)
    }
}

impl fmt::Display for OptionBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// How a device-level workflow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The workflow ran to completion.
    Complete,
    /// Read protection was removed; the device is resetting and the
    /// workflow must be started again once it re-enumerates.
    DeviceResetting,
}

/// Retrying programming workflows over one protocol session.
pub struct Programmer<T: DfuTransport, E: Fn(DfuEvent)> {
    protocol: DfuProtocol<T>,
    events: E,
    max_retries: u32,
    blank_check: BlankCheck,
    option_bytes: OptionBytes,
}

impl<T: DfuTransport, E: Fn(DfuEvent)> Programmer<T, E> {
    pub fn new(protocol: DfuProtocol<T>, events: E) -> Self {
        Self {
            protocol,
            events,
            max_retries: MAX_PROGRAM_RETRIES,
            blank_check: BlankCheck::default(),
            option_bytes: OptionBytes::default(),
        }
    }

    /// Number of erase (or erase + rewrite) attempts before giving up.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_blank_check(mut self, blank_check: BlankCheck) -> Self {
        self.blank_check = blank_check;
        self
    }

    /// Option bytes written after a successful `program_firmware`.
    pub fn with_option_bytes(mut self, option_bytes: OptionBytes) -> Self {
        self.option_bytes = option_bytes;
        self
    }

    fn emit(&self, event: DfuEvent) {
        (self.events)(event);
    }

    // ------------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------------

    /// Check that `image` can be flashed onto the attached device.
    ///
    /// # Returns
    /// Transfer block size for the device's bootloader
    pub fn check_compatibility(&mut self, image: &FirmwareImage) -> DfuResult<usize> {
        let device = self.protocol.identity()?;

        if device.vendor_id != image.vendor_id || device.product_id != image.product_id {
            return Err(CompatibilityError::IdMismatch {
                file_vid: image.vendor_id,
                file_pid: image.product_id,
                device_vid: device.vendor_id,
                device_pid: device.product_id,
            }
            .into());
        }

        if device.bootloader_version != image.bootloader_version {
            let message = format!(
                "Device Boot Version = 0x{:x}, File Boot Version = 0x{:x}",
                device.bootloader_version, image.bootloader_version
            );
            log::warn!("{}", message);
            self.emit(DfuEvent::Warning { message });
        }

        if image.element_address != INTERNAL_FLASH_START {
            return Err(CompatibilityError::NotInternalFlash {
                address: image.element_address,
            }
            .into());
        }

        let limit = u64::from(INTERNAL_FLASH_START) + u64::from(INTERNAL_FLASH_SIZE);
        if image.end_address() >= limit {
            return Err(CompatibilityError::ImageTooLarge {
                end: image.end_address(),
                limit,
            }
            .into());
        }

        let block_size = max_block_size(device.bootloader_version)?;
        log::info!("Firmware OK and compatible, block size {}", block_size);
        Ok(block_size)
    }

    /// Check flash read protection: pointing at flash fails when it is set.
    pub fn is_protected(&mut self) -> DfuResult<bool> {
        self.protocol.drain_to_idle(PollMode::Immediate)?;
        let status = self.protocol.select_address(INTERNAL_FLASH_START)?;
        let protected = status.is_error();
        self.protocol.settle(status, PollMode::Immediate)?;
        if protected {
            log::info!("Device is read-protected");
        }
        Ok(protected)
    }

    /// Read back the image region and apply the blank predicate.
    pub fn is_blank(&mut self, image: &FirmwareImage, block_size: usize) -> DfuResult<bool> {
        let contents = read_image(
            &mut self.protocol,
            image.element_address,
            image.payload.len(),
            block_size,
            |_, _| {},
        )?;
        Ok(self.blank_check.is_blank(&contents, image.element_length))
    }

    /// Read back the image region and compare it with the payload.
    pub fn image_matches(&mut self, image: &FirmwareImage, block_size: usize) -> DfuResult<bool> {
        let start = Instant::now();
        let events = &self.events;
        let contents = read_image(
            &mut self.protocol,
            image.element_address,
            image.payload.len(),
            block_size,
            |read, total| events(DfuEvent::Verifying { read, total }),
        )?;
        let matches = contents == image.payload;
        self.emit(DfuEvent::VerifyResult {
            matches,
            elapsed_ms: start.elapsed().as_millis() as u64,
        });
        Ok(matches)
    }

    // ------------------------------------------------------------------------
    // Device commands
    // ------------------------------------------------------------------------

    /// Send the unprotect command and release the USB connection. The device
    /// mass-erases itself and resets.
    pub fn remove_read_protection(&mut self) -> DfuResult<()> {
        self.emit(DfuEvent::RemovingProtection);
        self.protocol.unprotect_command()?;
        let status = self.protocol.get_status()?;
        if status.state != DfuState::DownloadBusy {
            return Err(DfuError::Protocol {
                operation: "Failed to execute unprotect command",
                state: status.state,
                status: status.status,
            });
        }
        self.protocol.release()?;
        self.emit(DfuEvent::DeviceResetting);
        Ok(())
    }

    /// Issue a mass erase and wait for it to finish, pacing polls by the
    /// device's requested timeout.
    pub fn erase(&mut self) -> DfuResult<()> {
        self.emit(DfuEvent::Erasing);
        let start = Instant::now();

        // A preceding read leaves the device in dfuUPLOAD-IDLE
        self.protocol.drain_to_idle(PollMode::Immediate)?;
        self.protocol.mass_erase_command()?;
        // Reports dfuDNBUSY even for an invalid address or a protected device
        let status = self.protocol.get_status()?;
        let status = self.protocol.poll_while_busy(status, PollMode::DeviceTimeout)?;
        if status.is_error() {
            return Err(DfuError::Protocol {
                operation: "Mass erase failed",
                state: status.state,
                status: status.status,
            });
        }
        self.protocol.settle(status, PollMode::DeviceTimeout)?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        log::info!("Mass erase completed in {} ms", elapsed_ms);
        self.emit(DfuEvent::EraseComplete { elapsed_ms });
        Ok(())
    }

    /// Write the image with progress events.
    pub fn write(&mut self, image: &FirmwareImage, block_size: usize) -> DfuResult<()> {
        let start = Instant::now();
        let events = &self.events;
        write_image(
            &mut self.protocol,
            image.element_address,
            &image.payload,
            block_size,
            |sent, total| events(DfuEvent::Writing { sent, total }),
        )?;
        self.emit(DfuEvent::WriteComplete {
            elapsed_ms: start.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    /// Write inside the retry loop. A retriable failure counts as a bad
    /// write and is repaired by the next erase and rewrite.
    fn write_attempt(&mut self, image: &FirmwareImage, block_size: usize) -> DfuResult<bool> {
        match self.write(image, block_size) {
            Ok(()) => Ok(true),
            Err(e) if e.is_retriable() => {
                log::warn!("Write failed, retrying: {}", e);
                self.emit(DfuEvent::Warning {
                    message: format!("Write failed: {}", e),
                });
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Write the user option bytes. The device resets while handling the
    /// request, so the final status read is allowed to fail.
    pub fn write_option_bytes(&mut self, options: OptionBytes) -> DfuResult<()> {
        self.emit(DfuEvent::WritingOptionBytes {
            value: options.bits(),
        });

        self.protocol.drain_to_idle(PollMode::Immediate)?;
        let status = self.protocol.select_address(OPTION_BYTES_START)?;
        if status.is_error() {
            return Err(DfuError::Protocol {
                operation: "Option Byte Start address not supported",
                state: status.state,
                status: status.status,
            });
        }

        log::info!("Writing options: {}", options);
        self.protocol
            .download_command(&options.bits().to_le_bytes(), "write option bytes")?;
        if let Err(e) = self.protocol.get_status() {
            log::info!("Device reset after option byte write ({})", e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------------

    /// Full one-shot programming of `image`.
    pub fn program_firmware(&mut self, image: &FirmwareImage) -> DfuResult<Outcome> {
        let block_size = self.check_compatibility(image)?;

        self.emit(DfuEvent::CheckingProtection);
        if self.is_protected()? {
            self.remove_read_protection()?;
            return Ok(Outcome::DeviceResetting);
        }

        let attempts = self.max_retries + 1;
        for attempt in 1..=attempts {
            self.emit(DfuEvent::BlankCheck { attempt });
            if self.is_blank(image, block_size)? {
                break;
            }
            if attempt == attempts {
                return Err(DfuError::RetryExhausted {
                    operation: "Mass Erase",
                });
            }
            log::info!("Device not blank, erasing");
            self.erase()?;
        }

        let mut written = self.write_attempt(image, block_size)?;

        for attempt in 1..=attempts {
            if written && self.image_matches(image, block_size)? {
                self.write_option_bytes(self.option_bytes)?;
                break;
            }
            if attempt == attempts {
                return Err(DfuError::RetryExhausted { operation: "Write" });
            }
            log::info!("Verification failed, retry");
            self.erase()?;
            written = self.write_attempt(image, block_size)?;
        }

        self.emit(DfuEvent::Complete);
        Ok(Outcome::Complete)
    }

    /// Erase the device. A protected device has its protection removed
    /// instead (which erases and resets it). With an image loaded, a device
    /// that already reads back blank is left alone.
    pub fn mass_erase(&mut self, image: Option<&FirmwareImage>) -> DfuResult<Outcome> {
        if self.is_protected()? {
            self.remove_read_protection()?;
            return Ok(Outcome::DeviceResetting);
        }

        if let Some(image) = image {
            match self.check_compatibility(image) {
                Ok(block_size) => {
                    if self.is_blank(image, block_size)? {
                        log::info!("Device already blank, skipping erase");
                        self.emit(DfuEvent::Log {
                            message: "Device is already blank".into(),
                        });
                        return Ok(Outcome::Complete);
                    }
                }
                Err(e) => log::warn!("Skipping blank check: {}", e),
            }
        }

        self.erase()?;
        Ok(Outcome::Complete)
    }

    /// Compare device flash with `image`.
    pub fn verify(&mut self, image: &FirmwareImage) -> DfuResult<bool> {
        let block_size = self.check_compatibility(image)?;
        if self.is_protected()? {
            return Err(DfuError::ReadProtected);
        }
        self.image_matches(image, block_size)
    }

    /// Write `image` without erasing or verifying.
    pub fn program(&mut self, image: &FirmwareImage) -> DfuResult<()> {
        let block_size = self.check_compatibility(image)?;
        if self.is_protected()? {
            return Err(DfuError::ReadProtected);
        }
        log::info!(
            "Element of {} bytes at 0x{:08X}, blocks of {} bytes",
            image.element_length,
            image.element_address,
            block_size
        );
        self.write(image, block_size)
    }

    /// Enable x32 parallelism in the bootloader feature register.
    ///
    /// # Returns
    /// `true` if the register was changed, `false` if it was already set
    pub fn fast_operations(&mut self) -> DfuResult<bool> {
        if self.is_protected()? {
            return Err(DfuError::ReadProtected);
        }

        let mut feature = self.read_device_feature()?;
        if feature[0] == FAST_OPERATIONS_VALUE {
            self.emit(DfuEvent::FastOperations { already_set: true });
            return Ok(false);
        }

        feature[0] = FAST_OPERATIONS_VALUE;
        self.protocol.download_block(&feature, 0)?;
        self.protocol.get_status()?;
        let status = self.protocol.get_status()?;
        self.protocol.settle(status, PollMode::Immediate)?;

        self.emit(DfuEvent::FastOperations { already_set: false });
        Ok(true)
    }

    fn read_device_feature(&mut self) -> DfuResult<[u8; 4]> {
        self.protocol.drain_to_idle(PollMode::Immediate)?;
        let status = self.protocol.select_address(DEVICE_FEATURE_ADDRESS)?;
        if status.is_error() {
            return Err(DfuError::Protocol {
                operation: "Fast Operations not supported",
                state: status.state,
                status: status.status,
            });
        }
        self.protocol.settle(status, PollMode::Immediate)?;

        let mut feature = [0u8; 4];
        self.protocol.upload(&mut feature, 0)?;
        let status = self.protocol.get_status()?;
        self.protocol.settle(status, PollMode::Immediate)?;
        log::debug!("Device feature register: {:02X?}", feature);
        Ok(feature)
    }

    /// Jump to the application at the start of flash.
    ///
    /// The device usually disconnects while handling the request, so a failed
    /// status read afterwards counts as success.
    pub fn leave_dfu_mode(&mut self) -> DfuResult<bool> {
        let status = self.protocol.get_status()?;
        self.protocol.settle(status, PollMode::Immediate)?;

        self.protocol.set_address_pointer(INTERNAL_FLASH_START)?;
        let status = self.protocol.get_status()?;
        self.protocol.settle(status, PollMode::Immediate)?;

        self.protocol.detach_request()?;

        let success = match self.protocol.get_status() {
            Err(e) => {
                log::debug!("Device gone after leave request ({})", e);
                true
            }
            Ok(status) if status.state != DfuState::Manifest => false,
            Ok(_) => match self.protocol.get_status() {
                Err(e) => {
                    log::debug!("Device gone during manifestation ({})", e);
                    true
                }
                Ok(status) => !status.is_error(),
            },
        };

        self.emit(DfuEvent::LeftDfuMode { success });
        Ok(success)
    }
}
