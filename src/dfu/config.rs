//! Configuration constants for the STM32 DfuSe protocol.

use std::time::Duration;

use super::error::{CompatibilityError, DfuResult};

// ============================================================================
// USB Device Identifiers
// ============================================================================

/// STMicroelectronics USB Vendor ID.
pub const ST_VID: u16 = 0x0483;

/// Product ID of the STM32 system-memory bootloader in DFU mode.
pub const ST_DFU_PID: u16 = 0xDF11;

/// Interface claimed for DFU requests. The first interface carries the
/// internal flash alternate setting on STM32 bootloaders.
pub const DFU_INTERFACE: u8 = 0;

// ============================================================================
// Control Request Encoding
// ============================================================================

/// bmRequestType for host-to-device class requests addressed to an interface.
pub const REQUEST_TYPE_OUT: u8 = 0x21;

/// bmRequestType for device-to-host class requests addressed to an interface.
pub const REQUEST_TYPE_IN: u8 = 0x21 | 0x80;

/// DFU class request codes (bRequest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuRequest {
    Detach = 0x00,
    Download = 0x01,
    Upload = 0x02,
    GetStatus = 0x03,
    ClearStatus = 0x04,
    GetState = 0x05,
    Abort = 0x06,
}

impl From<DfuRequest> for u8 {
    fn from(request: DfuRequest) -> Self {
        request as u8
    }
}

/// Length of the GETSTATUS response payload.
pub const GET_STATUS_LENGTH: usize = 6;

// ============================================================================
// DfuSe Vendor Commands (sent via DNLOAD with wValue = 0)
// ============================================================================

/// Set the address pointer, followed by a little-endian u32 address.
pub const CMD_SET_ADDRESS_POINTER: u8 = 0x21;

/// Erase the whole flash array.
pub const CMD_MASS_ERASE: u8 = 0x41;

/// Remove read protection. Also mass-erases and resets the device.
pub const CMD_READ_UNPROTECT: u8 = 0x92;

/// First wValue used for data blocks. Block numbers 0 and 1 are reserved
/// for commands.
pub const DATA_BLOCK_OFFSET: u16 = 2;

// ============================================================================
// Transfer Timeouts
// ============================================================================

/// Timeout for GETSTATUS requests.
pub const STATUS_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for vendor command downloads.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(50);

/// Timeout for firmware block downloads. Zero means no timeout: the device
/// may legitimately stall the request while it programs a page.
pub const BLOCK_DOWNLOAD_TIMEOUT: Duration = Duration::ZERO;

/// Timeout for UPLOAD requests.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout for CLRSTATUS and the detach request.
pub const NO_DATA_TIMEOUT: Duration = Duration::ZERO;

// ============================================================================
// Target Memory Map (STM32F405RG)
// ============================================================================

/// Start of internal flash.
pub const INTERNAL_FLASH_START: u32 = 0x0800_0000;

/// Size of internal flash in bytes.
pub const INTERNAL_FLASH_SIZE: u32 = 0x000F_FFFF;

/// Start of the option byte region.
pub const OPTION_BYTES_START: u32 = 0x1FFF_C000;

/// Pseudo-address of the bootloader feature register.
pub const DEVICE_FEATURE_ADDRESS: u32 = 0xFFFF_0000;

/// Feature register value enabling x32 parallelism for flash operations.
pub const FAST_OPERATIONS_VALUE: u8 = 0x03;

/// Value of erased flash.
pub const ERASED_BYTE: u8 = 0xFF;

/// Padding byte for the final partial block. Matches what the ST bootloader
/// expects when computing its CRC over a programmed page.
pub const BLOCK_PADDING: u8 = 0xFF;

// ============================================================================
// Retry Configuration
// ============================================================================

/// Maximum erase (or erase + rewrite) attempts before giving up on a unit.
pub const MAX_PROGRAM_RETRIES: u32 = 5;

/// Hard ceiling on consecutive status polls while waiting for dfuIDLE.
pub const MAX_STATUS_POLLS: u32 = 10_000;

/// Grace period given to the worker when the engine shuts down.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Interval between device scans while waiting for re-enumeration.
pub const DEVICE_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Timeout waiting for the bootloader to re-enumerate after a reset.
pub const REENUMERATE_TIMEOUT_MS: u64 = 10_000;

// ============================================================================
// Helper Functions
// ============================================================================

/// Transfer block size supported by a bootloader, keyed on its bcdDevice.
pub fn max_block_size(bootloader_version: u16) -> DfuResult<usize> {
    match bootloader_version {
        0x011A | 0x0200 => Ok(1024),
        0x2100 | 0x2200 => Ok(2048),
        version => Err(CompatibilityError::UnsupportedBootloader { version }.into()),
    }
}

/// Check if a VID/PID combination is an STM32 bootloader in DFU mode.
pub fn is_dfu_bootloader(vid: u16, pid: u16) -> bool {
    vid == ST_VID && pid == ST_DFU_PID
}
