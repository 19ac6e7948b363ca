//! DFU error types for the STM32 DfuSe programmer.

use thiserror::Error;

use super::status::{DfuState, DfuStatusCode};

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Structural problems found while validating a DfuSe file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// File is too small to hold a prefix, one target, one element and a suffix.
    #[error("File too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    /// CRC over the file does not match the stored trailer.
    #[error("CRC failed: file says 0x{stored:08X}, computed 0x{computed:08X}")]
    CrcMismatch { stored: u32, computed: u32 },

    /// File does not start with "DfuSe".
    #[error("File signature error")]
    Signature,

    /// DfuSe format version is not 1.
    #[error("DFU file version must be 1, found {found}")]
    Version { found: u8 },

    /// Suffix does not carry the "UFD" signature.
    #[error("File suffix error")]
    Suffix,

    /// Suffix length or DFU spec number is wrong.
    #[error("File number error")]
    SuffixFields,

    /// Target prefix does not start with "Target".
    #[error("Target signature error")]
    TargetSignature,

    /// Target name field is empty.
    #[error("No target name exists in file")]
    NoTargetName,

    /// Only single-element images are supported.
    #[error("Image must contain exactly one element, found {count}")]
    ElementCount { count: u32 },

    /// Element is smaller than the minimum accepted size.
    #[error("Element size is too small: {length} bytes")]
    ElementTooSmall { length: u32 },

    /// Element claims more bytes than the file holds.
    #[error("Element of {length} bytes does not fit in a {file_size} byte file")]
    Truncated { length: u32, file_size: usize },
}

/// File and device do not belong together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompatibilityError {
    /// VID/PID recorded in the file differ from the connected device.
    #[error(
        "PID/VID mismatch: file {file_vid:04X}:{file_pid:04X}, device {device_vid:04X}:{device_pid:04X}"
    )]
    IdMismatch {
        file_vid: u16,
        file_pid: u16,
        device_vid: u16,
        device_pid: u16,
    },

    /// Image is not placed at the start of internal flash.
    #[error("Firmware does not start at beginning of internal flash (0x{address:08X})")]
    NotInternalFlash { address: u32 },

    /// Image runs past the end of internal flash.
    #[error("Firmware image too large for target: ends at 0x{end:08X}, limit 0x{limit:08X}")]
    ImageTooLarge { end: u64, limit: u64 },

    /// Bootloader version has no known transfer size.
    #[error("Unsupported bootloader version 0x{version:04X}")]
    UnsupportedBootloader { version: u16 },
}

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error for the settings file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// USB stack error from the rusb crate.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// DfuSe file failed validation.
    #[error("Invalid DFU file: {0}")]
    Format(#[from] FormatError),

    /// File cannot be flashed onto the connected device.
    #[error("Incompatible firmware: {0}")]
    Compatibility(#[from] CompatibilityError),

    /// No device is attached, or it was revoked mid-operation.
    #[error("No device connected")]
    NotConnected,

    /// Device did not come back after a reset.
    #[error("Device did not re-enumerate within {timeout_ms}ms")]
    ReenumerateTimeout { timeout_ms: u64 },

    /// A control transfer failed.
    #[error("USB failed during {operation}: {reason}")]
    Transport {
        operation: &'static str,
        reason: String,
    },

    /// Device returned less data than requested.
    #[error("Short transfer during {operation}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Device reported a state that does not allow the operation to proceed.
    #[error("{operation}: device in state {state} ({status})")]
    Protocol {
        operation: &'static str,
        state: DfuState,
        status: DfuStatusCode,
    },

    /// Operation needs read access but flash is read-protected.
    #[error("Device is Read-Protected...First Mass Erase")]
    ReadProtected,

    /// Device never returned to dfuIDLE.
    #[error("Device did not become idle after {polls} status polls ({operation})")]
    PollLimit { operation: &'static str, polls: u32 },

    /// Erase or write-verify loop ran out of attempts.
    #[error("Cannot {operation} successfully, REPLACE UNIT!")]
    RetryExhausted { operation: &'static str },

    /// Operation was cancelled while running or queued.
    #[error("Operation interrupted, please launch it again")]
    Interrupted,

    /// The operation needs a firmware file but none has been loaded.
    #[error("No firmware file loaded")]
    NoImageLoaded,

    /// Boot pin controller failed or is not configured.
    #[error("Boot mode control failed: {reason}")]
    BootControl { reason: String },

    /// The engine no longer accepts work.
    #[error("DFU worker has stopped")]
    WorkerStopped,
}

impl DfuError {
    /// Check if this error is retriable (the orchestrator may try again).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DfuError::Protocol { .. } | DfuError::ShortTransfer { .. } | DfuError::PollLimit { .. }
        )
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            DfuError::Io(_) => "DFU-001",
            DfuError::Json(_) => "DFU-002",
            DfuError::Usb(_) => "DFU-003",
            DfuError::Format(_) => "DFU-010",
            DfuError::Compatibility(CompatibilityError::UnsupportedBootloader { .. }) => "DFU-021",
            DfuError::Compatibility(_) => "DFU-020",
            DfuError::NotConnected => "DFU-030",
            DfuError::Transport { .. } => "DFU-031",
            DfuError::ShortTransfer { .. } => "DFU-032",
            DfuError::ReenumerateTimeout { .. } => "DFU-033",
            DfuError::Protocol { .. } => "DFU-040",
            DfuError::PollLimit { .. } => "DFU-041",
            DfuError::ReadProtected => "DFU-042",
            DfuError::RetryExhausted { .. } => "DFU-050",
            DfuError::NoImageLoaded => "DFU-060",
            DfuError::BootControl { .. } => "DFU-070",
            DfuError::WorkerStopped => "DFU-098",
            DfuError::Interrupted => "DFU-099",
        }
    }

    /// Build a transport error for a failed control transfer.
    pub(crate) fn transport(operation: &'static str, reason: impl ToString) -> Self {
        DfuError::Transport {
            operation,
            reason: reason.to_string(),
        }
    }
}
