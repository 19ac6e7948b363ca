//! Device status as reported by DFU_GETSTATUS.

use std::fmt;

use super::config::GET_STATUS_LENGTH;

/// DFU device state (bState).
///
/// Values outside the DFU 1.1 table plus ST's upload extensions are kept
/// in `Other` so that a misbehaving device is reported, not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DownloadSync,
    DownloadBusy,
    DownloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    UploadSync,
    UploadBusy,
    Other(u8),
}

impl DfuState {
    /// Decode a bState byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => DfuState::AppIdle,
            0x01 => DfuState::AppDetach,
            0x02 => DfuState::DfuIdle,
            0x03 => DfuState::DownloadSync,
            0x04 => DfuState::DownloadBusy,
            0x05 => DfuState::DownloadIdle,
            0x06 => DfuState::ManifestSync,
            0x07 => DfuState::Manifest,
            0x08 => DfuState::ManifestWaitReset,
            0x09 => DfuState::UploadIdle,
            0x0A => DfuState::Error,
            0x91 => DfuState::UploadSync,
            0x92 => DfuState::UploadBusy,
            other => DfuState::Other(other),
        }
    }

    /// Encode back to the wire value.
    pub fn as_byte(&self) -> u8 {
        match self {
            DfuState::AppIdle => 0x00,
            DfuState::AppDetach => 0x01,
            DfuState::DfuIdle => 0x02,
            DfuState::DownloadSync => 0x03,
            DfuState::DownloadBusy => 0x04,
            DfuState::DownloadIdle => 0x05,
            DfuState::ManifestSync => 0x06,
            DfuState::Manifest => 0x07,
            DfuState::ManifestWaitReset => 0x08,
            DfuState::UploadIdle => 0x09,
            DfuState::Error => 0x0A,
            DfuState::UploadSync => 0x91,
            DfuState::UploadBusy => 0x92,
            DfuState::Other(byte) => *byte,
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::DfuIdle => write!(f, "dfuIDLE"),
            DfuState::DownloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DownloadBusy => write!(f, "dfuDNBUSY"),
            DfuState::DownloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::Manifest => write!(f, "dfuMANIFEST"),
            DfuState::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::Error => write!(f, "dfuERROR"),
            DfuState::UploadSync => write!(f, "dfuUPLOAD-SYNC"),
            DfuState::UploadBusy => write!(f, "dfuUPLOAD-BUSY"),
            DfuState::Other(byte) => write!(f, "unknown state 0x{:02X}", byte),
        }
    }
}

/// Result of the previous request (bStatus).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuStatusCode {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbReset,
    ErrPowerOnReset,
    ErrUnknown,
    ErrStalledPkt,
    Other(u8),
}

impl DfuStatusCode {
    /// Decode a bStatus byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => DfuStatusCode::Ok,
            0x01 => DfuStatusCode::ErrTarget,
            0x02 => DfuStatusCode::ErrFile,
            0x03 => DfuStatusCode::ErrWrite,
            0x04 => DfuStatusCode::ErrErase,
            0x05 => DfuStatusCode::ErrCheckErased,
            0x06 => DfuStatusCode::ErrProg,
            0x07 => DfuStatusCode::ErrVerify,
            0x08 => DfuStatusCode::ErrAddress,
            0x09 => DfuStatusCode::ErrNotDone,
            0x0A => DfuStatusCode::ErrFirmware,
            0x0B => DfuStatusCode::ErrVendor,
            0x0C => DfuStatusCode::ErrUsbReset,
            0x0D => DfuStatusCode::ErrPowerOnReset,
            0x0E => DfuStatusCode::ErrUnknown,
            0x0F => DfuStatusCode::ErrStalledPkt,
            other => DfuStatusCode::Other(other),
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            DfuStatusCode::Ok => "no error",
            DfuStatusCode::ErrTarget => "file is not targeted for this device",
            DfuStatusCode::ErrFile => "file fails a vendor verification test",
            DfuStatusCode::ErrWrite => "unable to write memory",
            DfuStatusCode::ErrErase => "memory erase failed",
            DfuStatusCode::ErrCheckErased => "memory erase check failed",
            DfuStatusCode::ErrProg => "program memory failed",
            DfuStatusCode::ErrVerify => "programmed memory failed verification",
            DfuStatusCode::ErrAddress => "address out of range",
            DfuStatusCode::ErrNotDone => "unexpected end of data",
            DfuStatusCode::ErrFirmware => "firmware is corrupt",
            DfuStatusCode::ErrVendor => "vendor specific error",
            DfuStatusCode::ErrUsbReset => "unexpected USB reset",
            DfuStatusCode::ErrPowerOnReset => "unexpected power on reset",
            DfuStatusCode::ErrUnknown => "unknown failure",
            DfuStatusCode::ErrStalledPkt => "unexpected request stalled",
            DfuStatusCode::Other(_) => "unrecognised status code",
        }
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Parsed GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    /// Outcome of the previous request.
    pub status: DfuStatusCode,
    /// Current device state.
    pub state: DfuState,
    /// Minimum wait before the next status query, in milliseconds.
    pub poll_timeout_ms: u32,
}

impl DfuStatus {
    /// Parse the 6-byte GETSTATUS payload. The trailing iString byte is ignored.
    pub fn parse(data: &[u8; GET_STATUS_LENGTH]) -> Self {
        Self {
            status: DfuStatusCode::from_byte(data[0]),
            poll_timeout_ms: u32::from_le_bytes([data[1], data[2], data[3], 0]),
            state: DfuState::from_byte(data[4]),
        }
    }

    /// Encode into a GETSTATUS payload.
    pub fn to_bytes(&self) -> [u8; GET_STATUS_LENGTH] {
        let timeout = self.poll_timeout_ms.to_le_bytes();
        [
            self.status_byte(),
            timeout[0],
            timeout[1],
            timeout[2],
            self.state.as_byte(),
            0,
        ]
    }

    pub fn is_idle(&self) -> bool {
        self.state == DfuState::DfuIdle
    }

    pub fn is_error(&self) -> bool {
        self.state == DfuState::Error
    }

    fn status_byte(&self) -> u8 {
        match self.status {
            DfuStatusCode::Ok => 0x00,
            DfuStatusCode::ErrTarget => 0x01,
            DfuStatusCode::ErrFile => 0x02,
            DfuStatusCode::ErrWrite => 0x03,
            DfuStatusCode::ErrErase => 0x04,
            DfuStatusCode::ErrCheckErased => 0x05,
            DfuStatusCode::ErrProg => 0x06,
            DfuStatusCode::ErrVerify => 0x07,
            DfuStatusCode::ErrAddress => 0x08,
            DfuStatusCode::ErrNotDone => 0x09,
            DfuStatusCode::ErrFirmware => 0x0A,
            DfuStatusCode::ErrVendor => 0x0B,
            DfuStatusCode::ErrUsbReset => 0x0C,
            DfuStatusCode::ErrPowerOnReset => 0x0D,
            DfuStatusCode::ErrUnknown => 0x0E,
            DfuStatusCode::ErrStalledPkt => 0x0F,
            DfuStatusCode::Other(byte) => byte,
        }
    }
}
