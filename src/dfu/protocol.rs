//! DfuSe request primitives and the status polling state machine.
//!
//! Every DfuSe operation is a sequence of:
//! 1. A DNLOAD or UPLOAD request (vendor command or data block)
//! 2. GETSTATUS polls to move the device through dfuDNLOAD-SYNC / dfuDNBUSY
//! 3. CLRSTATUS + GETSTATUS until the device is back in dfuIDLE
//!
//! Polling is bounded and observes a shared cancel flag so that a device
//! stuck in a non-idle state cannot hang the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::config::{
    DfuRequest, BLOCK_DOWNLOAD_TIMEOUT, CMD_MASS_ERASE, CMD_READ_UNPROTECT,
    CMD_SET_ADDRESS_POINTER, COMMAND_TIMEOUT, DATA_BLOCK_OFFSET, DFU_INTERFACE,
    GET_STATUS_LENGTH, MAX_STATUS_POLLS, NO_DATA_TIMEOUT, REQUEST_TYPE_IN, REQUEST_TYPE_OUT,
    STATUS_TIMEOUT, UPLOAD_TIMEOUT,
};
use super::device::DeviceIdentity;
use super::error::{DfuError, DfuResult};
use super::status::{DfuState, DfuStatus};
use super::transport::DfuTransport;

/// How to pace consecutive status polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Poll back to back. Used for block transfers and commands that
    /// complete within the status round trip.
    Immediate,
    /// Sleep for the device's bwPollTimeout between polls. Used for erase.
    DeviceTimeout,
}

/// Wraps rusb failures with the name of the request that failed.
fn during(operation: &'static str) -> impl Fn(DfuError) -> DfuError {
    move |err| match err {
        DfuError::Usb(e) => DfuError::transport(operation, e),
        other => other,
    }
}

/// DfuSe protocol handler over a control-transfer transport.
pub struct DfuProtocol<T: DfuTransport> {
    transport: T,
    cancel: Arc<AtomicBool>,
    max_polls: u32,
}

impl<T: DfuTransport> DfuProtocol<T> {
    /// Create a protocol handler with its own cancel flag.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            cancel: Arc::new(AtomicBool::new(false)),
            max_polls: MAX_STATUS_POLLS,
        }
    }

    /// Share a cancel flag with the caller.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the status poll ceiling.
    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls.max(1);
        self
    }

    /// Identity of the attached device.
    pub fn identity(&self) -> DfuResult<DeviceIdentity> {
        self.transport.identity()
    }

    /// Release the USB connection ahead of a device reset.
    pub fn release(&mut self) -> DfuResult<()> {
        self.transport.release()
    }

    fn check_cancelled(&self) -> DfuResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(DfuError::Interrupted)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Request primitives
    // ------------------------------------------------------------------------

    /// Issue DFU_GETSTATUS.
    pub fn get_status(&mut self) -> DfuResult<DfuStatus> {
        let mut buffer = [0u8; GET_STATUS_LENGTH];
        let received = self
            .transport
            .control_in(
                REQUEST_TYPE_IN,
                DfuRequest::GetStatus.into(),
                0,
                u16::from(DFU_INTERFACE),
                &mut buffer,
                STATUS_TIMEOUT,
            )
            .map_err(during("get status"))?;
        if received < GET_STATUS_LENGTH {
            return Err(DfuError::ShortTransfer {
                operation: "get status",
                expected: GET_STATUS_LENGTH,
                actual: received,
            });
        }

        let status = DfuStatus::parse(&buffer);
        log::debug!(
            "GETSTATUS: state={} status={} poll={}ms",
            status.state,
            status.status,
            status.poll_timeout_ms
        );
        Ok(status)
    }

    /// Issue DFU_CLRSTATUS.
    pub fn clear_status(&mut self) -> DfuResult<()> {
        self.transport
            .control_out(
                REQUEST_TYPE_OUT,
                DfuRequest::ClearStatus.into(),
                0,
                u16::from(DFU_INTERFACE),
                &[],
                NO_DATA_TIMEOUT,
            )
            .map_err(during("clear status"))?;
        Ok(())
    }

    /// Send a DfuSe vendor command (DNLOAD with wValue 0).
    pub fn download_command(&mut self, data: &[u8], operation: &'static str) -> DfuResult<()> {
        log::debug!("DNLOAD command {:02X?} ({})", data, operation);
        let sent = self
            .transport
            .control_out(
                REQUEST_TYPE_OUT,
                DfuRequest::Download.into(),
                0,
                u16::from(DFU_INTERFACE),
                data,
                COMMAND_TIMEOUT,
            )
            .map_err(during(operation))?;
        if sent < data.len() {
            return Err(DfuError::ShortTransfer {
                operation,
                expected: data.len(),
                actual: sent,
            });
        }
        Ok(())
    }

    /// Point subsequent block transfers at `address`.
    pub fn set_address_pointer(&mut self, address: u32) -> DfuResult<()> {
        let a = address.to_le_bytes();
        self.download_command(
            &[CMD_SET_ADDRESS_POINTER, a[0], a[1], a[2], a[3]],
            "set address pointer",
        )
    }

    pub fn mass_erase_command(&mut self) -> DfuResult<()> {
        self.download_command(&[CMD_MASS_ERASE], "mass erase")
    }

    pub fn unprotect_command(&mut self) -> DfuResult<()> {
        self.download_command(&[CMD_READ_UNPROTECT], "read unprotect")
    }

    /// Download a data block. The wire block number is `block + 2`.
    pub fn download_block(&mut self, data: &[u8], block: u16) -> DfuResult<()> {
        let value = block.wrapping_add(DATA_BLOCK_OFFSET);
        log::debug!("DNLOAD block {} ({} bytes)", value, data.len());
        let sent = self
            .transport
            .control_out(
                REQUEST_TYPE_OUT,
                DfuRequest::Download.into(),
                value,
                u16::from(DFU_INTERFACE),
                data,
                BLOCK_DOWNLOAD_TIMEOUT,
            )
            .map_err(during("download block"))?;
        if sent < data.len() {
            return Err(DfuError::ShortTransfer {
                operation: "download block",
                expected: data.len(),
                actual: sent,
            });
        }
        Ok(())
    }

    /// Upload a data block into `buffer`, which must be filled completely.
    pub fn upload(&mut self, buffer: &mut [u8], block: u16) -> DfuResult<()> {
        let value = block.wrapping_add(DATA_BLOCK_OFFSET);
        let expected = buffer.len();
        let received = self
            .transport
            .control_in(
                REQUEST_TYPE_IN,
                DfuRequest::Upload.into(),
                value,
                u16::from(DFU_INTERFACE),
                buffer,
                UPLOAD_TIMEOUT,
            )
            .map_err(during("upload"))?;
        if received < expected {
            return Err(DfuError::ShortTransfer {
                operation: "upload",
                expected,
                actual: received,
            });
        }
        log::debug!("UPLOAD block {} ({} bytes)", value, received);
        Ok(())
    }

    /// Zero-length DNLOAD: asks the bootloader to leave DFU mode and jump to
    /// the address last set with [`set_address_pointer`](Self::set_address_pointer).
    pub fn detach_request(&mut self) -> DfuResult<()> {
        self.transport
            .control_out(
                REQUEST_TYPE_OUT,
                DfuRequest::Download.into(),
                0,
                u16::from(DFU_INTERFACE),
                &[],
                NO_DATA_TIMEOUT,
            )
            .map_err(during("leave DFU mode"))?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Composite sequences
    // ------------------------------------------------------------------------

    /// Set the address pointer and read the status twice: once to trigger
    /// execution, once for the result.
    pub fn select_address(&mut self, address: u32) -> DfuResult<DfuStatus> {
        self.set_address_pointer(address)?;
        self.get_status()?;
        self.get_status()
    }

    /// CLRSTATUS + GETSTATUS at least once, until the device reports dfuIDLE.
    pub fn drain_to_idle(&mut self, mode: PollMode) -> DfuResult<DfuStatus> {
        let mut polls = 0;
        loop {
            self.check_cancelled()?;
            if polls >= self.max_polls {
                return Err(DfuError::PollLimit {
                    operation: "drain to idle",
                    polls,
                });
            }
            polls += 1;

            self.clear_status()?;
            let status = self.get_status()?;
            if status.is_idle() {
                return Ok(status);
            }
            pause(mode, &status);
        }
    }

    /// Keep reading the status while the device reports dfuDNBUSY and return
    /// the first status that is not busy.
    pub fn poll_while_busy(&mut self, status: DfuStatus, mode: PollMode) -> DfuResult<DfuStatus> {
        let mut status = status;
        let mut polls = 0;
        while status.state == DfuState::DownloadBusy {
            self.check_cancelled()?;
            if polls >= self.max_polls {
                return Err(DfuError::PollLimit {
                    operation: "wait while busy",
                    polls,
                });
            }
            polls += 1;

            pause(mode, &status);
            status = self.get_status()?;
        }
        Ok(status)
    }

    /// Continue from an already-read status until the device reports dfuIDLE.
    /// Issues no requests if `status` is already idle.
    pub fn settle(&mut self, status: DfuStatus, mode: PollMode) -> DfuResult<DfuStatus> {
        let mut status = status;
        let mut polls = 0;
        while !status.is_idle() {
            self.check_cancelled()?;
            if polls >= self.max_polls {
                return Err(DfuError::PollLimit {
                    operation: "settle to idle",
                    polls,
                });
            }
            polls += 1;

            pause(mode, &status);
            self.clear_status()?;
            status = self.get_status()?;
        }
        Ok(status)
    }
}

fn pause(mode: PollMode, status: &DfuStatus) {
    if mode == PollMode::DeviceTimeout && status.poll_timeout_ms > 0 {
        std::thread::sleep(Duration::from_millis(u64::from(status.poll_timeout_ms)));
    }
}
