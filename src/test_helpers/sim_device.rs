use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::dfu::config::{
    DfuRequest, CMD_MASS_ERASE, CMD_READ_UNPROTECT, CMD_SET_ADDRESS_POINTER,
    DATA_BLOCK_OFFSET, DEVICE_FEATURE_ADDRESS, INTERNAL_FLASH_SIZE, INTERNAL_FLASH_START,
    OPTION_BYTES_START,
};
use crate::dfu::device::DeviceIdentity;
use crate::dfu::error::{DfuError, DfuResult};
use crate::dfu::status::{DfuState, DfuStatus, DfuStatusCode};
use crate::dfu::transport::DfuTransport;

/// One request seen by the simulated bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Download { value: u16, data: Vec<u8> },
    Upload { value: u16, length: usize },
    GetStatus,
    ClearStatus,
}

#[derive(Debug, Clone)]
enum Pending {
    Command(Vec<u8>),
    Block { value: u16, data: Vec<u8> },
    Leave,
}

struct SimState {
    flash: Vec<u8>,
    state: DfuState,
    status: DfuStatusCode,
    poll_timeout_ms: u32,
    address_pointer: u32,
    pending: Option<Pending>,
    /// Outcome of the executed request, reported by the next GETSTATUS.
    result: Option<DfuStatusCode>,
    identity: DeviceIdentity,
    protected: bool,
    erase_works: bool,
    erase_fails: bool,
    corrupt_writes: u32,
    failed_writes: u32,
    feature_register: [u8; 4],
    option_bytes: Option<u16>,
    disconnect_on_leave: bool,
    disconnected: bool,
    released: bool,
    erase_count: u32,
    unprotect_count: u32,
    log: Vec<Transfer>,
}

/// In-memory STM32 DfuSe bootloader implementing [`DfuTransport`].
///
/// Requests are executed on the first GETSTATUS after a DNLOAD (reported as
/// dfuDNBUSY); the second GETSTATUS reports the result as dfuDNLOAD-IDLE or
/// dfuERROR. Clones share the same device.
#[derive(Clone)]
pub struct SimulatedBootloader {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedBootloader {
    /// Blank, unprotected device with bootloader version 0x2200.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                flash: vec![0xFF; INTERNAL_FLASH_SIZE as usize + 1],
                state: DfuState::DfuIdle,
                status: DfuStatusCode::Ok,
                poll_timeout_ms: 0,
                address_pointer: INTERNAL_FLASH_START,
                pending: None,
                result: None,
                identity: DeviceIdentity {
                    vendor_id: 0x0483,
                    product_id: 0xDF11,
                    bootloader_version: 0x2200,
                },
                protected: false,
                erase_works: true,
                erase_fails: false,
                corrupt_writes: 0,
                failed_writes: 0,
                feature_register: [0x00, 0x00, 0x00, 0x00],
                option_bytes: None,
                disconnect_on_leave: false,
                disconnected: false,
                released: false,
                erase_count: 0,
                unprotect_count: 0,
                log: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().expect("simulator lock poisoned")
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    pub fn set_identity(&self, identity: DeviceIdentity) {
        self.state().identity = identity;
    }

    pub fn set_protected(&self, protected: bool) {
        self.state().protected = protected;
    }

    /// When false, mass erase is acknowledged but leaves flash untouched.
    pub fn set_erase_works(&self, works: bool) {
        self.state().erase_works = works;
    }

    /// When true, mass erase reports errERASE.
    pub fn set_erase_fails(&self, fails: bool) {
        self.state().erase_fails = fails;
    }

    /// Reject the next `count` block downloads with errWRITE.
    pub fn fail_next_writes(&self, count: u32) {
        self.state().failed_writes = count;
    }

    /// Flip a bit in the next `count` programmed blocks.
    pub fn corrupt_next_writes(&self, count: u32) {
        self.state().corrupt_writes = count;
    }

    pub fn set_disconnect_on_leave(&self, disconnect: bool) {
        self.state().disconnect_on_leave = disconnect;
    }

    pub fn set_feature_register(&self, value: [u8; 4]) {
        self.state().feature_register = value;
    }

    /// Delay the device asks for between erase status polls.
    pub fn set_erase_poll_timeout(&self, ms: u32) {
        self.state().poll_timeout_ms = ms;
    }

    pub fn fill_flash(&self, address: u32, data: &[u8]) {
        let offset = (address - INTERNAL_FLASH_START) as usize;
        self.state().flash[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn disconnect(&self) {
        self.state().disconnected = true;
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn flash(&self, address: u32, length: usize) -> Vec<u8> {
        let offset = (address - INTERNAL_FLASH_START) as usize;
        self.state().flash[offset..offset + length].to_vec()
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.state().log.clone()
    }

    pub fn transfer_count(&self) -> usize {
        self.state().log.len()
    }

    /// wValue of every data block download, in order.
    pub fn block_downloads(&self) -> Vec<u16> {
        self.transfers()
            .into_iter()
            .filter_map(|t| match t {
                Transfer::Download { value, .. } if value >= DATA_BLOCK_OFFSET => Some(value),
                _ => None,
            })
            .collect()
    }

    /// Addresses passed to the set-address-pointer command, in order.
    pub fn address_pointer_sets(&self) -> Vec<u32> {
        self.transfers()
            .into_iter()
            .filter_map(|t| match t {
                Transfer::Download { value: 0, data }
                    if data.len() == 5 && data[0] == CMD_SET_ADDRESS_POINTER =>
                {
                    Some(u32::from_le_bytes([data[1], data[2], data[3], data[4]]))
                }
                _ => None,
            })
            .collect()
    }

    /// (wValue, length) of every upload, in order.
    pub fn uploads(&self) -> Vec<(u16, usize)> {
        self.transfers()
            .into_iter()
            .filter_map(|t| match t {
                Transfer::Upload { value, length } => Some((value, length)),
                _ => None,
            })
            .collect()
    }

    pub fn erase_count(&self) -> u32 {
        self.state().erase_count
    }

    pub fn unprotect_count(&self) -> u32 {
        self.state().unprotect_count
    }

    pub fn option_bytes(&self) -> Option<u16> {
        self.state().option_bytes
    }

    pub fn feature_register(&self) -> [u8; 4] {
        self.state().feature_register
    }

    pub fn released(&self) -> bool {
        self.state().released
    }

    pub fn current_state(&self) -> DfuState {
        self.state().state
    }
}

impl Default for SimulatedBootloader {
    fn default() -> Self {
        Self::new()
    }
}

fn no_device() -> DfuError {
    DfuError::Usb(rusb::Error::NoDevice)
}

fn stall(sim: &mut SimState) -> DfuError {
    sim.state = DfuState::Error;
    sim.status = DfuStatusCode::ErrStalledPkt;
    DfuError::Usb(rusb::Error::Pipe)
}

fn flash_offset(address: u32, length: usize) -> Option<usize> {
    let offset = address.checked_sub(INTERNAL_FLASH_START)? as usize;
    if offset + length <= INTERNAL_FLASH_SIZE as usize + 1 {
        Some(offset)
    } else {
        None
    }
}

impl SimState {
    fn execute(&mut self, pending: Pending) -> DfuStatusCode {
        match pending {
            Pending::Command(data) => self.execute_command(&data),
            Pending::Block { value, data } => self.execute_block(value, &data),
            Pending::Leave => DfuStatusCode::Ok,
        }
    }

    fn execute_command(&mut self, data: &[u8]) -> DfuStatusCode {
        match data {
            [CMD_SET_ADDRESS_POINTER, a0, a1, a2, a3] => {
                let address = u32::from_le_bytes([*a0, *a1, *a2, *a3]);
                if self.protected {
                    return DfuStatusCode::ErrVendor;
                }
                let valid = flash_offset(address, 0).is_some()
                    || address == OPTION_BYTES_START
                    || address == DEVICE_FEATURE_ADDRESS;
                if !valid {
                    return DfuStatusCode::ErrTarget;
                }
                self.address_pointer = address;
                DfuStatusCode::Ok
            }
            [CMD_MASS_ERASE] => {
                self.erase_count += 1;
                if self.protected {
                    return DfuStatusCode::ErrVendor;
                }
                if self.erase_fails {
                    return DfuStatusCode::ErrErase;
                }
                if self.erase_works {
                    self.flash.fill(0xFF);
                }
                DfuStatusCode::Ok
            }
            [CMD_READ_UNPROTECT] => {
                self.unprotect_count += 1;
                self.protected = false;
                self.flash.fill(0xFF);
                DfuStatusCode::Ok
            }
            _ => DfuStatusCode::ErrTarget,
        }
    }

    fn execute_block(&mut self, value: u16, data: &[u8]) -> DfuStatusCode {
        if self.protected {
            return DfuStatusCode::ErrVendor;
        }
        if self.address_pointer == DEVICE_FEATURE_ADDRESS {
            let len = data.len().min(4);
            self.feature_register[..len].copy_from_slice(&data[..len]);
            return DfuStatusCode::Ok;
        }

        let block = usize::from(value - DATA_BLOCK_OFFSET);
        let address = self.address_pointer as usize + block * data.len();
        let offset = match u32::try_from(address)
            .ok()
            .and_then(|a| flash_offset(a, data.len()))
        {
            Some(offset) => offset,
            None => return DfuStatusCode::ErrAddress,
        };

        if self.failed_writes > 0 {
            self.failed_writes -= 1;
            return DfuStatusCode::ErrWrite;
        }

        let corrupt = self.corrupt_writes > 0;
        if corrupt {
            self.corrupt_writes -= 1;
        }
        // Programming can only clear bits
        for (i, byte) in data.iter().enumerate() {
            self.flash[offset + i] &= *byte;
        }
        if corrupt {
            self.flash[offset] ^= 0x01;
        }
        DfuStatusCode::Ok
    }

    fn status(&self) -> DfuStatus {
        DfuStatus {
            status: self.status,
            state: self.state,
            poll_timeout_ms: self.poll_timeout_ms,
        }
    }

    fn get_status(&mut self) -> DfuResult<DfuStatus> {
        match self.state {
            DfuState::DownloadSync => {
                let pending = self.pending.take();
                match pending {
                    Some(Pending::Leave) => {
                        self.state = DfuState::Manifest;
                        if self.disconnect_on_leave {
                            let status = self.status();
                            self.disconnected = true;
                            return Ok(status);
                        }
                    }
                    Some(Pending::Command(ref data))
                        if data.len() == 2 && self.address_pointer == OPTION_BYTES_START =>
                    {
                        // Option byte reload resets the device before it answers
                        self.option_bytes = Some(u16::from_le_bytes([data[0], data[1]]));
                        self.disconnected = true;
                        return Err(no_device());
                    }
                    Some(Pending::Command(ref data)) if data == &[CMD_READ_UNPROTECT] => {
                        self.execute(Pending::Command(data.clone()));
                        self.state = DfuState::DownloadBusy;
                        let status = self.status();
                        self.disconnected = true;
                        return Ok(status);
                    }
                    Some(pending) => {
                        self.result = Some(self.execute(pending));
                        self.state = DfuState::DownloadBusy;
                    }
                    None => self.state = DfuState::DownloadBusy,
                }
            }
            DfuState::DownloadBusy => {
                match self.result.take().unwrap_or(DfuStatusCode::Ok) {
                    DfuStatusCode::Ok => {
                        self.state = DfuState::DownloadIdle;
                        self.status = DfuStatusCode::Ok;
                    }
                    code => {
                        self.state = DfuState::Error;
                        self.status = code;
                    }
                }
            }
            _ => {}
        }
        Ok(self.status())
    }
}

impl DfuTransport for SimulatedBootloader {
    fn control_out(
        &mut self,
        _request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> DfuResult<usize> {
        let mut sim = self.state();
        if sim.disconnected {
            return Err(no_device());
        }

        if request == u8::from(DfuRequest::ClearStatus) {
            sim.log.push(Transfer::ClearStatus);
            sim.state = DfuState::DfuIdle;
            sim.status = DfuStatusCode::Ok;
            sim.pending = None;
            sim.result = None;
            return Ok(0);
        }

        if request != u8::from(DfuRequest::Download) {
            return Err(stall(&mut sim));
        }

        sim.log.push(Transfer::Download {
            value,
            data: data.to_vec(),
        });
        if !matches!(sim.state, DfuState::DfuIdle | DfuState::DownloadIdle) {
            return Err(stall(&mut sim));
        }

        let pending = if value == 0 && data.is_empty() {
            Pending::Leave
        } else if value == 0 {
            Pending::Command(data.to_vec())
        } else if value >= DATA_BLOCK_OFFSET {
            Pending::Block {
                value,
                data: data.to_vec(),
            }
        } else {
            return Err(stall(&mut sim));
        };
        sim.pending = Some(pending);
        sim.state = DfuState::DownloadSync;
        Ok(data.len())
    }

    fn control_in(
        &mut self,
        _request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> DfuResult<usize> {
        let mut sim = self.state();
        if sim.disconnected {
            return Err(no_device());
        }

        if request == u8::from(DfuRequest::GetStatus) {
            sim.log.push(Transfer::GetStatus);
            let status = sim.get_status()?;
            let bytes = status.to_bytes();
            let len = bytes.len().min(buffer.len());
            buffer[..len].copy_from_slice(&bytes[..len]);
            return Ok(len);
        }

        if request != u8::from(DfuRequest::Upload) {
            return Err(stall(&mut sim));
        }

        sim.log.push(Transfer::Upload {
            value,
            length: buffer.len(),
        });
        if sim.protected
            || value < DATA_BLOCK_OFFSET
            || !matches!(sim.state, DfuState::DfuIdle | DfuState::UploadIdle)
        {
            return Err(stall(&mut sim));
        }

        if sim.address_pointer == DEVICE_FEATURE_ADDRESS {
            let len = buffer.len().min(4);
            buffer[..len].copy_from_slice(&sim.feature_register[..len]);
            sim.state = DfuState::UploadIdle;
            return Ok(len);
        }

        let block = usize::from(value - DATA_BLOCK_OFFSET);
        let start = match flash_offset(sim.address_pointer, 0) {
            Some(offset) => (offset + block * buffer.len()).min(sim.flash.len()),
            None => return Err(stall(&mut sim)),
        };
        let available = sim.flash.len() - start;
        let len = buffer.len().min(available);
        buffer[..len].copy_from_slice(&sim.flash[start..start + len]);
        sim.state = DfuState::UploadIdle;
        Ok(len)
    }

    fn identity(&self) -> DfuResult<DeviceIdentity> {
        Ok(self.state().identity)
    }

    fn release(&mut self) -> DfuResult<()> {
        let mut sim = self.state();
        sim.released = true;
        sim.disconnected = true;
        Ok(())
    }
}
