//! Block transfers between a firmware image and device memory.
//!
//! Images are sent as `floor(len / block_size)` full blocks plus one final
//! block padded with 0xFF. Reads always request full blocks and truncate the
//! last one on copy.

use super::config::{BLOCK_PADDING, DATA_BLOCK_OFFSET};
use super::error::{CompatibilityError, DfuError, DfuResult};
use super::protocol::{DfuProtocol, PollMode};
use super::status::DfuState;
use super::transport::DfuTransport;

/// Number of transfers needed for `length` bytes.
pub fn block_count(length: usize, block_size: usize) -> usize {
    length.div_ceil(block_size)
}

/// Split `payload` into transfer blocks. The last block is padded to
/// `block_size` with 0xFF.
pub fn plan_blocks(payload: &[u8], block_size: usize) -> Vec<Vec<u8>> {
    payload
        .chunks(block_size)
        .map(|chunk| {
            let mut block = chunk.to_vec();
            block.resize(block_size, BLOCK_PADDING);
            block
        })
        .collect()
}

fn check_block_range(address: u32, length: usize, block_size: usize) -> DfuResult<()> {
    let max_blocks = usize::from(u16::MAX - DATA_BLOCK_OFFSET) + 1;
    if block_count(length, block_size) > max_blocks {
        return Err(CompatibilityError::ImageTooLarge {
            end: u64::from(address) + length as u64,
            limit: u64::from(address) + (max_blocks * block_size) as u64,
        }
        .into());
    }
    Ok(())
}

/// Program one block. Block 0 also sets the address pointer.
pub fn write_block<T: DfuTransport>(
    protocol: &mut DfuProtocol<T>,
    address: u32,
    block: &[u8],
    block_number: u16,
) -> DfuResult<()> {
    protocol.drain_to_idle(PollMode::Immediate)?;

    if block_number == 0 {
        let status = protocol.select_address(address)?;
        if status.is_error() {
            return Err(DfuError::Protocol {
                operation: "Start address not supported",
                state: status.state,
                status: status.status,
            });
        }
    }

    protocol.drain_to_idle(PollMode::Immediate)?;

    protocol.download_block(block, block_number)?;
    let status = protocol.get_status()?;
    if status.state != DfuState::DownloadBusy {
        return Err(DfuError::Protocol {
            operation: "Error when downloading, was not busy",
            state: status.state,
            status: status.status,
        });
    }
    let status = protocol.get_status()?;
    if status.is_error() {
        return Err(DfuError::Protocol {
            operation: "Error when downloading, did not perform action",
            state: status.state,
            status: status.status,
        });
    }

    protocol.settle(status, PollMode::Immediate)?;
    Ok(())
}

/// Write `payload` starting at `address`.
///
/// `on_progress` receives (bytes sent, total bytes) after each block.
pub fn write_image<T, F>(
    protocol: &mut DfuProtocol<T>,
    address: u32,
    payload: &[u8],
    block_size: usize,
    mut on_progress: F,
) -> DfuResult<()>
where
    T: DfuTransport,
    F: FnMut(usize, usize),
{
    check_block_range(address, payload.len(), block_size)?;

    let total = payload.len();
    for (index, block) in plan_blocks(payload, block_size).iter().enumerate() {
        // Range checked above
        let block_number = index as u16;
        write_block(protocol, address, block, block_number)?;
        on_progress(((index + 1) * block_size).min(total), total);
    }

    log::info!(
        "Wrote {} bytes at 0x{:08X} in blocks of {}",
        total,
        address,
        block_size
    );
    Ok(())
}

/// Read `length` bytes starting at `address`.
///
/// `on_progress` receives (bytes read, total bytes) after each block.
pub fn read_image<T, F>(
    protocol: &mut DfuProtocol<T>,
    address: u32,
    length: usize,
    block_size: usize,
    mut on_progress: F,
) -> DfuResult<Vec<u8>>
where
    T: DfuTransport,
    F: FnMut(usize, usize),
{
    check_block_range(address, length, block_size)?;

    protocol.drain_to_idle(PollMode::Immediate)?;
    let mut status = protocol.select_address(address)?;
    if status.is_error() {
        return Err(DfuError::Protocol {
            operation: "Start address not supported",
            state: status.state,
            status: status.status,
        });
    }

    let mut image = Vec::with_capacity(length);
    let mut block = vec![0u8; block_size];
    for index in 0..block_count(length, block_size) {
        protocol.settle(status, PollMode::Immediate)?;
        protocol.upload(&mut block, index as u16)?;
        status = protocol.get_status()?;

        let take = (length - image.len()).min(block_size);
        image.extend_from_slice(&block[..take]);
        on_progress(image.len(), length);
    }

    Ok(image)
}
