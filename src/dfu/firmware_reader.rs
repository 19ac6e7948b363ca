//! DfuSe firmware file reader.
//!
//! A DfuSe file is laid out as:
//! - 11 byte prefix ("DfuSe", version, image size, target count)
//! - 274 byte target prefix ("Target", alternate setting, name, size, element count)
//! - 8 byte element header (address, length) followed by the element data
//! - 16 byte suffix (bcdDevice, PID, VID, bcdDFU, "UFD", length, CRC-32)
//!
//! Only single-target, single-element images are accepted.

use std::path::Path;

use crc::{Crc, CRC_32_ISO_HDLC};
use sha2::{Digest, Sha256};

use super::error::{DfuResult, FormatError};

/// Byte offsets inside a DfuSe file. Suffix offsets are counted back from
/// the end of the file.
pub mod layout {
    pub const SIGNATURE: &[u8] = b"DfuSe";
    pub const SIGNATURE_START: usize = 0;
    pub const VERSION: usize = 5;
    pub const SUPPORTED_VERSION: u8 = 1;

    pub const TARGET_SIGNATURE: &[u8] = b"Target";
    pub const TARGET_SIGNATURE_START: usize = 11;
    pub const ALTERNATE_SETTING: usize = 17;
    pub const TARGET_NAME_START: usize = 22;
    pub const TARGET_NAME_END: usize = 276;
    pub const TARGET_SIZE: usize = 277;
    pub const ELEMENT_COUNT: usize = 281;

    pub const ELEMENT_ADDRESS: usize = 285;
    pub const ELEMENT_LENGTH: usize = 289;
    pub const ELEMENT_DATA: usize = 293;
    pub const MIN_ELEMENT_LENGTH: u32 = 512;

    pub const SUFFIX_LENGTH: usize = 16;
    pub const SUFFIX_SIGNATURE: &[u8] = b"UFD";
    /// Distance of "UFD" from the end of the file.
    pub const SUFFIX_SIGNATURE_FROM_END: usize = 8;
    /// bLength of the suffix, from the end of the file.
    pub const SUFFIX_LENGTH_FROM_END: usize = 5;
    /// bcdDFU low and high bytes, from the end of the file.
    pub const BCD_DFU_LOW_FROM_END: usize = 10;
    pub const BCD_DFU_HIGH_FROM_END: usize = 9;
    pub const BCD_DFU: [u8; 2] = [0x1A, 0x01];
    pub const VID_HIGH_FROM_END: usize = 11;
    pub const VID_LOW_FROM_END: usize = 12;
    pub const PID_HIGH_FROM_END: usize = 13;
    pub const PID_LOW_FROM_END: usize = 14;
    pub const BOOT_HIGH_FROM_END: usize = 15;
    pub const BOOT_LOW_FROM_END: usize = 16;
    pub const CRC_FROM_END: usize = 4;

    /// Smallest file that can hold the prefix, one target, one element header
    /// and the suffix.
    pub const MIN_FILE_LENGTH: usize = ELEMENT_DATA + SUFFIX_LENGTH;
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A validated single-element DfuSe image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Target name, up to the first NUL.
    pub target_name: String,
    /// bAlternateSetting of the target.
    pub alternate_setting: u8,
    /// dwTargetSize as recorded in the target prefix.
    pub target_size: u32,
    /// Flash address the element is programmed at.
    pub element_address: u32,
    /// Element length in bytes.
    pub element_length: u32,
    /// Element data, exactly `element_length` bytes.
    pub payload: Vec<u8>,
    /// idVendor from the suffix.
    pub vendor_id: u16,
    /// idProduct from the suffix.
    pub product_id: u16,
    /// bcdDevice from the suffix (bootloader version the file targets).
    pub bootloader_version: u16,
    /// Stored CRC-32 from the suffix.
    pub file_crc: u32,
    /// Size of the whole file.
    pub file_size: usize,
}

impl FirmwareImage {
    /// Hex SHA-256 of the element data.
    pub fn sha256_hex(&self) -> String {
        let digest = Sha256::digest(&self.payload);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// First address past the element.
    pub fn end_address(&self) -> u64 {
        u64::from(self.element_address) + u64::from(self.element_length)
    }
}

/// CRC-32 of `data` as DfuSe stores it: zlib polynomial and seed, without the
/// final complement.
pub fn crc32_raw(data: &[u8]) -> u32 {
    !CRC32.checksum(data)
}

/// Read a DfuSe file from disk and validate it.
pub fn read_dfu_file<P: AsRef<Path>>(path: P) -> DfuResult<FirmwareImage> {
    let bytes = std::fs::read(path.as_ref())?;
    log::debug!(
        "Read {} bytes from {}",
        bytes.len(),
        path.as_ref().display()
    );
    parse_dfu_image(&bytes)
}

/// Validate and decode an in-memory DfuSe file.
///
/// Checks run in a fixed order and the first failing one is reported.
pub fn parse_dfu_image(bytes: &[u8]) -> DfuResult<FirmwareImage> {
    let len = bytes.len();
    if len < layout::MIN_FILE_LENGTH {
        return Err(FormatError::TooShort {
            len,
            min: layout::MIN_FILE_LENGTH,
        }
        .into());
    }

    let signature_end = layout::SIGNATURE_START + layout::SIGNATURE.len();
    if &bytes[layout::SIGNATURE_START..signature_end] != layout::SIGNATURE {
        return Err(FormatError::Signature.into());
    }

    let crc_start = len - layout::CRC_FROM_END;
    let stored = read_u32(bytes, crc_start);
    let computed = crc32_raw(&bytes[..crc_start]);
    if stored != computed {
        return Err(FormatError::CrcMismatch { stored, computed }.into());
    }

    let version = bytes[layout::VERSION];
    if version != layout::SUPPORTED_VERSION {
        return Err(FormatError::Version { found: version }.into());
    }

    let suffix_start = len - layout::SUFFIX_SIGNATURE_FROM_END;
    if &bytes[suffix_start..suffix_start + layout::SUFFIX_SIGNATURE.len()]
        != layout::SUFFIX_SIGNATURE
    {
        return Err(FormatError::Suffix.into());
    }
    if usize::from(bytes[len - layout::SUFFIX_LENGTH_FROM_END]) != layout::SUFFIX_LENGTH
        || bytes[len - layout::BCD_DFU_LOW_FROM_END] != layout::BCD_DFU[0]
        || bytes[len - layout::BCD_DFU_HIGH_FROM_END] != layout::BCD_DFU[1]
    {
        return Err(FormatError::SuffixFields.into());
    }

    let target_end = layout::TARGET_SIGNATURE_START + layout::TARGET_SIGNATURE.len();
    if &bytes[layout::TARGET_SIGNATURE_START..target_end] != layout::TARGET_SIGNATURE {
        return Err(FormatError::TargetSignature.into());
    }

    let target_name = read_target_name(bytes)?;

    let element_count = read_u32(bytes, layout::ELEMENT_COUNT);
    if element_count != 1 {
        return Err(FormatError::ElementCount {
            count: element_count,
        }
        .into());
    }

    let element_address = read_u32(bytes, layout::ELEMENT_ADDRESS);
    let element_length = read_u32(bytes, layout::ELEMENT_LENGTH);
    if element_length < layout::MIN_ELEMENT_LENGTH {
        return Err(FormatError::ElementTooSmall {
            length: element_length,
        }
        .into());
    }

    let data_end = layout::ELEMENT_DATA as u64 + u64::from(element_length);
    if data_end > (len - layout::SUFFIX_LENGTH) as u64 {
        return Err(FormatError::Truncated {
            length: element_length,
            file_size: len,
        }
        .into());
    }
    let payload = bytes[layout::ELEMENT_DATA..data_end as usize].to_vec();

    let image = FirmwareImage {
        target_name,
        alternate_setting: bytes[layout::ALTERNATE_SETTING],
        target_size: read_u32(bytes, layout::TARGET_SIZE),
        element_address,
        element_length,
        payload,
        vendor_id: read_suffix_u16(bytes, layout::VID_HIGH_FROM_END, layout::VID_LOW_FROM_END),
        product_id: read_suffix_u16(bytes, layout::PID_HIGH_FROM_END, layout::PID_LOW_FROM_END),
        bootloader_version: read_suffix_u16(
            bytes,
            layout::BOOT_HIGH_FROM_END,
            layout::BOOT_LOW_FROM_END,
        ),
        file_crc: stored,
        file_size: len,
    };

    log::info!(
        "Firmware target \"{}\": {} bytes at 0x{:08X} for {:04X}:{:04X}",
        image.target_name,
        image.element_length,
        image.element_address,
        image.vendor_id,
        image.product_id
    );

    Ok(image)
}

fn read_target_name(bytes: &[u8]) -> DfuResult<String> {
    let field = &bytes[layout::TARGET_NAME_START..layout::TARGET_NAME_END];
    if field[0] == 0 {
        return Err(FormatError::NoTargetName.into());
    }
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_suffix_u16(bytes: &[u8], high_from_end: usize, low_from_end: usize) -> u16 {
    let len = bytes.len();
    u16::from(bytes[len - high_from_end]) << 8 | u16::from(bytes[len - low_from_end])
}
