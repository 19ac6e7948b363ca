use crate::dfu::firmware_reader::{crc32_raw, layout};

/// Builder for creating test DfuSe files.
///
/// Produces a valid single-element image by default; each setter breaks or
/// changes one field. The CRC is computed last unless `corrupt_crc` is set.
pub struct DfuFileBuilder {
    signature: [u8; 5],
    version: u8,
    target_signature: [u8; 6],
    target_name: String,
    alternate_setting: u8,
    element_count: u32,
    address: u32,
    payload: Vec<u8>,
    declared_length: Option<u32>,
    vendor_id: u16,
    product_id: u16,
    bootloader_version: u16,
    bcd_dfu: u16,
    suffix_signature: [u8; 3],
    corrupt_crc: bool,
}

impl DfuFileBuilder {
    pub fn new() -> Self {
        Self {
            signature: *b"DfuSe",
            version: 1,
            target_signature: *b"Target",
            target_name: "ST...".to_string(),
            alternate_setting: 0,
            element_count: 1,
            address: 0x0800_0000,
            payload: (0..1024u32).map(|i| (i % 253) as u8).collect(),
            declared_length: None,
            vendor_id: 0x0483,
            product_id: 0xDF11,
            bootloader_version: 0x2200,
            bcd_dfu: 0x011A,
            suffix_signature: *b"UFD",
            corrupt_crc: false,
        }
    }

    pub fn signature(mut self, signature: [u8; 5]) -> Self {
        self.signature = signature;
        self
    }

    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn target_signature(mut self, signature: [u8; 6]) -> Self {
        self.target_signature = signature;
        self
    }

    pub fn target_name(mut self, name: &str) -> Self {
        self.target_name = name.to_string();
        self
    }

    pub fn alternate_setting(mut self, alt: u8) -> Self {
        self.alternate_setting = alt;
        self
    }

    pub fn element_count(mut self, count: u32) -> Self {
        self.element_count = count;
        self
    }

    pub fn address(mut self, address: u32) -> Self {
        self.address = address;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Element length written to the header, independent of the payload.
    pub fn declared_length(mut self, length: u32) -> Self {
        self.declared_length = Some(length);
        self
    }

    pub fn vendor_id(mut self, vid: u16) -> Self {
        self.vendor_id = vid;
        self
    }

    pub fn product_id(mut self, pid: u16) -> Self {
        self.product_id = pid;
        self
    }

    pub fn bootloader_version(mut self, version: u16) -> Self {
        self.bootloader_version = version;
        self
    }

    pub fn bcd_dfu(mut self, bcd: u16) -> Self {
        self.bcd_dfu = bcd;
        self
    }

    pub fn suffix_signature(mut self, signature: [u8; 3]) -> Self {
        self.suffix_signature = signature;
        self
    }

    pub fn corrupt_crc(mut self) -> Self {
        self.corrupt_crc = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let element_length = self
            .declared_length
            .unwrap_or(self.payload.len() as u32);
        let target_size = 8 + self.payload.len() as u32;
        let image_size = (layout::ELEMENT_DATA + self.payload.len()) as u32;

        let mut file = Vec::with_capacity(layout::MIN_FILE_LENGTH + self.payload.len());

        // Prefix
        file.extend_from_slice(&self.signature);
        file.push(self.version);
        file.extend_from_slice(&image_size.to_le_bytes());
        file.push(1);

        // Target prefix
        file.extend_from_slice(&self.target_signature);
        file.push(self.alternate_setting);
        file.extend_from_slice(&1u32.to_le_bytes());
        let mut name = [0u8; 255];
        let bytes = self.target_name.as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
        file.extend_from_slice(&name);
        file.extend_from_slice(&target_size.to_le_bytes());
        file.extend_from_slice(&self.element_count.to_le_bytes());

        // Element
        file.extend_from_slice(&self.address.to_le_bytes());
        file.extend_from_slice(&element_length.to_le_bytes());
        file.extend_from_slice(&self.payload);

        // Suffix
        file.extend_from_slice(&self.bootloader_version.to_le_bytes());
        file.extend_from_slice(&self.product_id.to_le_bytes());
        file.extend_from_slice(&self.vendor_id.to_le_bytes());
        file.extend_from_slice(&self.bcd_dfu.to_le_bytes());
        file.extend_from_slice(&self.suffix_signature);
        file.push(layout::SUFFIX_LENGTH as u8);

        let mut crc = crc32_raw(&file);
        if self.corrupt_crc {
            crc ^= 0xDEAD_BEEF;
        }
        file.extend_from_slice(&crc.to_le_bytes());
        file
    }
}

impl Default for DfuFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
