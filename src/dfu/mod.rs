//! STM32 DfuSe (Device Firmware Update) module.
//!
//! This module provides a Rust implementation of ST's DfuSe extension of the
//! USB DFU 1.1 protocol, used to program STM32F4 parts through their ROM
//! bootloader.
//!
//! # Programming Overview
//!
//! A full programming run consists of:
//! 1. **File Validation** - Parse and CRC-check the `.dfu` image
//! 2. **Compatibility** - Match VID/PID, address range and bootloader version
//! 3. **Protection Check** - Remove read protection (device resets) if set
//! 4. **Blank Check** - Mass erase until flash reads back erased
//! 5. **Write** - Download the image block by block
//! 6. **Verify** - Upload and compare, re-erasing and rewriting on mismatch
//! 7. **Option Bytes** - Write the user option bytes; the device resets
//!
//! # Example
//!
//! ```ignore
//! use stm32_dfu_programmer::dfu::{DfuEngine, RusbTransport};
//! use stm32_dfu_programmer::settings::ProgrammerSettings;
//!
//! let engine = DfuEngine::new(ProgrammerSettings::default(), |event| {
//!     println!("{}", event.message())
//! })?;
//! engine.set_transport(Some(Box::new(RusbTransport::open(0x0483, 0xDF11)?)));
//! let outcome = engine.program_firmware("firmware.dfu".into()).blocking_recv();
//! ```

pub mod blocks;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod firmware_reader;
pub mod programmer;
pub mod protocol;
pub mod status;
pub mod transport;

// Device detection
pub use device::{find_dfu_devices, wait_for_dfu_device, DeviceIdentity, DfuDeviceInfo};

// Engine and workflows
pub use engine::{DfuEngine, JobReceiver};
pub use events::DfuEvent;
pub use programmer::{BlankCheck, OptionBytes, Outcome, Programmer};

// Errors
pub use error::{CompatibilityError, DfuError, DfuResult, FormatError};

// Firmware reading
pub use firmware_reader::{parse_dfu_image, read_dfu_file, FirmwareImage};

// Transport
pub use protocol::DfuProtocol;
pub use transport::{DfuTransport, RusbTransport, SharedTransport};
