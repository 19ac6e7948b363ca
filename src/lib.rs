//! Host-side programmer for STM32 devices in DfuSe bootloader mode.

pub mod dfu;
pub mod settings;
pub mod traits;

#[cfg(test)]
mod test_helpers;
