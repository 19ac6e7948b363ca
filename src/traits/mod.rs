pub mod boot_pins;

pub use boot_pins::BootPins;

#[cfg(test)]
pub use boot_pins::MockBootPins;
