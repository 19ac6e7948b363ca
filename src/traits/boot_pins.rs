#[cfg(test)]
use mockall::automock;

/// Abstraction over the hardware lines that select the STM32 boot mode
/// (BOOT0 and NRST, typically driven through a GPIO expander or debug adapter).
/// Both calls reset the target; `Ok(true)` means the target came up in the
/// requested mode.
#[cfg_attr(test, automock)]
pub trait BootPins: Send {
    /// Hold BOOT0 high and pulse reset so the ROM bootloader starts.
    fn enter_dfu_mode(&mut self) -> Result<bool, String>;

    /// Release BOOT0 and pulse reset so the application starts.
    fn enter_normal_mode(&mut self) -> Result<bool, String>;
}
