//! Status events emitted while DFU jobs run.

use serde::{Deserialize, Serialize};

/// Progress and status notifications for UI or console feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data")]
pub enum DfuEvent {
    /// Reading a firmware file.
    Loading { path: String },
    /// File passed validation.
    FileVerified {
        target_name: String,
        size: u32,
        address: u32,
        sha256: String,
    },
    /// Checking whether flash is read-protected.
    CheckingProtection,
    /// Removing read protection (mass-erases the device).
    RemovingProtection,
    /// Device is resetting and will re-enumerate.
    DeviceResetting,
    /// Reading flash back to check it is erased.
    BlankCheck { attempt: u32 },
    /// Mass erase started.
    Erasing,
    /// Mass erase finished.
    EraseComplete { elapsed_ms: u64 },
    /// Writing firmware blocks.
    Writing { sent: usize, total: usize },
    /// All blocks written.
    WriteComplete { elapsed_ms: u64 },
    /// Reading firmware back for comparison.
    Verifying { read: usize, total: usize },
    /// Comparison finished.
    VerifyResult { matches: bool, elapsed_ms: u64 },
    /// Writing option bytes; the device resets afterwards.
    WritingOptionBytes { value: u16 },
    /// Fast operations feature register handled.
    FastOperations { already_set: bool },
    /// Leave-DFU request finished.
    LeftDfuMode { success: bool },
    /// Boot pins driven into DFU or normal mode.
    BootMode { dfu: bool, success: bool },
    /// Full programming workflow complete.
    Complete,
    /// Non-fatal condition worth surfacing.
    Warning { message: String },
    /// Debug log message.
    Log { message: String },
    /// Job failed.
    Failed { message: String, code: String },
}

impl DfuEvent {
    /// Get a percentage estimate for this stage.
    pub fn percent(&self) -> f32 {
        match self {
            DfuEvent::Loading { .. } => 0.0,
            DfuEvent::FileVerified { .. } => 2.0,
            DfuEvent::CheckingProtection => 4.0,
            DfuEvent::RemovingProtection => 6.0,
            DfuEvent::DeviceResetting => 100.0,
            DfuEvent::BlankCheck { .. } => 8.0,
            DfuEvent::Erasing => 10.0,
            DfuEvent::EraseComplete { .. } => 20.0,
            DfuEvent::Writing { sent, total } => {
                if *total == 0 {
                    20.0
                } else {
                    20.0 + (*sent as f32 / *total as f32) * 50.0
                }
            }
            DfuEvent::WriteComplete { .. } => 70.0,
            DfuEvent::Verifying { read, total } => {
                if *total == 0 {
                    70.0
                } else {
                    70.0 + (*read as f32 / *total as f32) * 25.0
                }
            }
            DfuEvent::VerifyResult { .. } => 95.0,
            DfuEvent::WritingOptionBytes { .. } => 98.0,
            DfuEvent::Complete => 100.0,
            // Standalone results and messages don't affect progress percentage
            DfuEvent::FastOperations { .. }
            | DfuEvent::LeftDfuMode { .. }
            | DfuEvent::BootMode { .. }
            | DfuEvent::Warning { .. }
            | DfuEvent::Log { .. }
            | DfuEvent::Failed { .. } => -1.0,
        }
    }

    /// Get a human-readable message for this stage.
    pub fn message(&self) -> String {
        match self {
            DfuEvent::Loading { path } => format!("Reading {}...", path),
            DfuEvent::FileVerified {
                target_name,
                size,
                address,
                sha256,
            } => format!(
                "File OK: \"{}\", {} bytes at 0x{:08X} (sha256 {})",
                target_name, size, address, sha256
            ),
            DfuEvent::CheckingProtection => "Checking read protection...".into(),
            DfuEvent::RemovingProtection => "Removing read protection...".into(),
            DfuEvent::DeviceResetting => {
                "Read Protection removed. Device resets...Wait until it re-enumerates".into()
            }
            DfuEvent::BlankCheck { attempt } => format!("Blank check (attempt {})...", attempt),
            DfuEvent::Erasing => "Erasing...".into(),
            DfuEvent::EraseComplete { elapsed_ms } => {
                format!("Mass erase completed in {} ms", elapsed_ms)
            }
            DfuEvent::Writing { sent, total } => {
                let percent = if *total == 0 { 0 } else { (sent * 100) / total };
                format!("Programming... {}%", percent)
            }
            DfuEvent::WriteComplete { elapsed_ms } => {
                format!("Programming completed in {} ms", elapsed_ms)
            }
            DfuEvent::Verifying { read, total } => {
                let percent = if *total == 0 { 0 } else { (read * 100) / total };
                format!("Verifying... {}%", percent)
            }
            DfuEvent::VerifyResult {
                matches,
                elapsed_ms,
            } => {
                if *matches {
                    format!("Device firmware equals file firmware ({} ms)", elapsed_ms)
                } else {
                    format!(
                        "Device firmware does not equal file firmware ({} ms)",
                        elapsed_ms
                    )
                }
            }
            DfuEvent::WritingOptionBytes { value } => {
                format!("Writing option bytes 0x{:04X}, device will self-reset", value)
            }
            DfuEvent::FastOperations { already_set } => {
                if *already_set {
                    "Fast Operations was already set (Parallelism x32)".into()
                } else {
                    "Fast Operations set (Parallelism x32)".into()
                }
            }
            DfuEvent::LeftDfuMode { success } => {
                if *success {
                    "Successfully left DFU mode".into()
                } else {
                    "Could not leave DFU mode".into()
                }
            }
            DfuEvent::BootMode { dfu, success } => {
                let mode = if *dfu { "DFU" } else { "normal" };
                if *success {
                    format!("Successfully entered {} mode", mode)
                } else {
                    format!("Could not enter {} mode", mode)
                }
            }
            DfuEvent::Complete => "Programming complete!".into(),
            DfuEvent::Warning { message } => format!("Warning: {}", message),
            DfuEvent::Log { message } => message.clone(),
            DfuEvent::Failed { message, code } => format!("[{}] {}", code, message),
        }
    }
}
