//! Programmer settings with JSON persistence.
//!
//! Every field carries a default, so a partial or empty settings file still
//! loads. Unknown keys are ignored.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dfu::config::{
    MAX_PROGRAM_RETRIES, MAX_STATUS_POLLS, REENUMERATE_TIMEOUT_MS, SHUTDOWN_GRACE, ST_DFU_PID,
    ST_VID,
};
use crate::dfu::error::DfuResult;
use crate::dfu::programmer::{BlankCheck, OptionBytes};

/// Tunables for the programming workflows and the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgrammerSettings {
    /// Erase/write/verify attempts before giving up on a unit.
    pub max_retries: u32,

    /// How erased flash is recognized.
    pub blank_check: BlankCheck,

    /// GETSTATUS polls allowed while waiting for the device to go idle.
    pub max_status_polls: u32,

    /// Option byte word written at the end of a full programming run.
    pub option_bytes: OptionBytes,

    /// How long shutdown waits for an in-flight job.
    pub shutdown_grace_ms: u64,

    /// How long to wait for the device to re-enumerate after a reset.
    pub reenumerate_timeout_ms: u64,

    /// USB vendor ID of the bootloader.
    pub vendor_id: u16,

    /// USB product ID of the bootloader.
    pub product_id: u16,
}

impl Default for ProgrammerSettings {
    fn default() -> Self {
        Self {
            max_retries: MAX_PROGRAM_RETRIES,
            blank_check: BlankCheck::default(),
            max_status_polls: MAX_STATUS_POLLS,
            option_bytes: OptionBytes::production(),
            shutdown_grace_ms: SHUTDOWN_GRACE.as_millis() as u64,
            reenumerate_timeout_ms: REENUMERATE_TIMEOUT_MS,
            vendor_id: ST_VID,
            product_id: ST_DFU_PID,
        }
    }
}

impl ProgrammerSettings {
    /// Check if these settings differ from defaults.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Settings file name stored in the settings directory.
const SETTINGS_FILENAME: &str = "programmer_settings.json";

/// Manages persistence of programmer settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager for the given directory.
    pub fn new(settings_dir: &Path) -> Self {
        let settings_file_path = settings_dir.join(SETTINGS_FILENAME);
        Self { settings_file_path }
    }

    /// Load settings from disk, returning defaults if the file doesn't exist.
    pub fn load(&self) -> DfuResult<ProgrammerSettings> {
        if !self.settings_file_path.exists() {
            return Ok(ProgrammerSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(ProgrammerSettings::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &ProgrammerSettings) -> DfuResult<()> {
        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_file_path, contents)?;

        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}
