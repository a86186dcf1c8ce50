//! CLI settings file.
//!
//! ```toml
//! adb = "/opt/android-sdk/platform-tools/adb"
//!
//! [recorder]
//! buffer_timeout_ms = 150
//! bare_hex_values = true
//!
//! [replay]
//! use_original_timing = true
//! max_delay_ms = 3000
//! ```

use anyhow::{Context, Result};
use droidscope::device::Adb;
use droidscope::{RecorderConfig, ReplayConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub adb: Option<PathBuf>,
    pub recorder: RecorderConfig,
    pub replay: ReplayConfig,
}

impl Settings {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults when no file was given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from(p),
            None => Ok(Self::default()),
        }
    }

    /// `--adb`, then the settings file, then `$ADB`, then `adb` on PATH.
    pub fn adb(&self, flag: Option<&Path>) -> Adb {
        match flag.or(self.adb.as_deref()) {
            Some(program) => Adb::with_program(program),
            None => Adb::new(),
        }
    }
}
