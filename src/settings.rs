use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::sample::SamplingRate;


pub const APP_NAME: &str = "pulsedash";
const SETTINGS_FILE: &str = "settings.json";
const OFFLINE_QUEUE_FILE: &str = "offline_queue.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend_url: String,
    /// Only peripherals whose advertised name starts with this are listed.
    pub device_name_prefix: String,
    pub sampling_rate: SamplingRate,
    pub flush_interval_secs: u64,
    pub discovery_timeout_secs: u64,
    pub export_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            backend_url: "http://localhost:5000".to_string(),
            device_name_prefix: "Polar".to_string(),
            sampling_rate: SamplingRate::Hz26,
            flush_interval_secs: 30,
            discovery_timeout_secs: 10,
            export_dir: None,
        }
    }
}

impl Settings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs.max(1))
    }

    /// Where CSV exports are written; falls back to the downloads folder.
    pub fn export_dir(&self) -> PathBuf {
        self.export_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Reads the settings file, replacing it with defaults when it is missing or unreadable.
    pub fn load_or_reset(path: &Path) -> Result<Self> {
        match Self::read(path) {
            Ok(settings) => Ok(settings),
            Err(err) => {
                if path.exists() {
                    warn!("Resetting unreadable settings at {}: {err:#}", path.display());
                } else {
                    info!("Writing default settings to {}", path.display());
                }
                let settings = Settings::default();
                settings.write(path)?;
                Ok(settings)
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

pub fn app_data_dir() -> Result<PathBuf> {
    let dir = dirs::data_local_dir().context("no local data directory on this platform")?;
    Ok(dir.join(APP_NAME))
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SETTINGS_FILE)
}

pub fn offline_queue_path(data_dir: &Path) -> PathBuf {
    data_dir.join(OFFLINE_QUEUE_FILE)
}
