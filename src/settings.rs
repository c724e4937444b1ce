//! Persistent server settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::render::backend::check_frame_size;
use crate::stream::LoopOptions;
use crate::util::{Error, Result};

/// Which kernel implementation renders frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Gpu,
    Cpu,
}

/// Server settings, persisted as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Network
    pub host: String,
    pub port: u16,

    // Frame
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,

    // Render loop
    pub samples_per_tick: u32,
    pub tick_interval_ms: u64,
    pub seed: u64,
    pub backend: BackendKind,

    // Scene
    pub environment_map: Option<PathBuf>,

    // Logging (overridden by RUST_LOG)
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8030,
            width: 960,
            height: 540,
            jpeg_quality: 90,
            samples_per_tick: 64,
            tick_interval_ms: 1,
            seed: 0,
            backend: BackendKind::Gpu,
            environment_map: None,
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    /// Default settings file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("pathstream");
            p.push("settings.json");
            p
        })
    }

    /// Load settings from `path`, or from the default location.
    ///
    /// A missing or unreadable file yields defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable settings");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save settings to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        check_frame_size(self.width, self.height)?;
        if self.samples_per_tick == 0 {
            return Err(Error::Config("samples_per_tick must be at least 1".into()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(Error::Config(format!(
                "jpeg_quality {} outside 1..=100",
                self.jpeg_quality
            )));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            samples_per_tick: self.samples_per_tick,
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            jpeg_quality: self.jpeg_quality,
        }
    }
}
