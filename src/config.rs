// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional; a missing file or a missing key falls back to
// the defaults below.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub frames: FramesConfig,
    pub debug: DebugConfig,
    pub demo: DemoConfig,
}

/// Which backend to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Vulkan when a driver loads, headless otherwise
    Auto,
    Vulkan,
    Headless,
}

/// Device settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
    pub validation_layers: bool,
    /// "auto", "vulkan" or "headless"
    pub backend: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "inflight".to_string(),
            validation_layers: cfg!(debug_assertions),
            backend: "auto".to_string(),
        }
    }
}

/// Frame pacing settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FramesConfig {
    pub max_frames_in_flight: u32,
    /// 0 waits forever
    pub fence_timeout_ms: u64,
}

impl Default for FramesConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            fence_timeout_ms: 0,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "inflight.log".to_string(),
        }
    }
}

/// Demo workload settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub frames: u64,
    pub buffer_size: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: 8,
            buffer_size: 4096,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.frames.max_frames_in_flight == 0 {
            anyhow::bail!("frames.max_frames_in_flight must be at least 1");
        }
        Ok(config)
    }

    pub fn backend(&self) -> Backend {
        match self.device.backend.to_lowercase().as_str() {
            "auto" => Backend::Auto,
            "vulkan" => Backend::Vulkan,
            "headless" => Backend::Headless,
            other => {
                log::warn!("Unknown backend '{}', defaulting to auto", other);
                Backend::Auto
            }
        }
    }

    /// Fence timeout in nanoseconds; `u64::MAX` when unbounded.
    pub fn fence_timeout_ns(&self) -> u64 {
        match self.frames.fence_timeout_ms {
            0 => u64::MAX,
            ms => ms.saturating_mul(1_000_000),
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            log::warn!(
                "Unknown log level '{}', defaulting to info",
                self.debug.log_level
            );
            LevelFilter::Info
        })
    }
}
