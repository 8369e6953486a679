//! Engine configuration loaded from TOML.
//!
//! Every section carries `#[serde(default)]`, so a file only needs the keys it
//! overrides:
//!
//! ```toml
//! [window]
//! width = 1920
//! height = 1080
//!
//! [frames]
//! vsync = true
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub frames: FrameConfig,
    pub shaders: ShaderConfig,
    pub loader: LoaderConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "kiln".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Frame pacing and presentation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Requested swapchain image count before clamping to surface limits.
    pub desired_image_count: u32,
    /// Force the blocking FIFO present mode.
    pub vsync: bool,
    /// Mobile targets always present with FIFO.
    pub mobile: bool,
    /// Re-record primary command buffers whenever any secondary is re-recorded.
    pub strict_command_reuse: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            desired_image_count: 3,
            vsync: false,
            mobile: false,
            strict_command_reuse: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("shader_cache"),
            cache_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Size of the fixed asset-decode worker pool.
    pub threads: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { threads: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation: bool,
    pub log_filter: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            log_filter: crate::DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl EngineConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frames.frames_in_flight == 0 {
            return Err(Error::Config("frames.frames_in_flight must be at least 1".into()));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::Config(format!(
                "window size {}x{} is empty",
                self.window.width, self.window.height
            )));
        }
        if self.loader.threads == 0 {
            return Err(Error::Config("loader.threads must be at least 1".into()));
        }
        Ok(())
    }
}
