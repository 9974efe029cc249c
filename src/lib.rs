pub mod capture;
pub mod codec;
pub mod display;
pub mod error;
pub mod frame;
pub mod hal;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use codec::CodecType;

pub use error::{Result, ReturnError, VppError};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub codec: CodecConfig,
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// `-1` probes every connector
    pub sensor_index: i32,
    /// Requested output sizes, `[0, 0]` for the sensor size
    pub channels: Vec<[u32; 2]>,
    pub ring_depth: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub codec: CodecType,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker wait on the upstream stage
    pub get_frame_timeout_ms: u32,
    /// Worker pause after a failed iteration
    pub retry_backoff_us: u64,
    /// Hard errors in a row before a binding faults
    pub max_consecutive_errors: u32,
    pub ring_depth: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            sensor_index: -1,
            channels: vec![[1920, 1080]],
            ring_depth: 4,
            fps: 30,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            codec: CodecType::H264,
            width: 1920,
            height: 1080,
            bitrate_kbps: 8000,
            fps: 30,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            get_frame_timeout_ms: 1000,
            retry_backoff_us: 30,
            max_consecutive_errors: 64,
            ring_depth: 4,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if it exists, then `VPP_*`
    /// environment variables (`VPP_PIPELINE__RING_DEPTH=8`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())?;
        let cfg = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("VPP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

/// Per-link counters of a binding worker
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    /// Loop passes, including timed-out ones
    pub iterations: u64,
    pub frames_forwarded: u64,
    pub timeouts: u64,
    pub errors: u64,
}
