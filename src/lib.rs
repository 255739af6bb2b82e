pub mod analysis;
pub mod app;
pub mod capture;
pub mod color_area;
pub mod http;
pub mod params;
pub mod pipeline;
pub mod publish;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use capture::{BackendKind, Pattern, PixelFormat, Resolution};
use params::Params;

pub use config::ConfigError;

/// Prefix of environment overrides, e.g. `COLORCHECK_HTTP__BIND`.
pub const ENV_PREFIX: &str = "COLORCHECK";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub analysis: AnalysisConfig,
    pub http: HttpConfig,
    pub opcua: OpcUaConfig,
    /// Initial runtime parameters.
    pub params: Params,
}

impl Config {
    /// Defaults, overlaid by the TOML file at `path` and then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: BackendKind,
    /// Device node; auto-detected when absent.
    pub device: Option<String>,
    /// Requested stream size; the smallest offered size covering it is used.
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: usize,
    /// Sizes the synthetic source offers.
    pub resolutions: Vec<Resolution>,
    pub pattern: Pattern,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Synthetic,
            device: None,
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Nv12,
            buffer_count: 8,
            resolutions: vec![
                Resolution::new(640, 480),
                Resolution::new(1280, 720),
                Resolution::new(1920, 1080),
            ],
            pattern: Pattern::default(),
        }
    }
}

impl CaptureConfig {
    pub fn requested_resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Older frames kept behind the newest one when nobody consumes.
    pub retention: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { retention: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub pick_timeout_ms: u64,
    pub debug_dir: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            pick_timeout_ms: 2000,
            debug_dir: None,
        }
    }
}

impl AnalysisConfig {
    pub fn pick_timeout(&self) -> Duration {
        Duration::from_millis(self.pick_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcUaConfig {
    pub host: String,
    pub refresh_interval_ms: u64,
    /// Certificate store of the OPC UA server.
    pub pki_dir: PathBuf,
}

impl Default for OpcUaConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            refresh_interval_ms: 1000,
            pki_dir: PathBuf::from("pki"),
        }
    }
}

impl OpcUaConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}
