use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::error::PipelineError;
use crate::template::ParameterTemplate;

/// Default accelerate template: 100x fast-forward, unified 30 fps and 60-frame GOP, audio dropped.
pub const DEFAULT_ACCELERATE_PARAMETERS: &str = "-i {0} -vf setpts=0.01*PTS -r 30 -g 60 -an {1}";

/// Settings for the accelerate workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccelerateSettings {
    /// Encoder parameter template with `{0}` (input) and `{1}` (output) slots
    #[serde(alias = "Parameters")]
    pub parameters: String,
}

impl Default for AccelerateSettings {
    fn default() -> Self {
        Self {
            parameters: DEFAULT_ACCELERATE_PARAMETERS.to_string(),
        }
    }
}

/// Configuration for the footage pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding the camera's `YYYYMMDDHH` hour directories
    #[serde(alias = "CameraDirectory")]
    pub camera_directory: PathBuf,
    /// Directory receiving daily, accelerated and merged outputs
    #[serde(alias = "OutputDirectory")]
    pub output_directory: PathBuf,
    /// Encoder thread hint; negative means half of the available hardware parallelism
    #[serde(alias = "ThreadsCount")]
    pub threads_count: i32,
    /// Overwrite existing outputs instead of skipping them
    #[serde(alias = "OverwriteOutput")]
    pub overwrite_output: bool,
    #[serde(alias = "VideoAcceleratorSettings")]
    pub accelerate: AccelerateSettings,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// How long a cancelled encoder may take to quit before it is killed
    pub cancel_grace_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            camera_directory: PathBuf::from("camera"),
            output_directory: PathBuf::from("output"),
            threads_count: -1,
            overwrite_output: false,
            accelerate: AccelerateSettings::default(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            cancel_grace_ms: 3000,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                log::warn!("Config file not found, using defaults: {}", config_path.display());
            }
        }

        Ok(config)
    }

    /// Check directories and the accelerate template before any work starts
    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        if !self.camera_directory.is_dir() {
            return Err(PipelineError::Configuration(format!(
                "camera directory not found: {}",
                self.camera_directory.display()
            )));
        }
        if !self.output_directory.is_dir() {
            return Err(PipelineError::Configuration(format!(
                "output directory not found: {}",
                self.output_directory.display()
            )));
        }
        self.accelerate_template()
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        Ok(())
    }

    /// Parsed accelerate template
    pub fn accelerate_template(&self) -> std::result::Result<ParameterTemplate, PipelineError> {
        ParameterTemplate::parse(&self.accelerate.parameters)
    }

    /// Thread hint handed to every job, with the negative "auto" value resolved
    pub fn resolved_threads(&self) -> u32 {
        if self.threads_count < 0 {
            let available = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (available / 2).max(1) as u32
        } else {
            self.threads_count as u32
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
