//! Configuration structures for FrameBatch
//!
//! [`BackendOptions`] is the option set a model is loaded with. It can be
//! built programmatically, parsed from an `key=value&key=value` string, or
//! deserialized as part of a [`DriverConfig`] loaded from YAML with
//! environment variable overrides.

use crate::error::{FrameBatchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Upper bound for units per dispatch
pub const MAX_BATCH_SIZE: usize = 1000;

/// Default execution device
pub const DEFAULT_DEVICE: &str = "CPU";

/// Environment prefix used for overrides (`FRAMEBATCH__OPTIONS__NIREQ=4`)
pub const ENV_PREFIX: &str = "FRAMEBATCH";

/// Options recognized by the accelerator backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOptions {
    /// Target execution device identifier
    #[serde(default = "default_device")]
    pub device: String,

    /// Number of concurrent execution slots (0 = derived from host parallelism)
    #[serde(default)]
    pub nireq: usize,

    /// Inference units per dispatch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Whether spatial input dimensions may be renegotiated
    #[serde(default)]
    pub input_resizable: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            device: default_device(),
            nireq: 0,
            batch_size: default_batch_size(),
            input_resizable: false,
        }
    }
}

impl BackendOptions {
    /// Start building an option set from the defaults
    pub fn builder() -> BackendOptionsBuilder {
        BackendOptionsBuilder::default()
    }

    /// Clamp correctable values and reject the rest
    pub fn validate(mut self) -> Result<Self> {
        if self.device.trim().is_empty() {
            return Err(FrameBatchError::config("device must not be empty"));
        }
        if self.batch_size == 0 {
            warn!("batch_size 0 is not valid, using 1");
            self.batch_size = 1;
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(FrameBatchError::config(format!(
                "batch_size {} exceeds the maximum of {}",
                self.batch_size, MAX_BATCH_SIZE
            )));
        }
        Ok(self)
    }

    /// Number of execution slots to create
    ///
    /// A configured value of 0 is a rough estimate based on the host.
    pub fn resolved_nireq(&self) -> usize {
        if self.nireq > 0 {
            return self.nireq;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus / 2 + 1
    }
}

/// Parses `device=CPU&nireq=2&batch_size=4&input_resizable=1`
impl FromStr for BackendOptions {
    type Err = FrameBatchError;

    fn from_str(s: &str) -> Result<Self> {
        let mut builder = BackendOptions::builder();

        for pair in s.split('&').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| FrameBatchError::Parse(format!("option \"{}\" has no value", pair)))?;

            builder = match key.trim() {
                "device" => builder.device(value.trim()),
                "nireq" => {
                    let nireq = parse_int(key, value)?;
                    builder.nireq(nireq.max(0) as usize)
                }
                "batch_size" => {
                    let batch_size = parse_int(key, value)?;
                    builder.batch_size(batch_size.max(0) as usize)
                }
                "input_resizable" => builder.input_resizable(parse_bool(key, value)?),
                other => {
                    return Err(FrameBatchError::config(format!(
                        "unrecognized option \"{}\"",
                        other
                    )))
                }
            };
        }

        builder.build()
    }
}

fn parse_int(key: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|e| FrameBatchError::Parse(format!("invalid value for {}: {}", key, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(FrameBatchError::Parse(format!(
            "invalid boolean for {}: {}",
            key, other
        ))),
    }
}

/// Builder for [`BackendOptions`]
#[derive(Debug, Clone, Default)]
pub struct BackendOptionsBuilder {
    options: BackendOptions,
}

impl BackendOptionsBuilder {
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.options.device = device.into();
        self
    }

    pub fn nireq(mut self, nireq: usize) -> Self {
        self.options.nireq = nireq;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.options.batch_size = batch_size;
        self
    }

    pub fn input_resizable(mut self, input_resizable: bool) -> Self {
        self.options.input_resizable = input_resizable;
        self
    }

    /// Validate and return the options
    pub fn build(self) -> Result<BackendOptions> {
        self.options.validate()
    }
}

/// Function a model is loaded for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    /// Whole-frame processing (e.g. super resolution)
    ProcessFrame,

    /// Whole-frame object detection
    Detect,

    /// Per-region classification of detected objects
    Classify,
}

/// Top-level configuration for the demo driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Path to the model description
    pub model_path: PathBuf,

    /// Function the model is used for
    #[serde(default = "default_function")]
    pub function: FunctionKind,

    /// Model input tensor name
    pub input_name: String,

    /// Model output tensor name
    pub output_name: String,

    /// Backend options
    #[serde(default)]
    pub options: BackendOptions,

    /// Synthetic workload
    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Synthetic workload pushed through the driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Number of frames to submit
    #[serde(default = "default_frames")]
    pub frames: usize,

    /// Frame width in pixels
    #[serde(default = "default_frame_width")]
    pub width: usize,

    /// Frame height in pixels
    #[serde(default = "default_frame_height")]
    pub height: usize,

    /// Delay between polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            frames: default_frames(),
            width: default_frame_width(),
            height: default_frame_height(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Print Prometheus metrics when the run finishes
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

/// Default value functions
fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

fn default_batch_size() -> usize {
    1
}

fn default_function() -> FunctionKind {
    FunctionKind::ProcessFrame
}

fn default_frames() -> usize {
    64
}

fn default_frame_width() -> usize {
    64
}

fn default_frame_height() -> usize {
    64
}

fn default_poll_interval() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl DriverConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FrameBatchError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: DriverConfig = serde_yaml::from_str(&content).map_err(|e| {
            FrameBatchError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()
    }

    /// Load a YAML file and apply `FRAMEBATCH__*` environment overrides
    ///
    /// The prefix and nested keys are joined by a double underscore, e.g.
    /// `FRAMEBATCH__OPTIONS__BATCH_SIZE=4`. Variables with a single
    /// underscore after the prefix, such as `FRAMEBATCH_CONFIG`, are ignored.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading driver config from {}", path.display());

        let config: DriverConfig = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()
    }

    /// Validate configuration
    pub fn validate(mut self) -> Result<Self> {
        if self.input_name.is_empty() || self.output_name.is_empty() {
            return Err(FrameBatchError::config(
                "input_name and output_name are required",
            ));
        }
        if self.workload.width == 0 || self.workload.height == 0 {
            return Err(FrameBatchError::config("workload frames must not be empty"));
        }
        self.options = self.options.validate()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let options = BackendOptions::default();
        assert_eq!(options.device, "CPU");
        assert_eq!(options.nireq, 0);
        assert_eq!(options.batch_size, 1);
        assert!(!options.input_resizable);
        assert!(options.resolved_nireq() >= 1);
    }

    #[test]
    fn test_batch_size_zero_is_clamped() {
        let options = BackendOptions::builder().batch_size(0).build().unwrap();
        assert_eq!(options.batch_size, 1);
    }

    #[test]
    fn test_batch_size_over_limit_is_rejected() {
        let result = BackendOptions::builder().batch_size(MAX_BATCH_SIZE + 1).build();
        assert!(matches!(result, Err(FrameBatchError::Config(_))));
    }

    #[test]
    fn test_explicit_nireq_wins() {
        let options = BackendOptions::builder().nireq(3).build().unwrap();
        assert_eq!(options.resolved_nireq(), 3);
    }

    #[test]
    fn test_parse_option_string() {
        let options: BackendOptions = "device=GPU&nireq=2&batch_size=4&input_resizable=1"
            .parse()
            .unwrap();
        assert_eq!(options.device, "GPU");
        assert_eq!(options.nireq, 2);
        assert_eq!(options.batch_size, 4);
        assert!(options.input_resizable);
    }

    #[test]
    fn test_parse_negative_batch_size_clamps() {
        let options: BackendOptions = "batch_size=-3".parse().unwrap();
        assert_eq!(options.batch_size, 1);
    }

    #[test]
    fn test_parse_rejects_unknown_option() {
        let result = "device=CPU&threads=4".parse::<BackendOptions>();
        assert!(matches!(result, Err(FrameBatchError::Config(_))));

        let result = "nireq".parse::<BackendOptions>();
        assert!(matches!(result, Err(FrameBatchError::Parse(_))));
    }

    #[test]
    fn test_empty_option_string_gives_defaults() {
        let options: BackendOptions = "".parse().unwrap();
        assert_eq!(options, BackendOptions::default());
    }

    #[test]
    fn test_driver_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "model_path: /models/sr.json\n\
             function: process_frame\n\
             input_name: x\n\
             output_name: y\n\
             options:\n  nireq: 2\n  batch_size: 0\n\
             workload:\n  frames: 5"
        )
        .unwrap();

        let config = DriverConfig::from_file(file.path()).unwrap();
        assert_eq!(config.function, FunctionKind::ProcessFrame);
        assert_eq!(config.options.nireq, 2);
        assert_eq!(config.options.batch_size, 1);
        assert_eq!(config.workload.frames, 5);
        assert_eq!(config.workload.width, 64);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_driver_config_env_override() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "model_path: /models/sr.json\n\
             input_name: x\n\
             output_name: y\n\
             options:\n  nireq: 2\n  batch_size: 2"
        )
        .unwrap();

        std::env::set_var("FRAMEBATCH__OPTIONS__NIREQ", "6");
        std::env::set_var("FRAMEBATCH__WORKLOAD__FRAMES", "9");
        std::env::set_var("FRAMEBATCH_OPTIONS__BATCH_SIZE", "8");
        let result = DriverConfig::load(file.path());
        std::env::remove_var("FRAMEBATCH__OPTIONS__NIREQ");
        std::env::remove_var("FRAMEBATCH__WORKLOAD__FRAMES");
        std::env::remove_var("FRAMEBATCH_OPTIONS__BATCH_SIZE");

        let config = result.unwrap();
        assert_eq!(config.options.nireq, 6);
        assert_eq!(config.options.batch_size, 2);
        assert_eq!(config.workload.frames, 9);
        assert_eq!(config.input_name, "x");
    }

    #[test]
    fn test_driver_config_missing_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "model_path: /models/sr.json\ninput_name: \"\"\noutput_name: y"
        )
        .unwrap();

        assert!(DriverConfig::from_file(file.path()).is_err());
    }
}
