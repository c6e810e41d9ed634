use crate::prelude::*;
use iotrace_capture::{CaptureConfig, MAX_TRACED_DEVICES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Config file names in priority order
const CONFIG_FILENAMES: &[&str] = &[
    "iotrace.yaml",
    "iotrace.yml",
    ".iotrace.yaml",
    ".iotrace.yml",
];

/// Configuration from an iotrace.yaml file
///
/// CLI arguments always take precedence over config file values.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    /// Capture context settings
    pub capture: Option<CaptureConfig>,
    /// Defaults for the `stress` command
    pub stress: Option<StressOptions>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct StressOptions {
    /// Number of synthetic devices to trace
    pub devices: Option<u32>,
    /// Number of I/Os each worker submits
    pub ios_per_cpu: Option<u64>,
}

impl ProjectConfig {
    /// Discover and load the configuration file
    ///
    /// # Search Strategy
    /// 1. If `config_path_override` is provided, load from that path only (error if not found)
    /// 2. Otherwise, search `current_dir` then each of its parents
    /// 3. Try filenames in priority order: iotrace.yaml, iotrace.yml, .iotrace.yaml, .iotrace.yml
    ///
    /// # Returns
    /// * `Ok(Some((path, config)))` - Config found and loaded successfully
    /// * `Ok(None)` - No config file found
    /// * `Err(_)` - Error loading or parsing config
    pub fn discover_and_load(
        config_path_override: Option<&Path>,
        current_dir: &Path,
    ) -> Result<Option<(PathBuf, ProjectConfig)>> {
        if let Some(config_path) = config_path_override {
            let config = Self::load_from_path(config_path)
                .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
            return Ok(Some((config_path.to_path_buf(), config)));
        }

        for dir in current_dir.ancestors() {
            for filename in CONFIG_FILENAMES {
                let candidate_path = dir.join(filename);
                if candidate_path.is_file() {
                    debug!("Found config file at {}", candidate_path.display());
                    let config = Self::load_from_path(&candidate_path)?;
                    return Ok(Some((candidate_path, config)));
                }
            }
        }

        Ok(None)
    }

    /// Load and parse config from a specific path
    fn load_from_path(path: &Path) -> Result<Self> {
        let config_content = fs::read(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;

        let config: Self = serde_yaml::from_slice(&config_content)
            .with_context(|| format!("Failed to parse iotrace config at {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(capture) = &self.capture {
            if capture.buffer_size_mb > capture.max_buffer_size_mb {
                bail!(
                    "Invalid capture configuration: buffer-size-mb ({}) exceeds max-buffer-size-mb ({})",
                    capture.buffer_size_mb,
                    capture.max_buffer_size_mb
                );
            }
            if capture.cpus == Some(0) {
                bail!("Invalid capture configuration: cpus must be at least 1");
            }
        }

        if let Some(devices) = self.stress.as_ref().and_then(|stress| stress.devices) {
            if devices == 0 || devices as usize > MAX_TRACED_DEVICES {
                bail!(
                    "Invalid stress configuration: devices must be between 1 and {MAX_TRACED_DEVICES}"
                );
            }
        }

        Ok(())
    }
}
