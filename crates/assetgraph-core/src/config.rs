use anyhow::{Context, Result};
use config as cfg;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level settings for the asset graph engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetGraphSettings {
    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Source change tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Interval of the change loop, in milliseconds. Must be > 0.
    #[serde(default = "default_tracking_interval_ms")]
    pub tracking_interval_ms: u64,

    /// Capacity of the raw filesystem event channel. Events beyond it are dropped.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Worker threads used to hash source files
    #[serde(default = "default_hash_threads")]
    pub hash_threads: usize,

    /// Start the filesystem watcher and change loop on construction
    #[serde(default = "default_enable_tracking")]
    pub enable_tracking: bool,
}

impl TrackerConfig {
    pub fn tracking_interval(&self) -> Duration {
        Duration::from_millis(self.tracking_interval_ms)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tracking_interval_ms: default_tracking_interval_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            hash_threads: default_hash_threads(),
            enable_tracking: default_enable_tracking(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_tracking_interval_ms() -> u64 {
    100
}

fn default_event_channel_capacity() -> usize {
    4096
}

fn default_hash_threads() -> usize {
    2
}

fn default_enable_tracking() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

const LOG_FORMATS: [&str; 3] = ["pretty", "json", "compact"];

impl AssetGraphSettings {
    /// Loads defaults, then the optional TOML file, then `ASSETGRAPH__*` environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = cfg::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                cfg::File::from(path)
                    .format(cfg::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(cfg::Environment::with_prefix("ASSETGRAPH").separator("__"));

        let settings: AssetGraphSettings = builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: AssetGraphSettings =
            toml::from_str(content).context("parsing TOML configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("serializing configuration")?;
        std::fs::write(path, content).with_context(|| format!("writing {:?}", path))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.tracker.tracking_interval_ms > 0,
            "tracker.tracking_interval_ms must be > 0"
        );
        anyhow::ensure!(
            self.tracker.event_channel_capacity > 0,
            "tracker.event_channel_capacity must be > 0"
        );
        anyhow::ensure!(
            self.tracker.hash_threads > 0,
            "tracker.hash_threads must be > 0"
        );
        anyhow::ensure!(
            LOG_FORMATS.contains(&self.logging.format.as_str()),
            "logging.format must be one of {:?}",
            LOG_FORMATS
        );
        Ok(())
    }
}
