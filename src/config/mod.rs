//! Crate configuration
//!
//! Fixed at initialization and loaded from a TOML file: crate geometry
//! (modules, channels, slot numbers), FIFO polling parameters, the broadcast
//! endpoint and the output-file defaults.
//!
//! # Example
//! ```ignore
//! let config = CrateConfig::load("crate.toml")?;
//! let thresh = config.fifo.thresh_words();
//! ```

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level crate configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CrateConfig {
    pub modules: ModuleConfig,
    pub fifo: FifoConfig,
    pub broadcast: BroadcastConfig,
    pub output: OutputConfig,
    pub stats: StatsConfig,
}

impl CrateConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string (useful for testing).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: CrateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modules.count == 0 {
            return Err(ConfigError::Invalid("module count must be at least 1".into()));
        }
        if self.modules.slot_map.len() != self.modules.count as usize {
            return Err(ConfigError::Invalid(format!(
                "slot map has {} entries for {} modules",
                self.modules.slot_map.len(),
                self.modules.count
            )));
        }
        if self.fifo.min_read_words == 0 || self.fifo.min_read_words >= self.fifo.capacity_words {
            return Err(ConfigError::Invalid(
                "minimum FIFO read must be between 1 and the FIFO capacity".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.fifo.thresh_percent) {
            return Err(ConfigError::Invalid(
                "FIFO threshold percentage must be within 0..=100".into(),
            ));
        }
        Ok(())
    }
}

/// Crate geometry: module count, channels per module, slot numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Number of modules in the crate.
    pub count: u16,
    /// Channels per module.
    pub channels: u16,
    /// Physical slot number for each module index.
    pub slot_map: Vec<u16>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        // Slot numbering starts at 2; slot 1 holds the crate controller.
        Self {
            count: 2,
            channels: 16,
            slot_map: vec![2, 3],
        }
    }
}

/// FIFO geometry and polling parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FifoConfig {
    /// Hardware FIFO capacity in 32-bit words.
    pub capacity_words: usize,
    /// Reads below this word count emit an empty-module record instead.
    pub min_read_words: usize,
    /// Tight-poll attempts per drain cycle before giving up on the threshold.
    pub poll_tries: u32,
    /// Polling threshold as a percentage of the FIFO capacity.
    pub thresh_percent: f64,
}

impl Default for FifoConfig {
    fn default() -> Self {
        Self {
            capacity_words: 131_072,
            min_read_words: 9,
            poll_tries: 100,
            thresh_percent: 50.0,
        }
    }
}

impl FifoConfig {
    /// Threshold in words derived from the configured percentage.
    pub fn thresh_words(&self) -> usize {
        (self.capacity_words as f64 * self.thresh_percent / 100.0) as usize
    }

    /// Threshold in words for an arbitrary percentage.
    pub fn thresh_words_for(&self, percent: f64) -> usize {
        (self.capacity_words as f64 * percent / 100.0) as usize
    }
}

/// Downstream broadcast endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// UDP endpoint spills and notifications are sent to.
    pub endpoint: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:5555".to_string(),
        }
    }
}

/// Output-file defaults, adjustable at runtime from the command loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Run-file directory.
    pub directory: String,
    /// Run-file prefix.
    pub prefix: String,
    /// Run title recorded with each file (80 characters max for ldf).
    pub title: String,
    /// First run number to use.
    pub next_run_number: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: "./".to_string(),
            prefix: "run".to_string(),
            title: "PIXIE data file".to_string(),
            next_run_number: 1,
        }
    }
}

/// Statistics dump configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Seconds between statistics dumps; non-positive disables them.
    pub dump_interval_secs: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            dump_interval_secs: -1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CrateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.modules.channels, 16);
        assert_eq!(config.fifo.capacity_words, 131_072);
        assert_eq!(config.fifo.min_read_words, 9);
        assert_eq!(config.broadcast.endpoint, "127.0.0.1:5555");
    }

    #[test]
    fn thresh_words_from_percentage() {
        let fifo = FifoConfig::default();
        assert_eq!(fifo.thresh_words(), 65_536);
        assert_eq!(fifo.thresh_words_for(0.0), 0);
        assert_eq!(fifo.thresh_words_for(100.0), 131_072);
    }

    #[test]
    fn load_from_toml() {
        let toml = r#"
            [modules]
            count = 4
            channels = 16
            slot_map = [2, 3, 4, 5]

            [fifo]
            thresh_percent = 25.0

            [output]
            directory = "/data/"
            prefix = "exp"
        "#;
        let config = CrateConfig::from_toml(toml).unwrap();
        assert_eq!(config.modules.count, 4);
        assert_eq!(config.modules.slot_map, vec![2, 3, 4, 5]);
        assert_eq!(config.fifo.thresh_words(), 32_768);
        assert_eq!(config.output.prefix, "exp");
        // Unset sections fall back to defaults.
        assert_eq!(config.fifo.poll_tries, 100);
        assert_eq!(config.stats.dump_interval_secs, -1.0);
    }

    #[test]
    fn slot_map_must_match_module_count() {
        let toml = r#"
            [modules]
            count = 3
            slot_map = [2, 3]
        "#;
        assert!(matches!(
            CrateConfig::from_toml(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn thresh_percent_out_of_range_rejected() {
        let toml = r#"
            [fifo]
            thresh_percent = 150.0
        "#;
        assert!(CrateConfig::from_toml(toml).is_err());
    }
}
