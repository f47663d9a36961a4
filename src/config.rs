use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub frame_rate: u32,
    /// Frames per block when the engine drives its own clock.
    pub block_size: u32,
    /// Event slots per pattern. Each note takes two.
    pub pattern_capacity: usize,
    pub max_ports: usize,
    pub events_per_port: usize,
    /// Song length in beats.
    pub song_length: u32,
    pub initial_bpm: f64,
    pub housekeeping_interval_ms: u64,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_rate: 48_000,
            block_size: 256,
            pattern_capacity: 4096,
            max_ports: 64,
            events_per_port: 512,
            song_length: 256,
            initial_bpm: 120.0,
            housekeeping_interval_ms: 20,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }

    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_rate == 0 {
            return Err(ConfigError::Invalid("frame_rate must be positive"));
        }
        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block_size must be positive"));
        }
        if self.pattern_capacity < 2 {
            return Err(ConfigError::Invalid("pattern_capacity must hold at least one note"));
        }
        if self.max_ports == 0 {
            return Err(ConfigError::Invalid("max_ports must be positive"));
        }
        if !(self.initial_bpm.is_finite() && self.initial_bpm > 0.0) {
            return Err(ConfigError::Invalid("initial_bpm must be a positive number"));
        }
        if self.housekeeping_interval_ms == 0 {
            return Err(ConfigError::Invalid("housekeeping_interval_ms must be positive"));
        }
        Ok(())
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = EngineConfig::from_ron_str("(frame_rate: 44100, log_filter: \"dinoseq=debug\")")
            .unwrap();
        assert_eq!(config.frame_rate, 44_100);
        assert_eq!(config.log_filter, "dinoseq=debug");
        assert_eq!(config.block_size, 256);
        assert_eq!(config.initial_bpm, 120.0);
        assert_eq!(config.housekeeping_interval(), Duration::from_millis(20));
    }

    #[test]
    fn rejects_nonsense() {
        assert!(matches!(
            EngineConfig::from_ron_str("(block_size: 0)"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_ron_str("(initial_bpm: -3.0)"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_ron_str("(frame_rate: \"fast\")"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn round_trips_through_ron() {
        let config = EngineConfig {
            max_ports: 8,
            ..EngineConfig::default()
        };
        let text = ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::default()).unwrap();
        assert_eq!(EngineConfig::from_ron_str(&text).unwrap(), config);
    }
}
