use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::types::AnyResult;
use crate::configs::*;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub health: HealthConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load() -> AnyResult<Self> {
        let config_path = if Path::new("config.toml").exists() {
            "config.toml"
        } else if Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err("config.toml or config.default.toml not found".into());
        };

        crate::log_println!("Loading configuration from: {}", config_path);
        Self::from_path(config_path)
    }

    pub fn from_path(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)?;
        if config_str.trim().is_empty() {
            return Err(format!("{} is empty", path.display()).into());
        }
        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> AnyResult<Self> {
        let config: Config = toml::from_str(config_str)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::{ResolutionTier, VideoCodec};

    #[test]
    fn empty_sections_take_defaults() {
        let config = Config::parse("[pipeline]\n[health]\n").unwrap();
        assert_eq!(config.pipeline.width, 1920);
        assert!(config.pipeline.low_latency);
        assert_eq!(config.pipeline.retry_delay_ms, 5_000);
        assert_eq!(config.health.stats_interval_packets, 60);
        assert_eq!(config.health.reset_storm_threshold, 3);
        assert!(config.logging.is_none());
    }

    #[test]
    fn parses_full_config() {
        let config = Config::parse(
            r#"
            [pipeline]
            width = 2400
            height = 960
            codec = "h265"
            preferred_decoders = ["OMX.Intel.hw_vd.h264"]
            low_latency = false
            ring_capacity = 1048576
            surface = 7

            [health]
            target_fps = 30
            high_water_bytes = 4096

            [logging]
            level = "debug"
            filters = "vidring::video::buffer=trace"

            [logging.file]
            path = "logs/vidring.log"
            "#,
        )
        .unwrap();

        let pipeline = &config.pipeline;
        assert_eq!(pipeline.resolution().tier(), ResolutionTier::Wide);
        assert_eq!(pipeline.codec, VideoCodec::H265);
        assert_eq!(pipeline.ring_capacity(), 1_048_576);
        assert_eq!(pipeline.surface().map(|s| s.0), Some(7));
        assert!(!pipeline.format().low_latency);
        assert!(pipeline.format().realtime_priority);

        assert_eq!(config.health.target_fps, 30);
        assert_eq!(config.health.high_water_bytes, Some(4_096));

        let file = config.logging.and_then(|l| l.file).unwrap();
        assert_eq!(file.path, "logs/vidring.log");
        assert_eq!(file.max_lines, 10_000);
    }

    #[test]
    fn ring_capacity_defaults_to_tier() {
        let config = Config::default();
        assert_eq!(config.pipeline.ring_capacity(), 8 * 1_024 * 1_024);
    }

    #[test]
    fn rejects_unknown_codec() {
        assert!(Config::parse("[pipeline]\ncodec = \"vp9\"\n").is_err());
    }
}
