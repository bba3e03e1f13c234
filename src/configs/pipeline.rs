use serde::{Deserialize, Serialize};

use crate::video::constants::DEFAULT_RETRY_DELAY_MS;
use crate::video::format::{Resolution, SurfaceId, VideoCodec, VideoFormat};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub codec: VideoCodec,
    /// Decoders tried by name, in order, before the generic one for the codec.
    #[serde(default)]
    pub preferred_decoders: Vec<String>,
    #[serde(default = "default_true")]
    pub low_latency: bool,
    #[serde(default = "default_true")]
    pub realtime_priority: bool,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Overrides the resolution tier's initial ring size.
    #[serde(default)]
    pub ring_capacity: Option<usize>,
    #[serde(default)]
    pub surface: Option<u64>,
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_true() -> bool {
    true
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            codec: VideoCodec::default(),
            preferred_decoders: Vec::new(),
            low_latency: true,
            realtime_priority: true,
            retry_delay_ms: default_retry_delay_ms(),
            ring_capacity: None,
            surface: None,
        }
    }
}

impl PipelineConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn format(&self) -> VideoFormat {
        VideoFormat {
            codec: self.codec,
            resolution: self.resolution(),
            low_latency: self.low_latency,
            realtime_priority: self.realtime_priority,
        }
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
            .unwrap_or_else(|| self.resolution().tier().ring_capacity())
    }

    pub fn surface(&self) -> Option<SurfaceId> {
        self.surface.map(SurfaceId)
    }
}
