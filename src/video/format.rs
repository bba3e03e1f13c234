//! Stream format description shared by the buffers and the decoder boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::video::constants::{HD_PIXELS, KIB, MIB, UHD_PIXELS, WIDE_PIXELS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn tier(self) -> ResolutionTier {
        match self.pixels() {
            p if p <= HD_PIXELS => ResolutionTier::Hd,
            p if p <= WIDE_PIXELS => ResolutionTier::Wide,
            p if p <= UHD_PIXELS => ResolutionTier::Uhd,
            _ => ResolutionTier::Extreme,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Buffer sizing bucket, fixed once per session from the negotiated resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    /// Up to 1920x1080.
    Hd,
    /// Up to 2400x960, the widescreen head-unit panel.
    Wide,
    /// Up to 3840x2160.
    Uhd,
    Extreme,
}

impl ResolutionTier {
    /// Initial packet ring size: roughly 2-3 s of high-bitrate video.
    pub fn ring_capacity(self) -> usize {
        match self {
            Self::Hd => 8 * MIB,
            Self::Wide => 16 * MIB,
            Self::Uhd => 32 * MIB,
            Self::Extreme => 64 * MIB,
        }
    }

    pub fn pool_buffer_size(self) -> usize {
        match self {
            Self::Hd => 512 * KIB,
            Self::Wide => MIB,
            Self::Uhd => 2 * MIB,
            Self::Extreme => 4 * MIB,
        }
    }

    pub fn pool_max_buffers(self) -> usize {
        match self {
            Self::Hd => 8,
            Self::Wide => 12,
            Self::Uhd => 16,
            Self::Extreme => 24,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
}

impl VideoCodec {
    pub fn mime(self) -> &'static str {
        match self {
            Self::H264 => "video/avc",
            Self::H265 => "video/hevc",
        }
    }
}

/// What the decoder is configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub codec: VideoCodec,
    pub resolution: Resolution,
    pub low_latency: bool,
    pub realtime_priority: bool,
}

/// Opaque handle of the surface decoded frames are rendered onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// Output format reported by the decoder after it has parsed the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub width: u32,
    pub height: u32,
    pub color_format: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_follow_pixel_count() {
        assert_eq!(Resolution::new(1280, 720).tier(), ResolutionTier::Hd);
        assert_eq!(Resolution::new(1920, 1080).tier(), ResolutionTier::Hd);
        assert_eq!(Resolution::new(2400, 960).tier(), ResolutionTier::Wide);
        assert_eq!(Resolution::new(3840, 2160).tier(), ResolutionTier::Uhd);
        assert_eq!(Resolution::new(7680, 4320).tier(), ResolutionTier::Extreme);
    }

    #[test]
    fn larger_tiers_get_larger_buffers() {
        let tiers = [
            ResolutionTier::Hd,
            ResolutionTier::Wide,
            ResolutionTier::Uhd,
            ResolutionTier::Extreme,
        ];
        for pair in tiers.windows(2) {
            assert!(pair[0].ring_capacity() < pair[1].ring_capacity());
            assert!(pair[0].pool_buffer_size() < pair[1].pool_buffer_size());
            assert!(pair[0].pool_max_buffers() < pair[1].pool_max_buffers());
        }
    }

    #[test]
    fn codec_mime_types() {
        assert_eq!(VideoCodec::H264.mime(), "video/avc");
        assert_eq!(VideoCodec::H265.mime(), "video/hevc");
    }
}
