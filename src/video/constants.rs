//! Central constants for the video pipeline.
//!
//! Magic numbers in `src/video/**` live here so they can be tuned in one
//! place and remain consistent across modules.

// ── Packet framing ───────────────────────────────────────────────────────────

/// Bytes of framing in front of every packet: `u32` length + `u32` skip count.
pub const PACKET_HEADER_LEN: usize = 8;

/// Smallest ring store we will allocate. Growth doubles, so it must be > 0.
pub const MIN_RING_CAPACITY: usize = 2 * PACKET_HEADER_LEN;

// ── Resolution tiers ─────────────────────────────────────────────────────────

pub const MIB: usize = 1_024 * 1_024;
pub const KIB: usize = 1_024;

/// Pixel ceilings for each tier (inclusive).
pub const HD_PIXELS: u64 = 1_920 * 1_080;
pub const WIDE_PIXELS: u64 = 2_400 * 960;
pub const UHD_PIXELS: u64 = 3_840 * 2_160;

// ── Transport ingest ─────────────────────────────────────────────────────────

/// Largest single read issued against a transport while filling a packet.
pub const INGEST_CHUNK_LIMIT: usize = 16_384;

/// Prefix the car-side transport puts in front of every video payload.
pub const TRANSPORT_VIDEO_SKIP: u32 = 20;

// ── Decoder lifecycle ────────────────────────────────────────────────────────

/// Delay before the single retry that follows a failed decoder configure.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Slots the loopback decoder advertises right after `start()`.
pub const LOOPBACK_INPUT_SLOTS: u32 = 8;

// ── Health ───────────────────────────────────────────────────────────────────

/// Accepted packets between two health reports (~1 s at 60 fps).
pub const DEFAULT_STATS_INTERVAL: u64 = 60;

pub const DEFAULT_TARGET_FPS: u32 = 60;

/// Fraction of target fps below which a report carries a low-fps warning.
pub const LOW_FPS_RATIO: f64 = 0.92;

pub const DEFAULT_RESET_STORM_THRESHOLD: u32 = 3;
pub const DEFAULT_RESET_STORM_WINDOW_MS: u64 = 30_000;
