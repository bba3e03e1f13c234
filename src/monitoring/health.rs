//! Pipeline health: shared counters and the periodic performance report.
//!
//! Purely observational. Nothing in here changes how packets are buffered or
//! fed; it only reads counters the other components bump and logs what it
//! sees.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::common::errors::RingError;
use crate::configs::HealthConfig;
use crate::video::buffer::PoolStats;
use crate::video::constants::LOW_FPS_RATIO;

/// Counters shared by the ring, the feeder and the decoder callbacks.
#[derive(Default)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub bytes: AtomicU64,
    pub decoded: AtomicU64,
    pub dropped: AtomicU64,
    pub queued: AtomicU64,
    pub queue_failures: AtomicU64,
    pub decoder_errors: AtomicU64,
    pub ring_resizes: AtomicU64,
    pub ring_corruptions: AtomicU64,
    pub lost_packets: AtomicU64,
    pub resets: AtomicU64,
    pub reset_storms: AtomicU64,
}

impl PipelineStats {
    pub fn record_accepted(&self, len: u32) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_ring_error(&self, err: &RingError) {
        if let RingError::Corrupted { lost_packets, .. } = err {
            self.ring_corruptions.fetch_add(1, Ordering::Relaxed);
            self.lost_packets
                .fetch_add(*lost_packets as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            bytes: load(&self.bytes),
            decoded: load(&self.decoded),
            dropped: load(&self.dropped),
            queued: load(&self.queued),
            queue_failures: load(&self.queue_failures),
            decoder_errors: load(&self.decoder_errors),
            ring_resizes: load(&self.ring_resizes),
            ring_corruptions: load(&self.ring_corruptions),
            lost_packets: load(&self.lost_packets),
            resets: load(&self.resets),
            reset_storms: load(&self.reset_storms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub bytes: u64,
    pub decoded: u64,
    pub dropped: u64,
    pub queued: u64,
    pub queue_failures: u64,
    pub decoder_errors: u64,
    pub ring_resizes: u64,
    pub ring_corruptions: u64,
    pub lost_packets: u64,
    pub resets: u64,
    pub reset_storms: u64,
}

/// Instantaneous buffer occupancy, sampled when a report is due.
#[derive(Debug, Clone, Copy)]
pub struct Gauges {
    pub ring_used: usize,
    pub ring_capacity: usize,
    pub ring_pending: u32,
    pub pool: PoolStats,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthWarning {
    LowFps { fps: f64, target: u32 },
    HighWater { used: usize, limit: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub fps: f64,
    pub drop_rate: f64,
    pub avg_packet_kb: f64,
    pub throughput_mbps: f64,
    pub window: StatsSnapshot,
    pub warnings: Vec<HealthWarning>,
}

struct Window {
    started: Instant,
    base: StatsSnapshot,
}

pub struct HealthMonitor {
    interval: u64,
    target_fps: u32,
    high_water_bytes: usize,
    window: Mutex<Window>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig, high_water_bytes: usize) -> Self {
        Self {
            interval: config.stats_interval_packets.max(1),
            target_fps: config.target_fps,
            high_water_bytes,
            window: Mutex::new(Window {
                started: Instant::now(),
                base: StatsSnapshot::default(),
            }),
        }
    }

    /// Restart the measurement window, e.g. when a decoder comes up.
    pub fn begin_window(&self, stats: &PipelineStats) {
        let mut window = self.window.lock();
        window.started = Instant::now();
        window.base = stats.snapshot();
    }

    /// Called after every accepted packet. Produces (and logs) a report every
    /// `stats_interval_packets` packets; `gauges` is only sampled then.
    pub fn observe(
        &self,
        stats: &PipelineStats,
        gauges: impl FnOnce() -> Gauges,
    ) -> Option<HealthReport> {
        let received = stats.received.load(Ordering::Relaxed);
        if received == 0 || received % self.interval != 0 {
            return None;
        }

        let current = stats.snapshot();
        let (elapsed, window) = {
            let mut w = self.window.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(w.started);
            let window = delta(&current, &w.base);
            w.started = now;
            w.base = current;
            (elapsed, window)
        };

        let report = self.build_report(elapsed, window, current.received, gauges());
        log_report(&report, &current, self.target_fps);
        Some(report)
    }

    fn build_report(
        &self,
        elapsed: Duration,
        window: StatsSnapshot,
        total_received: u64,
        gauges: Gauges,
    ) -> HealthReport {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);

        let fps = window.decoded as f64 / secs;
        let drop_rate = if window.dropped > 0 {
            window.dropped as f64 / (window.received + window.dropped) as f64 * 100.0
        } else {
            0.0
        };
        let avg_packet_kb = if window.received > 0 {
            window.bytes as f64 / window.received as f64 / 1024.0
        } else {
            0.0
        };
        let throughput_mbps = window.bytes as f64 * 8.0 / (secs * 1_000_000.0);

        let mut warnings = Vec::new();
        if total_received > 2 * self.interval && fps < self.target_fps as f64 * LOW_FPS_RATIO {
            warnings.push(HealthWarning::LowFps {
                fps,
                target: self.target_fps,
            });
        }
        if gauges.ring_used > self.high_water_bytes {
            warnings.push(HealthWarning::HighWater {
                used: gauges.ring_used,
                limit: self.high_water_bytes,
            });
        }

        info!(
            "[PERF] Ring: {}/{} bytes ({} pending), Pool: {} idle / {} max, {} out, {} expansions",
            gauges.ring_used,
            gauges.ring_capacity,
            gauges.ring_pending,
            gauges.pool.idle,
            gauges.pool.max_buffers,
            gauges.pool.outstanding,
            gauges.pool.expansions
        );

        HealthReport {
            fps,
            drop_rate,
            avg_packet_kb,
            throughput_mbps,
            window,
            warnings,
        }
    }
}

fn delta(now: &StatsSnapshot, base: &StatsSnapshot) -> StatsSnapshot {
    StatsSnapshot {
        received: now.received.saturating_sub(base.received),
        bytes: now.bytes.saturating_sub(base.bytes),
        decoded: now.decoded.saturating_sub(base.decoded),
        dropped: now.dropped.saturating_sub(base.dropped),
        queued: now.queued.saturating_sub(base.queued),
        queue_failures: now.queue_failures.saturating_sub(base.queue_failures),
        decoder_errors: now.decoder_errors.saturating_sub(base.decoder_errors),
        ring_resizes: now.ring_resizes.saturating_sub(base.ring_resizes),
        ring_corruptions: now.ring_corruptions.saturating_sub(base.ring_corruptions),
        lost_packets: now.lost_packets.saturating_sub(base.lost_packets),
        resets: now.resets.saturating_sub(base.resets),
        reset_storms: now.reset_storms.saturating_sub(base.reset_storms),
    }
}

fn log_report(report: &HealthReport, totals: &StatsSnapshot, target_fps: u32) {
    let w = &report.window;
    info!(
        "[PERF] FPS: {:.1}/{}, Frames: R:{}/D:{}/Drop:{}, DropRate: {:.1}%, AvgSize: {:.1}KB, Throughput: {:.1}Mbps, Resets: {}",
        report.fps,
        target_fps,
        w.received,
        w.decoded,
        w.dropped,
        report.drop_rate,
        report.avg_packet_kb,
        report.throughput_mbps,
        totals.resets
    );

    for warning in &report.warnings {
        match warning {
            HealthWarning::LowFps { fps, target } => {
                warn!("[PERF] Low FPS: {:.1} (target {})", fps, target)
            }
            HealthWarning::HighWater { used, limit } => warn!(
                "[PERF] Ring backlog {} bytes above high-water mark {} bytes",
                used, limit
            ),
        }
    }
}

/// Detects bursts of resets: `threshold` resets with less than `window`
/// between consecutive ones.
pub struct ResetTracker {
    threshold: u32,
    window: Duration,
    state: Mutex<(Option<Instant>, u32)>,
}

impl ResetTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            state: Mutex::new((None, 0)),
        }
    }

    /// Record a reset at `now`. Returns `true` when it completes a storm.
    pub fn record(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        let (last, count) = &mut *state;

        if last.is_some_and(|t| now.saturating_duration_since(t) > self.window) {
            *count = 0;
        }
        *count += 1;
        *last = Some(now);

        if *count >= self.threshold {
            error!(
                "Reset storm: {} decoder resets within {:?} of each other",
                count, self.window
            );
            *count = 0;
            true
        } else {
            false
        }
    }
}
