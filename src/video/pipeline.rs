//! Session controller tying the ring, the feeder and the decoder together.
//!
//! A [`VideoPipeline`] owns one packet ring, one buffer pool and at most one
//! decoder at a time. The host pushes packets with [`VideoPipeline::submit`]
//! and drives the lifecycle with `start`/`stop`/`reset`; everything else
//! happens on the session's worker threads.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use flume::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::common::errors::{DecoderError, RingError};
use crate::configs::Config;
use crate::monitoring::{Gauges, HealthMonitor, PipelineStats, ResetTracker, StatsSnapshot};
use crate::video::buffer::{BufferPool, PacketRing, SharedBufferPool, WriteOutcome};
use crate::video::constants::INGEST_CHUNK_LIMIT;
use crate::video::decoder::{ActiveDecoder, DecoderBackend, EventSink, VideoDecoder, create_decoder};
use crate::video::feed::{FeedCommand, FeedLoop, FeederState, SlotQueue, StateCell};
use crate::video::format::{SurfaceId, VideoFormat};
use crate::video::release::{ReleaseCommand, ReleaseLoop};
use crate::video::worker::WorkerPool;

/// State reachable from the worker loops and from decoder callbacks.
pub(crate) struct SessionShared {
    pub(crate) ring: Mutex<PacketRing>,
    pub(crate) slots: SlotQueue,
    pub(crate) pool: SharedBufferPool,
    pub(crate) decoder: ActiveDecoder,
    pub(crate) state: StateCell,
    pub(crate) stats: Arc<PipelineStats>,
}

impl SessionShared {
    /// Halt feeding after a fatal error from the decoder of `generation`.
    pub(crate) fn fail(&self, generation: u64) {
        if !self.decoder.is_current(generation) {
            return;
        }
        // A decoder can report a fatal error from inside `start()`, before
        // the session has been promoted to Running.
        let failed = self
            .state
            .transition(FeederState::Running, FeederState::Failed)
            || self
                .state
                .transition(FeederState::Configuring, FeederState::Failed);
        if failed {
            error!(
                "Decoder generation {} failed, feeding halted until reset",
                generation
            );
            self.slots.clear();
        }
    }
}

struct PipelineInner {
    shared: Arc<SessionShared>,
    backend: Arc<dyn DecoderBackend>,
    format: VideoFormat,
    surface: Option<SurfaceId>,
    preferred: Vec<String>,
    retry_delay: Duration,
    health: HealthMonitor,
    resets: ResetTracker,
    feed_tx: Sender<FeedCommand>,
    release_tx: Sender<ReleaseCommand>,
    workers: WorkerPool,
    /// Serialises start/stop so a delayed retry never races the host.
    control: Mutex<()>,
    wants_running: AtomicBool,
    retry_pending: AtomicBool,
}

pub struct VideoPipeline {
    inner: Arc<PipelineInner>,
}

impl VideoPipeline {
    pub fn new(config: &Config, backend: Arc<dyn DecoderBackend>) -> io::Result<Self> {
        let pipeline = &config.pipeline;
        let format = pipeline.format();
        let ring_capacity = pipeline.ring_capacity();

        info!(
            "Creating video pipeline: {} {:?}, ring {} bytes, tier {:?}",
            format.resolution,
            format.codec,
            ring_capacity,
            format.resolution.tier()
        );

        let stats = Arc::new(PipelineStats::default());
        let shared = Arc::new(SessionShared {
            ring: Mutex::new(PacketRing::new(ring_capacity)),
            slots: SlotQueue::default(),
            pool: BufferPool::for_resolution(format.resolution),
            decoder: ActiveDecoder::default(),
            state: StateCell::default(),
            stats,
        });

        let (feed_tx, feed_rx) = flume::unbounded();
        let (release_tx, release_rx) = flume::unbounded();

        let workers = WorkerPool::new("vidring");
        let feed = FeedLoop::new(shared.clone(), feed_rx);
        workers.spawn("feed", move || feed.run())?;
        let release = ReleaseLoop::new(shared.clone(), release_rx);
        workers.spawn("release", move || release.run())?;

        let health = &config.health;
        let inner = Arc::new(PipelineInner {
            shared,
            backend,
            surface: pipeline.surface(),
            preferred: pipeline.preferred_decoders.clone(),
            retry_delay: Duration::from_millis(pipeline.retry_delay_ms),
            health: HealthMonitor::new(health, health.high_water_bytes.unwrap_or(ring_capacity)),
            resets: ResetTracker::new(
                health.reset_storm_threshold,
                Duration::from_millis(health.reset_storm_window_ms),
            ),
            format,
            feed_tx,
            release_tx,
            workers,
            control: Mutex::new(()),
            wants_running: AtomicBool::new(false),
            retry_pending: AtomicBool::new(false),
        });

        Ok(Self { inner })
    }

    /// Bring up a decoder. Does nothing unless the pipeline is idle.
    ///
    /// A failed start leaves the pipeline idle and schedules one retry after
    /// `retry_delay_ms`.
    pub fn start(&self) {
        self.inner.wants_running.store(true, Ordering::SeqCst);
        self.inner.start_attempt(true);
    }

    /// Release the decoder and drop every pending packet and slot.
    pub fn stop(&self) {
        self.inner.wants_running.store(false, Ordering::SeqCst);
        self.inner.stop_decoder();
    }

    /// Tear the decoder down and bring up a fresh one. This is the only way
    /// out of [`FeederState::Failed`].
    pub fn reset(&self) {
        let stats = &self.inner.shared.stats;
        let count = stats.resets.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Resetting video decoder (reset #{})", count);

        if self.inner.resets.record(Instant::now()) {
            stats.reset_storms.fetch_add(1, Ordering::Relaxed);
        }

        self.stop();
        self.start();
    }

    /// Append one framed packet and wake the feeder.
    ///
    /// `writer` fills the `total_len`-byte payload region in place; the first
    /// `skip` bytes are trimmed off when the packet is fed to the decoder.
    pub fn submit<F>(&self, total_len: u32, skip: u32, writer: F) -> Result<WriteOutcome, RingError>
    where
        F: FnOnce(&mut [u8]) -> io::Result<()>,
    {
        let inner = &self.inner;
        let stats = &inner.shared.stats;

        let result = inner.shared.ring.lock().write(total_len, skip, writer);
        let outcome = result.inspect_err(|e| stats.record_ring_error(e))?;

        if outcome.resized_to.is_some() {
            stats.ring_resizes.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.lost_packets > 0 {
            stats.ring_corruptions.fetch_add(1, Ordering::Relaxed);
            stats
                .lost_packets
                .fetch_add(outcome.lost_packets as u64, Ordering::Relaxed);
        }
        stats.record_accepted(total_len);

        let _ = inner.feed_tx.send(FeedCommand::Drain);
        inner.health.observe(stats, || inner.gauges());

        Ok(outcome)
    }

    /// [`submit`](Self::submit) a packet whose bytes come straight from a
    /// transport, read in chunks of at most 16 KiB.
    pub fn submit_from_reader<R>(&self, total_len: u32, skip: u32, reader: &mut R) -> Result<WriteOutcome, RingError>
    where
        R: Read + ?Sized,
    {
        self.submit(total_len, skip, |dest| {
            for chunk in dest.chunks_mut(INGEST_CHUNK_LIMIT) {
                reader.read_exact(chunk)?;
            }
            Ok(())
        })
    }

    pub fn state(&self) -> FeederState {
        self.inner.shared.state.get()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.shared.stats.snapshot()
    }

    pub fn reset_count(&self) -> u64 {
        self.inner.shared.stats.resets.load(Ordering::Relaxed)
    }

    pub fn gauges(&self) -> Gauges {
        self.inner.gauges()
    }

    pub fn format(&self) -> &VideoFormat {
        &self.inner.format
    }
}

impl PipelineInner {
    fn gauges(&self) -> Gauges {
        let (ring_used, ring_capacity, ring_pending) = {
            let ring = self.shared.ring.lock();
            (
                ring.used_bytes(),
                ring.capacity(),
                ring.available_packets_to_read(),
            )
        };
        Gauges {
            ring_used,
            ring_capacity,
            ring_pending,
            pool: self.shared.pool.stats(),
        }
    }

    fn start_attempt(self: &Arc<Self>, allow_retry: bool) -> bool {
        let _control = self.control.lock();
        let shared = &self.shared;

        if !self.wants_running.load(Ordering::SeqCst) {
            debug!("Decoder start skipped: pipeline was stopped");
            return false;
        }
        if !shared
            .state
            .transition(FeederState::Idle, FeederState::Configuring)
        {
            debug!("Decoder start ignored in state {:?}", shared.state.get());
            return false;
        }

        shared.slots.clear();
        self.health.begin_window(&shared.stats);

        match self.open_decoder() {
            Ok(generation) => {
                if !shared
                    .state
                    .transition(FeederState::Configuring, FeederState::Running)
                {
                    warn!(
                        "Decoder generation {} failed while starting, staying {:?}",
                        generation,
                        shared.state.get()
                    );
                    return false;
                }
                debug!("Feeder running for decoder generation {}", generation);
                let _ = self.feed_tx.send(FeedCommand::Drain);
                true
            }
            Err(e) => {
                error!("Failed to start video decoder: {}", e);
                shared.state.set(FeederState::Idle);
                if allow_retry {
                    self.schedule_retry();
                }
                false
            }
        }
    }

    fn open_decoder(&self) -> Result<u64, DecoderError> {
        let shared = &self.shared;
        let generation = shared.decoder.reserve();
        let events = EventSink::new(
            generation,
            Arc::downgrade(shared),
            self.feed_tx.clone(),
            self.release_tx.clone(),
        );

        let decoder: Arc<dyn VideoDecoder> = Arc::from(create_decoder(
            self.backend.as_ref(),
            &self.preferred,
            self.format.codec,
            &events,
        )?);

        if let Err(e) = decoder.configure(&self.format, self.surface) {
            let _ = decoder.release();
            return Err(e);
        }

        shared.decoder.install(generation, decoder.clone());
        if let Err(e) = decoder.start() {
            shared.decoder.take();
            let _ = decoder.release();
            return Err(e);
        }

        info!(
            "Decoder {} started: {} {:?} (low latency: {}, realtime: {})",
            decoder.name(),
            self.format.resolution,
            self.format.codec,
            self.format.low_latency,
            self.format.realtime_priority
        );
        Ok(generation)
    }

    fn schedule_retry(self: &Arc<Self>) {
        if self.retry_pending.swap(true, Ordering::AcqRel) {
            debug!("Decoder retry already pending");
            return;
        }

        warn!("Retrying decoder start in {:?}", self.retry_delay);
        let weak: Weak<Self> = Arc::downgrade(self);
        let scheduled = self.workers.schedule_once("retry", self.retry_delay, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.retry_pending.store(false, Ordering::Release);
            inner.start_attempt(false);
        });

        if let Err(e) = scheduled {
            self.retry_pending.store(false, Ordering::Release);
            error!("Could not schedule decoder retry: {}", e);
        }
    }

    fn stop_decoder(&self) {
        let _control = self.control.lock();
        let shared = &self.shared;

        shared.state.set(FeederState::Stopping);

        if let Some(decoder) = shared.decoder.take() {
            if let Err(e) = decoder.stop() {
                warn!("Error stopping decoder {}: {}", decoder.name(), e);
            }
            if let Err(e) = decoder.release() {
                warn!("Error releasing decoder {}: {}", decoder.name(), e);
            }
            info!("Decoder {} released", decoder.name());
        }

        shared.slots.clear();
        shared.ring.lock().clear();
        shared.pool.clear();
        shared.state.set(FeederState::Idle);
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.workers.cancel_scheduled();
        inner.wants_running.store(false, Ordering::SeqCst);
        inner.stop_decoder();

        let _ = inner.feed_tx.send(FeedCommand::Shutdown);
        let _ = inner.release_tx.send(ReleaseCommand::Shutdown);
        inner.workers.join();
        debug!("Video pipeline shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::thread;

    use crate::video::decoder::{DecoderCall, InputSlot, LoopbackBackend, OutputSlot};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.pipeline.width = 1280;
        config.pipeline.height = 720;
        config.pipeline.ring_capacity = Some(4_096);
        config.pipeline.retry_delay_ms = 20;
        config
    }

    fn pipeline(backend: &Arc<LoopbackBackend>, config: &Config) -> VideoPipeline {
        VideoPipeline::new(config, backend.clone()).unwrap()
    }

    fn submit_bytes(pipeline: &VideoPipeline, data: &[u8], skip: u32) {
        pipeline
            .submit(data.len() as u32, skip, |dest| {
                dest.copy_from_slice(data);
                Ok(())
            })
            .unwrap();
    }

    fn queued(backend: &LoopbackBackend) -> usize {
        backend
            .journal()
            .count(|c| matches!(c, DecoderCall::QueueInput { .. }))
    }

    #[test]
    fn packets_reach_decoder_in_order() {
        let backend = Arc::new(LoopbackBackend::auto_cycle());
        let pipeline = pipeline(&backend, &test_config());
        pipeline.start();
        assert_eq!(pipeline.state(), FeederState::Running);

        let packets: Vec<Vec<u8>> = (0..20u8)
            .map(|i| (0..(10 + i as usize * 7)).map(|b| b as u8 ^ i).collect())
            .collect();
        for p in &packets {
            submit_bytes(&pipeline, p, 2);
        }

        assert!(wait_until(|| pipeline.stats().decoded == 20));
        let expected: Vec<Vec<u8>> = packets.iter().map(|p| p[2..].to_vec()).collect();
        assert_eq!(backend.journal().queued_inputs(), expected);

        assert!(wait_until(|| backend.journal().released_outputs().len() == 20));
        assert!(backend.journal().released_outputs().iter().all(|(_, r)| *r));
        assert_eq!(pipeline.stats().received, 20);
    }

    #[test]
    fn packets_submitted_before_start_are_kept() {
        let backend = Arc::new(LoopbackBackend::auto_cycle());
        let pipeline = pipeline(&backend, &test_config());

        submit_bytes(&pipeline, b"early", 0);
        assert_eq!(pipeline.gauges().ring_pending, 1);

        pipeline.start();
        assert!(wait_until(|| queued(&backend) == 1));
        assert_eq!(backend.journal().queued_inputs(), vec![b"early".to_vec()]);
    }

    #[test]
    fn fatal_error_halts_feeding_until_reset() {
        let backend = Arc::new(LoopbackBackend::manual());
        let pipeline = pipeline(&backend, &test_config());
        pipeline.start();

        let sink = backend.last_sink().unwrap();
        sink.input_slot_available(InputSlot(0));
        submit_bytes(&pipeline, b"first", 0);
        assert!(wait_until(|| queued(&backend) == 1));

        sink.error(false, false, "hardware fault");
        assert_eq!(pipeline.state(), FeederState::Failed);

        sink.input_slot_available(InputSlot(1));
        submit_bytes(&pipeline, b"second", 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queued(&backend), 1);

        pipeline.reset();
        assert_eq!(pipeline.state(), FeederState::Running);
        assert_eq!(pipeline.reset_count(), 1);

        let fresh = backend.last_sink().unwrap();
        assert_ne!(fresh.generation(), sink.generation());
        fresh.input_slot_available(InputSlot(0));
        submit_bytes(&pipeline, b"third", 0);
        assert!(wait_until(|| queued(&backend) == 2));
        assert_eq!(backend.journal().queued_inputs()[1], b"third".to_vec());
    }

    #[test]
    fn fatal_error_during_start_is_not_lost() {
        let backend = Arc::new(LoopbackBackend::auto_cycle().fatal_on_start());
        let pipeline = pipeline(&backend, &test_config());

        pipeline.start();
        assert_eq!(pipeline.state(), FeederState::Failed);
        assert_eq!(pipeline.stats().decoder_errors, 1);

        submit_bytes(&pipeline, b"never fed", 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queued(&backend), 0);

        // Starting again does not paper over the failure; only reset does.
        pipeline.start();
        assert_eq!(pipeline.state(), FeederState::Failed);
        assert_eq!(backend.created(), 1);

        pipeline.reset();
        assert_eq!(backend.created(), 2);
        assert_eq!(pipeline.state(), FeederState::Failed);
    }

    #[test]
    fn rejected_input_is_counted_and_not_fatal() {
        let backend = Arc::new(LoopbackBackend::manual());
        let pipeline = pipeline(&backend, &test_config());
        pipeline.start();

        let sink = backend.last_sink().unwrap();
        sink.input_slot_available(InputSlot(99));
        submit_bytes(&pipeline, b"dropped", 0);
        assert!(wait_until(|| pipeline.stats().queue_failures == 1));
        assert_eq!(pipeline.state(), FeederState::Running);

        sink.input_slot_available(InputSlot(0));
        submit_bytes(&pipeline, b"accepted", 0);
        assert!(wait_until(|| queued(&backend) == 1));
        assert_eq!(backend.journal().queued_inputs(), vec![b"accepted".to_vec()]);
    }

    #[test]
    fn recoverable_errors_keep_running() {
        let backend = Arc::new(LoopbackBackend::manual());
        let pipeline = pipeline(&backend, &test_config());
        pipeline.start();

        let sink = backend.last_sink().unwrap();
        sink.error(true, false, "recoverable");
        sink.error(false, true, "transient");
        assert_eq!(pipeline.state(), FeederState::Running);
        assert_eq!(pipeline.stats().decoder_errors, 2);
    }

    #[test]
    fn render_flag_follows_size_hint() {
        let backend = Arc::new(LoopbackBackend::manual());
        let pipeline = pipeline(&backend, &test_config());
        pipeline.start();

        let sink = backend.last_sink().unwrap();
        sink.output_ready(OutputSlot(3), 0);
        sink.output_ready(OutputSlot(4), 1_024);

        assert!(wait_until(|| backend.journal().released_outputs().len() == 2));
        assert_eq!(
            backend.journal().released_outputs(),
            vec![(OutputSlot(3), false), (OutputSlot(4), true)]
        );
        let stats = pipeline.stats();
        assert_eq!((stats.decoded, stats.dropped), (1, 1));
    }

    #[test]
    fn stale_decoder_events_are_ignored() {
        let backend = Arc::new(LoopbackBackend::manual());
        let pipeline = pipeline(&backend, &test_config());
        pipeline.start();
        let stale = backend.last_sink().unwrap();

        pipeline.reset();
        assert!(!stale.is_current());

        stale.output_ready(OutputSlot(1), 100);
        stale.input_slot_available(InputSlot(5));
        stale.error(false, false, "late");
        submit_bytes(&pipeline, b"pending", 0);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(pipeline.state(), FeederState::Running);
        assert!(backend.journal().released_outputs().is_empty());
        assert_eq!(queued(&backend), 0);
        assert_eq!(pipeline.stats().decoder_errors, 0);
    }

    #[test]
    fn failed_start_retries_once_after_delay() {
        let backend = Arc::new(LoopbackBackend::auto_cycle().failing_first(1));
        let pipeline = pipeline(&backend, &test_config());

        pipeline.start();
        assert_eq!(pipeline.state(), FeederState::Idle);
        assert_eq!(backend.created(), 0);

        assert!(wait_until(|| pipeline.state() == FeederState::Running));
        assert_eq!(backend.created(), 1);
    }

    #[test]
    fn failed_retry_is_not_repeated() {
        let backend = Arc::new(LoopbackBackend::auto_cycle().failing_first(2));
        let pipeline = pipeline(&backend, &test_config());

        pipeline.start();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(pipeline.state(), FeederState::Idle);
        assert_eq!(backend.created(), 0);

        pipeline.start();
        assert_eq!(pipeline.state(), FeederState::Running);
    }

    #[test]
    fn stop_cancels_pending_retry() {
        let backend = Arc::new(LoopbackBackend::auto_cycle().failing_first(1));
        let mut config = test_config();
        config.pipeline.retry_delay_ms = 40;
        let pipeline = pipeline(&backend, &config);

        pipeline.start();
        pipeline.stop();
        thread::sleep(Duration::from_millis(150));

        assert_eq!(pipeline.state(), FeederState::Idle);
        assert_eq!(backend.created(), 0);
    }

    #[test]
    fn preferred_decoder_is_tried_first() {
        let backend = Arc::new(LoopbackBackend::manual().with_named("c2.intel.avc.decoder"));
        let mut config = test_config();
        config.pipeline.preferred_decoders =
            vec!["c2.vendor.missing".into(), "c2.intel.avc.decoder".into()];
        let pipeline = pipeline(&backend, &config);
        pipeline.start();

        let entries = backend.journal().entries();
        assert_eq!(entries[0].decoder, "c2.intel.avc.decoder");
        assert!(matches!(
            &entries[0].call,
            DecoderCall::Configure { format, .. } if format.low_latency
        ));
    }

    #[test]
    fn stop_releases_decoder_and_clears_ring() {
        let backend = Arc::new(LoopbackBackend::manual());
        let pipeline = pipeline(&backend, &test_config());
        pipeline.start();

        for _ in 0..3 {
            submit_bytes(&pipeline, &[7; 64], 0);
        }
        assert_eq!(pipeline.gauges().ring_pending, 3);

        pipeline.stop();
        assert_eq!(pipeline.state(), FeederState::Idle);
        assert_eq!(pipeline.gauges().ring_pending, 0);

        let journal = backend.journal();
        assert_eq!(journal.count(|c| *c == DecoderCall::Stop), 1);
        assert_eq!(journal.count(|c| *c == DecoderCall::Release), 1);
    }

    #[test]
    fn reader_ingest_skips_transport_prefix() {
        let backend = Arc::new(LoopbackBackend::auto_cycle());
        let pipeline = pipeline(&backend, &test_config());
        pipeline.start();

        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = Cursor::new(data.clone());
        let outcome = pipeline
            .submit_from_reader(data.len() as u32, 20, &mut reader)
            .unwrap();
        assert!(outcome.resized_to.is_some());

        assert!(wait_until(|| queued(&backend) == 1));
        assert_eq!(backend.journal().queued_inputs()[0], data[20..].to_vec());
        assert_eq!(pipeline.stats().ring_resizes, 1);
    }

    #[test]
    fn short_reader_is_rejected() {
        let backend = Arc::new(LoopbackBackend::manual());
        let pipeline = pipeline(&backend, &test_config());

        let mut reader = Cursor::new(vec![1u8; 10]);
        let err = pipeline.submit_from_reader(100, 0, &mut reader).unwrap_err();
        assert!(matches!(err, RingError::Writer(_)));
        assert_eq!(pipeline.gauges().ring_pending, 0);
        assert_eq!(pipeline.stats().received, 0);
    }

    #[test]
    fn invalid_frame_is_rejected() {
        let backend = Arc::new(LoopbackBackend::manual());
        let pipeline = pipeline(&backend, &test_config());

        let err = pipeline.submit(4, 5, |_| Ok(())).unwrap_err();
        assert!(matches!(err, RingError::InvalidFrame { total_len: 4, skip: 5 }));
    }
}
