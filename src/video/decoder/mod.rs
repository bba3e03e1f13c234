//! Boundary to the hardware decoder.
//!
//! A [`DecoderBackend`] creates decoders; each decoder gets an [`EventSink`]
//! tagged with a generation number. The session bumps the generation every
//! time it replaces the decoder, so callbacks from a decoder that has been
//! stopped or replaced are recognised and ignored.

pub mod loopback;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use flume::Sender;
use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::common::errors::DecoderError;
use crate::video::feed::FeedCommand;
use crate::video::format::{FormatDescriptor, SurfaceId, VideoCodec, VideoFormat};
use crate::video::pipeline::SessionShared;
use crate::video::release::ReleaseCommand;

pub use loopback::{DecoderCall, Journal, JournalEntry, LoopbackBackend, LoopbackDecoder};

/// Decoder-owned input buffer index, offered through
/// [`EventSink::input_slot_available`] and consumed by exactly one feed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputSlot(pub u32);

/// Decoder-owned output buffer index carried by [`EventSink::output_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSlot(pub u32);

/// One hardware (or emulated) decoder instance.
///
/// Methods take `&self`: the feed thread, the release thread and the control
/// thread all call into the same instance.
pub trait VideoDecoder: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&self, format: &VideoFormat, surface: Option<SurfaceId>) -> Result<(), DecoderError>;

    fn start(&self) -> Result<(), DecoderError>;

    /// Copy `data` into the decoder buffer behind `slot` and submit it.
    fn queue_input(&self, slot: InputSlot, data: &[u8]) -> Result<(), DecoderError>;

    fn release_output(&self, slot: OutputSlot, render: bool) -> Result<(), DecoderError>;

    fn stop(&self) -> Result<(), DecoderError>;

    fn release(&self) -> Result<(), DecoderError>;
}

pub trait DecoderBackend: Send + Sync {
    /// Create a specific decoder implementation, e.g. a vendor accelerator.
    fn create_by_name(&self, name: &str, events: EventSink) -> Result<Box<dyn VideoDecoder>, DecoderError>;

    /// Create whatever decoder the platform offers for `mime`.
    fn create_by_type(&self, mime: &str, events: EventSink) -> Result<Box<dyn VideoDecoder>, DecoderError>;
}

/// Try each preferred decoder by name, then fall back to the generic decoder
/// for the codec's mime type.
pub fn create_decoder(
    backend: &dyn DecoderBackend,
    preferred: &[String],
    codec: VideoCodec,
    events: &EventSink,
) -> Result<Box<dyn VideoDecoder>, DecoderError> {
    for name in preferred {
        match backend.create_by_name(name, events.clone()) {
            Ok(decoder) => {
                info!("Using preferred decoder: {}", name);
                return Ok(decoder);
            }
            Err(e) => debug!("Preferred decoder {} not available: {}", name, e),
        }
    }

    backend
        .create_by_type(codec.mime(), events.clone())
        .map_err(|e| DecoderError::Unavailable(format!("no {} decoder: {}", codec.mime(), e)))
}

/// The decoder currently owned by the session, tagged with its generation.
///
/// Generation `0` means no decoder is installed.
pub struct ActiveDecoder {
    generation: AtomicU64,
    next_generation: AtomicU64,
    current: RwLock<Option<Arc<dyn VideoDecoder>>>,
}

impl Default for ActiveDecoder {
    fn default() -> Self {
        Self {
            generation: AtomicU64::new(0),
            next_generation: AtomicU64::new(0),
            current: RwLock::new(None),
        }
    }
}

impl ActiveDecoder {
    /// Allocate the generation number for the next decoder.
    pub fn reserve(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn install(&self, generation: u64, decoder: Arc<dyn VideoDecoder>) {
        let mut current = self.current.write();
        *current = Some(decoder);
        self.generation.store(generation, Ordering::Release);
    }

    pub fn take(&self) -> Option<Arc<dyn VideoDecoder>> {
        let mut current = self.current.write();
        self.generation.store(0, Ordering::Release);
        current.take()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation != 0 && self.generation.load(Ordering::Acquire) == generation
    }

    /// The decoder for `generation`, if it is still the active one.
    pub fn get(&self, generation: u64) -> Option<Arc<dyn VideoDecoder>> {
        let current = self.current.read();
        if self.is_current(generation) {
            current.clone()
        } else {
            None
        }
    }

    pub fn current(&self) -> Option<(u64, Arc<dyn VideoDecoder>)> {
        let current = self.current.read();
        let generation = self.generation.load(Ordering::Acquire);
        current.clone().map(|d| (generation, d))
    }
}

/// Callback surface handed to a decoder at creation.
///
/// Every method first checks that the decoder it was created for is still
/// the active one and does nothing otherwise.
#[derive(Clone)]
pub struct EventSink {
    generation: u64,
    shared: Weak<SessionShared>,
    feed_tx: Sender<FeedCommand>,
    release_tx: Sender<ReleaseCommand>,
}

impl EventSink {
    pub(crate) fn new(
        generation: u64,
        shared: Weak<SessionShared>,
        feed_tx: Sender<FeedCommand>,
        release_tx: Sender<ReleaseCommand>,
    ) -> Self {
        Self {
            generation,
            shared,
            feed_tx,
            release_tx,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.active_session().is_some()
    }

    fn active_session(&self) -> Option<Arc<SessionShared>> {
        let shared = self.shared.upgrade()?;
        shared
            .decoder
            .is_current(self.generation)
            .then_some(shared)
    }

    /// The decoder can take another compressed packet in `slot`.
    pub fn input_slot_available(&self, slot: InputSlot) {
        let Some(shared) = self.active_session() else {
            trace!("Ignoring input slot {:?} from stale decoder", slot);
            return;
        };
        shared.slots.push(self.generation, slot);
        let _ = self.feed_tx.send(FeedCommand::Drain);
    }

    /// A decoded buffer is ready. `size_hint == 0` marks a buffer with
    /// nothing to show (end of stream, empty frame).
    pub fn output_ready(&self, slot: OutputSlot, size_hint: usize) {
        let Some(shared) = self.active_session() else {
            trace!("Ignoring output slot {:?} from stale decoder", slot);
            return;
        };

        let render = size_hint > 0;
        if render {
            shared.stats.decoded.fetch_add(1, Ordering::Relaxed);
        } else {
            shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }

        let _ = self.release_tx.send(ReleaseCommand::Release {
            generation: self.generation,
            slot,
            render,
        });
    }

    pub fn format_changed(&self, format: FormatDescriptor) {
        if self.active_session().is_none() {
            return;
        }
        info!(
            "Decoder output format changed: {}x{}, color format {}",
            format.width, format.height, format.color_format
        );
    }

    /// Report a codec error. Errors that are neither recoverable nor
    /// transient halt feeding until the host resets the pipeline.
    pub fn error(&self, recoverable: bool, transient: bool, message: &str) {
        let Some(shared) = self.active_session() else {
            return;
        };
        shared.stats.decoder_errors.fetch_add(1, Ordering::Relaxed);

        if !recoverable && !transient {
            error!("Decoder error: {} (recoverable: false, transient: false)", message);
            shared.fail(self.generation);
        } else {
            warn!(
                "Decoder error: {} (recoverable: {}, transient: {}), continuing",
                message, recoverable, transient
            );
        }
    }
}
