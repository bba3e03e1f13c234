//! In-process decoder used by the soak binary and the pipeline tests.
//!
//! `LoopbackDecoder` journals every call it receives. In auto-cycle mode it
//! behaves like a decoder that finishes instantly: every queued input is
//! reported back as a renderable output and its slot is offered again. In
//! manual mode nothing happens on its own and the caller drives events
//! through [`LoopbackBackend::last_sink`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::common::errors::DecoderError;
use crate::video::constants::LOOPBACK_INPUT_SLOTS;
use crate::video::format::{SurfaceId, VideoFormat};

use super::{DecoderBackend, EventSink, InputSlot, OutputSlot, VideoDecoder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderCall {
    Configure {
        format: VideoFormat,
        surface: Option<SurfaceId>,
    },
    Start,
    QueueInput { slot: InputSlot, data: Vec<u8> },
    ReleaseOutput { slot: OutputSlot, render: bool },
    Stop,
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub decoder: String,
    pub generation: u64,
    pub call: DecoderCall,
}

/// Shared, append-only record of decoder calls.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    fn record(&self, decoder: &str, generation: u64, call: DecoderCall) {
        self.0.lock().push(JournalEntry {
            decoder: decoder.to_string(),
            generation,
            call,
        });
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().clone()
    }

    /// Payloads submitted through `queue_input`, in submission order.
    pub fn queued_inputs(&self) -> Vec<Vec<u8>> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match &e.call {
                DecoderCall::QueueInput { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn released_outputs(&self) -> Vec<(OutputSlot, bool)> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e.call {
                DecoderCall::ReleaseOutput { slot, render } => Some((slot, render)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&DecoderCall) -> bool) -> usize {
        self.0.lock().iter().filter(|e| pred(&e.call)).count()
    }
}

pub struct LoopbackBackend {
    auto_cycle: bool,
    input_slots: u32,
    named: Vec<String>,
    failures_left: AtomicU32,
    fatal_on_start: bool,
    journal: Journal,
    sinks: Mutex<Vec<EventSink>>,
}

impl LoopbackBackend {
    /// Decoder that echoes every input straight back as a rendered frame.
    pub fn auto_cycle() -> Self {
        Self::build(true)
    }

    /// Decoder that only records calls; events are fired by the caller.
    pub fn manual() -> Self {
        Self::build(false)
    }

    fn build(auto_cycle: bool) -> Self {
        Self {
            auto_cycle,
            input_slots: LOOPBACK_INPUT_SLOTS,
            named: Vec::new(),
            failures_left: AtomicU32::new(0),
            fatal_on_start: false,
            journal: Journal::default(),
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Accept `name` in [`DecoderBackend::create_by_name`].
    pub fn with_named(mut self, name: impl Into<String>) -> Self {
        self.named.push(name.into());
        self
    }

    /// Fail the next `n` generic creations with `DecoderError::Unavailable`.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::Relaxed);
        self
    }

    /// Decoders report a fatal codec error from inside `start()`, the way a
    /// hardware decoder can fail right after it accepts a configuration.
    pub fn fatal_on_start(mut self) -> Self {
        self.fatal_on_start = true;
        self
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Event sink of the most recently created decoder.
    pub fn last_sink(&self) -> Option<EventSink> {
        self.sinks.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.sinks.lock().len()
    }

    fn make(&self, name: String, events: EventSink) -> Box<dyn VideoDecoder> {
        self.sinks.lock().push(events.clone());
        Box::new(LoopbackDecoder {
            name,
            generation: events.generation(),
            events: Some(events),
            journal: self.journal.clone(),
            auto_cycle: self.auto_cycle,
            fatal_on_start: self.fatal_on_start,
            input_slots: self.input_slots,
            released: AtomicBool::new(false),
        })
    }
}

impl DecoderBackend for LoopbackBackend {
    fn create_by_name(&self, name: &str, events: EventSink) -> Result<Box<dyn VideoDecoder>, DecoderError> {
        if self.named.iter().any(|n| n == name) {
            Ok(self.make(name.to_string(), events))
        } else {
            Err(DecoderError::Unavailable(format!("{name} is not installed")))
        }
    }

    fn create_by_type(&self, mime: &str, events: EventSink) -> Result<Box<dyn VideoDecoder>, DecoderError> {
        let failed = self
            .failures_left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DecoderError::Unavailable(format!("{mime} decoder busy")));
        }
        Ok(self.make(format!("loopback.{mime}"), events))
    }
}

pub struct LoopbackDecoder {
    name: String,
    generation: u64,
    events: Option<EventSink>,
    journal: Journal,
    auto_cycle: bool,
    fatal_on_start: bool,
    input_slots: u32,
    released: AtomicBool,
}

impl LoopbackDecoder {
    /// A decoder with no event sink, for exercising bookkeeping on its own.
    pub fn detached(name: &str, generation: u64, journal: Journal) -> Self {
        Self {
            name: name.to_string(),
            generation,
            events: None,
            journal,
            auto_cycle: false,
            fatal_on_start: false,
            input_slots: LOOPBACK_INPUT_SLOTS,
            released: AtomicBool::new(false),
        }
    }

    fn record(&self, call: DecoderCall) {
        self.journal.record(&self.name, self.generation, call);
    }

    fn ensure_live(&self) -> Result<(), DecoderError> {
        if self.released.load(Ordering::Acquire) {
            Err(DecoderError::Released)
        } else {
            Ok(())
        }
    }
}

impl VideoDecoder for LoopbackDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, format: &VideoFormat, surface: Option<SurfaceId>) -> Result<(), DecoderError> {
        self.ensure_live()?;
        self.record(DecoderCall::Configure {
            format: format.clone(),
            surface,
        });
        Ok(())
    }

    fn start(&self) -> Result<(), DecoderError> {
        self.ensure_live()?;
        self.record(DecoderCall::Start);
        if let (true, Some(events)) = (self.auto_cycle, &self.events) {
            for i in 0..self.input_slots {
                events.input_slot_available(InputSlot(i));
            }
        }
        if let (true, Some(events)) = (self.fatal_on_start, &self.events) {
            events.error(false, false, "loopback: codec died during start");
        }
        Ok(())
    }

    fn queue_input(&self, slot: InputSlot, data: &[u8]) -> Result<(), DecoderError> {
        self.ensure_live()?;
        if slot.0 >= self.input_slots {
            return Err(DecoderError::Rejected {
                slot: slot.0,
                reason: format!("only {} input slots", self.input_slots),
            });
        }
        self.record(DecoderCall::QueueInput {
            slot,
            data: data.to_vec(),
        });
        if let (true, Some(events)) = (self.auto_cycle, &self.events) {
            events.output_ready(OutputSlot(slot.0), data.len());
            events.input_slot_available(slot);
        }
        Ok(())
    }

    fn release_output(&self, slot: OutputSlot, render: bool) -> Result<(), DecoderError> {
        self.ensure_live()?;
        self.record(DecoderCall::ReleaseOutput { slot, render });
        Ok(())
    }

    fn stop(&self) -> Result<(), DecoderError> {
        self.ensure_live()?;
        self.record(DecoderCall::Stop);
        Ok(())
    }

    fn release(&self) -> Result<(), DecoderError> {
        self.record(DecoderCall::Release);
        if self.released.swap(true, Ordering::AcqRel) {
            debug!("LoopbackDecoder {}: released twice", self.name);
        }
        Ok(())
    }
}
