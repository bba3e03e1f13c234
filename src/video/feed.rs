//! Feed loop: drains the packet ring into decoder input slots.
//!
//! Runs on its own thread and is level-triggered: every command it receives
//! (a new packet, a newly offered slot) is followed by a full drain pass that
//! keeps pairing the oldest packet with the oldest slot until one side runs
//! dry. Nothing here blocks waiting for data; the next event re-triggers it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use flume::Receiver;
use parking_lot::Mutex;
use tracing::{Level, debug, error, span, warn};

use crate::common::errors::RingError;
use crate::video::decoder::InputSlot;
use crate::video::pipeline::SessionShared;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FeederState {
    Idle = 0,
    Configuring = 1,
    Running = 2,
    Stopping = 3,
    /// A fatal decoder error halted feeding; only `reset()` leaves this state.
    Failed = 4,
}

impl FeederState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Configuring,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(FeederState::Idle as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> FeederState {
        FeederState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: FeederState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from -> to` only if the current state is `from`.
    pub fn transition(&self, from: FeederState, to: FeederState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// FIFO of input slots offered by the decoder.
///
/// Entries are tagged with the generation of the decoder that offered them;
/// `pop` silently discards slots belonging to an older decoder.
#[derive(Default)]
pub struct SlotQueue {
    slots: Mutex<VecDeque<(u64, InputSlot)>>,
}

impl SlotQueue {
    pub fn push(&self, generation: u64, slot: InputSlot) {
        self.slots.lock().push_back((generation, slot));
    }

    /// Put back a slot that was popped but not used.
    pub fn push_front(&self, generation: u64, slot: InputSlot) {
        self.slots.lock().push_front((generation, slot));
    }

    pub fn pop(&self, generation: u64) -> Option<InputSlot> {
        let mut slots = self.slots.lock();
        while let Some((owner, slot)) = slots.pop_front() {
            if owner == generation {
                return Some(slot);
            }
        }
        None
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    /// Run a drain pass.
    Drain,
    Shutdown,
}

pub struct FeedLoop {
    shared: Arc<SessionShared>,
    rx: Receiver<FeedCommand>,
}

impl FeedLoop {
    pub(crate) fn new(shared: Arc<SessionShared>, rx: Receiver<FeedCommand>) -> Self {
        Self { shared, rx }
    }

    pub fn run(self) {
        let _span = span!(Level::DEBUG, "feed_loop").entered();

        while let Ok(cmd) = self.rx.recv() {
            if cmd == FeedCommand::Shutdown {
                break;
            }
            drain(&self.shared);
        }

        debug!("Feed loop finished");
    }
}

/// Pair pending packets with available slots until either runs out.
/// Returns the number of packets handed to the decoder.
pub(crate) fn drain(shared: &SessionShared) -> usize {
    let Some((generation, decoder)) = shared.decoder.current() else {
        return 0;
    };

    let mut fed = 0;
    while shared.state.get() == FeederState::Running {
        // Only this thread pops, so the peeked packet is the one read below
        // unless a stop clears the ring in between.
        let Some(payload_len) = shared.ring.lock().next_payload_len() else {
            break;
        };
        let Some(slot) = shared.slots.pop(generation) else {
            break;
        };

        // Taken before the ring lock so the two locks never nest.
        let mut scratch = shared.pool.acquire(payload_len);
        {
            let mut ring = shared.ring.lock();
            match ring.read() {
                Ok(payload) => scratch.extend_from_slice(payload),
                Err(RingError::Empty) => {
                    shared.slots.push_front(generation, slot);
                    break;
                }
                Err(e) => {
                    warn!("Feed: dropping ring contents: {}", e);
                    shared.stats.record_ring_error(&e);
                    shared.slots.push_front(generation, slot);
                    break;
                }
            }
        }

        match decoder.queue_input(slot, &scratch) {
            Ok(()) => {
                fed += 1;
                shared.stats.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_fatal() => {
                error!("Feed: decoder {} failed: {}", decoder.name(), e);
                shared.stats.queue_failures.fetch_add(1, Ordering::Relaxed);
                shared.fail(generation);
                break;
            }
            Err(e) => {
                warn!("Feed: fill input buffer error: {}", e);
                shared.stats.queue_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::PipelineStats;
    use crate::video::buffer::{BufferPool, PacketRing};
    use crate::video::decoder::{ActiveDecoder, DecoderBackend, EventSink, LoopbackBackend};

    fn session(pool: Arc<BufferPool>) -> (Arc<SessionShared>, LoopbackBackend, u64) {
        let shared = Arc::new(SessionShared {
            ring: Mutex::new(PacketRing::new(4_096)),
            slots: SlotQueue::default(),
            pool,
            decoder: ActiveDecoder::default(),
            state: StateCell::default(),
            stats: Arc::new(PipelineStats::default()),
        });

        let backend = LoopbackBackend::manual();
        let generation = shared.decoder.reserve();
        let (feed_tx, _feed_rx) = flume::unbounded();
        let (release_tx, _release_rx) = flume::unbounded();
        let events = EventSink::new(generation, Arc::downgrade(&shared), feed_tx, release_tx);
        let decoder = backend.create_by_type("video/avc", events).unwrap();
        shared.decoder.install(generation, Arc::from(decoder));
        shared.state.set(FeederState::Running);

        (shared, backend, generation)
    }

    #[test]
    fn drain_sizes_scratch_to_the_packet() {
        let pool = BufferPool::new(16, 2);
        // Leave one idle 16-byte buffer behind.
        drop(pool.acquire(0));
        assert_eq!(pool.stats().expansions, 1);

        let (shared, backend, generation) = session(pool.clone());
        let payload: Vec<u8> = (0..1_000u32).map(|i| i as u8).collect();
        shared
            .ring
            .lock()
            .write(payload.len() as u32, 0, |dst| {
                dst.copy_from_slice(&payload);
                Ok(())
            })
            .unwrap();
        shared.slots.push(generation, InputSlot(0));

        assert_eq!(drain(&shared), 1);
        assert_eq!(backend.journal().queued_inputs(), vec![payload]);
        // The undersized idle buffer was passed over for one that fits.
        assert_eq!(pool.stats().expansions, 2);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn drain_stops_when_either_side_runs_dry() {
        let (shared, backend, generation) = session(BufferPool::new(64, 2));
        for tag in [b"one", b"two"] {
            shared
                .ring
                .lock()
                .write(3, 0, |dst| {
                    dst.copy_from_slice(tag);
                    Ok(())
                })
                .unwrap();
        }

        assert_eq!(drain(&shared), 0);
        shared.slots.push(generation, InputSlot(0));
        assert_eq!(drain(&shared), 1);
        assert_eq!(shared.ring.lock().available_packets_to_read(), 1);

        shared.slots.push(generation, InputSlot(1));
        shared.slots.push(generation, InputSlot(2));
        assert_eq!(drain(&shared), 1);
        assert_eq!(shared.slots.len(), 1);
        assert_eq!(
            backend.journal().queued_inputs(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            FeederState::Idle,
            FeederState::Configuring,
            FeederState::Running,
            FeederState::Stopping,
            FeederState::Failed,
        ] {
            assert_eq!(FeederState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn transition_requires_expected_state() {
        let cell = StateCell::default();
        assert!(!cell.transition(FeederState::Running, FeederState::Failed));
        assert!(cell.transition(FeederState::Idle, FeederState::Configuring));
        assert_eq!(cell.get(), FeederState::Configuring);
    }

    #[test]
    fn slots_pop_in_offer_order() {
        let queue = SlotQueue::default();
        queue.push(1, InputSlot(4));
        queue.push(1, InputSlot(2));
        queue.push(1, InputSlot(7));

        assert_eq!(queue.pop(1), Some(InputSlot(4)));
        queue.push_front(1, InputSlot(4));
        assert_eq!(queue.pop(1), Some(InputSlot(4)));
        assert_eq!(queue.pop(1), Some(InputSlot(2)));
        assert_eq!(queue.pop(1), Some(InputSlot(7)));
        assert_eq!(queue.pop(1), None);
    }

    #[test]
    fn stale_slots_are_discarded() {
        let queue = SlotQueue::default();
        queue.push(1, InputSlot(0));
        queue.push(1, InputSlot(1));
        queue.push(2, InputSlot(9));

        assert_eq!(queue.pop(2), Some(InputSlot(9)));
        assert!(queue.is_empty());
    }
}
