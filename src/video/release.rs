//! Output release loop.
//!
//! Render/discard decisions are made on the decoder's callback thread and
//! queued here, so releasing (which may block on the display pipeline) never
//! stalls the callback path. Commands are applied strictly in arrival order.

use std::sync::Arc;

use flume::Receiver;
use tracing::{Level, debug, span, trace, warn};

use crate::video::decoder::OutputSlot;
use crate::video::pipeline::SessionShared;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseCommand {
    Release {
        generation: u64,
        slot: OutputSlot,
        render: bool,
    },
    Shutdown,
}

pub struct ReleaseLoop {
    shared: Arc<SessionShared>,
    rx: Receiver<ReleaseCommand>,
}

impl ReleaseLoop {
    pub(crate) fn new(shared: Arc<SessionShared>, rx: Receiver<ReleaseCommand>) -> Self {
        Self { shared, rx }
    }

    pub fn run(self) {
        let _span = span!(Level::DEBUG, "release_loop").entered();

        while let Ok(cmd) = self.rx.recv() {
            match cmd {
                ReleaseCommand::Release {
                    generation,
                    slot,
                    render,
                } => self.release(generation, slot, render),
                ReleaseCommand::Shutdown => break,
            }
        }

        debug!("Release loop finished");
    }

    fn release(&self, generation: u64, slot: OutputSlot, render: bool) {
        let Some(decoder) = self.shared.decoder.get(generation) else {
            trace!("Skipping release of {:?}: decoder replaced", slot);
            return;
        };

        if let Err(e) = decoder.release_output(slot, render) {
            warn!(
                "Release: output {:?} (render: {}) failed on {}: {}",
                slot,
                render,
                decoder.name(),
                e
            );
        }
    }
}
