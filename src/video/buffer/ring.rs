//! Growable ring of length-framed packets.
//!
//! Every packet is stored as an 8-byte header (`u32` total length, `u32`
//! skip count, both big-endian) followed by `total length` payload bytes.
//! The header always lands at the write cursor; when the payload no longer
//! fits between the cursor and the end of the store, it is placed at offset 0
//! instead and the position right after the header is remembered as the wrap
//! marker so the reader knows where to jump back.
//!
//! When neither placement fits, the live bytes are copied into a fresh store
//! (doubling it while less than half of it is free) and the cursors are
//! rebased to zero. Storage never shrinks during a session.

use std::{io, ops::Range};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, error, warn};

use crate::common::errors::RingError;
use crate::video::constants::{MIN_RING_CAPACITY, PACKET_HEADER_LEN};

/// Result of a successful [`PacketRing::write`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// New store length when the write had to grow the ring.
    pub resized_to: Option<usize>,
    /// Pending packets discarded because the ring reset itself while making
    /// room. Non-zero only after an internal inconsistency.
    pub lost_packets: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Payload follows the header at the write cursor.
    Head,
    /// Header at the write cursor, payload wrapped to offset 0.
    Start,
}

pub struct PacketRing {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    packet_count: u32,
    wrap_marker: Option<usize>,
}

impl PacketRing {
    /// Create a ring backed by `capacity` bytes (at least [`MIN_RING_CAPACITY`]).
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(MIN_RING_CAPACITY)],
            read_pos: 0,
            write_pos: 0,
            packet_count: 0,
            wrap_marker: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.packet_count == 0
    }

    pub fn available_packets_to_read(&self) -> u32 {
        self.packet_count
    }

    /// Trimmed payload length of the oldest packet, without popping it.
    pub fn next_payload_len(&self) -> Option<usize> {
        if self.packet_count == 0 {
            return None;
        }
        self.header_at(self.read_pos)
            .map(|(total_len, skip)| total_len.saturating_sub(skip) as usize)
    }

    /// Physical length of the backing store.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes held by pending packets, headers included.
    pub fn used_bytes(&self) -> usize {
        self.live_regions()
            .map(|[a, b]| a.len() + b.len())
            .unwrap_or(0)
    }

    /// Drop every pending packet. The store keeps its current size.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.packet_count = 0;
        self.wrap_marker = None;
    }

    /// Append one packet of `total_len` bytes.
    ///
    /// `writer` receives exactly the `total_len`-byte destination region and
    /// must fill all of it. If it fails, the ring is left as it was before
    /// the call (apart from any growth that already happened).
    pub fn write<F>(&mut self, total_len: u32, skip: u32, writer: F) -> Result<WriteOutcome, RingError>
    where
        F: FnOnce(&mut [u8]) -> io::Result<()>,
    {
        if skip > total_len {
            warn!(
                "PacketRing: rejecting frame, skip {} > length {}",
                skip, total_len
            );
            return Err(RingError::InvalidFrame { total_len, skip });
        }

        let len = total_len as usize;
        let needed = PACKET_HEADER_LEN + len;

        if len > self.buf.len() / 2 {
            warn!(
                "PacketRing: large packet {} bytes, store is {} bytes",
                len,
                self.buf.len()
            );
        }

        if self.packet_count == 0 {
            self.clear();
        }

        let mut outcome = WriteOutcome::default();
        let placement = loop {
            if let Some(p) = self.placement(needed) {
                break p;
            }
            let (resized, lost) = self.reorganize(needed);
            outcome.resized_to = resized.or(outcome.resized_to);
            outcome.lost_packets += lost;
        };

        let header_at = self.write_pos;
        let prev_marker = self.wrap_marker;

        BigEndian::write_u32(&mut self.buf[header_at..header_at + 4], total_len);
        BigEndian::write_u32(&mut self.buf[header_at + 4..header_at + 8], skip);
        self.write_pos += PACKET_HEADER_LEN;

        if placement == Placement::Start {
            self.wrap_marker = Some(self.write_pos);
            self.write_pos = 0;
        }

        let start = self.write_pos;
        if let Err(e) = writer(&mut self.buf[start..start + len]) {
            self.write_pos = header_at;
            self.wrap_marker = prev_marker;
            return Err(RingError::Writer(e));
        }

        self.write_pos += len;
        self.packet_count += 1;
        Ok(outcome)
    }

    /// Pop the oldest packet and return its payload with the first `skip`
    /// bytes trimmed off. The slice borrows the ring's storage.
    pub fn read(&mut self) -> Result<&[u8], RingError> {
        if self.packet_count == 0 {
            return Err(RingError::Empty);
        }

        let Some((total_len, skip)) = self.header_at(self.read_pos) else {
            return Err(self.corrupted("header past end of store"));
        };
        if skip > total_len {
            return Err(self.corrupted("skip count exceeds packet length"));
        }

        let mut start = self.read_pos + PACKET_HEADER_LEN;
        if self.wrap_marker == Some(start) {
            start = 0;
            self.wrap_marker = None;
        }

        let end = start + total_len as usize;
        if end > self.buf.len() {
            return Err(self.corrupted("packet extends past end of store"));
        }

        self.read_pos = end;
        self.packet_count -= 1;
        Ok(&self.buf[start + skip as usize..end])
    }

    fn header_at(&self, pos: usize) -> Option<(u32, u32)> {
        let raw = self.buf.get(pos..pos.checked_add(PACKET_HEADER_LEN)?)?;
        Some((BigEndian::read_u32(&raw[..4]), BigEndian::read_u32(&raw[4..])))
    }

    fn space_at_head(&self) -> usize {
        if self.write_pos < self.read_pos {
            self.read_pos - self.write_pos
        } else {
            self.buf.len() - self.write_pos
        }
    }

    fn space_at_start(&self) -> usize {
        if self.write_pos < self.read_pos {
            0
        } else {
            self.read_pos
        }
    }

    /// Space checks are strict so a non-empty ring never has equal cursors.
    fn placement(&self, needed: usize) -> Option<Placement> {
        let head = self.space_at_head();
        if head <= PACKET_HEADER_LEN {
            return None;
        }
        if head > needed {
            Some(Placement::Head)
        } else if self.space_at_start() > needed {
            Some(Placement::Start)
        } else {
            None
        }
    }

    fn free_space(&self) -> usize {
        if self.packet_count == 0 {
            self.buf.len()
        } else if self.write_pos > self.read_pos {
            self.read_pos + self.buf.len() - self.write_pos
        } else {
            self.read_pos - self.write_pos
        }
    }

    /// Byte ranges holding pending packets, oldest first.
    fn live_regions(&self) -> Result<[Range<usize>; 2], &'static str> {
        if self.packet_count == 0 {
            return Ok([0..0, 0..0]);
        }

        let len = self.buf.len();
        if self.write_pos < self.read_pos {
            let end = self
                .wrap_marker
                .ok_or("wrapped cursors without a wrap marker")?;
            if end < self.read_pos || end > len {
                return Err("wrap marker outside the store");
            }
            Ok([self.read_pos..end, 0..self.write_pos])
        } else {
            if self.write_pos > len {
                return Err("write cursor past end of store");
            }
            Ok([self.read_pos..self.write_pos, 0..0])
        }
    }

    /// Copy the live bytes into a fresh, contiguous store. Returns the new
    /// length if the store grew and the number of packets lost to a reset.
    fn reorganize(&mut self, needed: usize) -> (Option<usize>, u32) {
        let [tail, head] = match self.live_regions() {
            Ok(regions) => regions,
            Err(reason) => {
                let lost = self.packet_count;
                self.reset_after_corruption(reason);
                return (None, lost);
            }
        };

        let old_len = self.buf.len();
        let live = tail.len() + head.len();

        let mut capacity = old_len;
        if self.free_space() < old_len / 2 {
            capacity *= 2;
        }
        while capacity - live <= needed {
            capacity *= 2;
        }

        let mut store = vec![0; capacity];
        store[..tail.len()].copy_from_slice(&self.buf[tail.clone()]);
        store[tail.len()..live].copy_from_slice(&self.buf[head]);

        debug!(
            "PacketRing: reorganized read={} write={} len={} -> len={} live={} count={}",
            self.read_pos, self.write_pos, old_len, capacity, live, self.packet_count
        );

        self.buf = store;
        self.read_pos = 0;
        self.write_pos = live;
        self.wrap_marker = None;

        ((capacity > old_len).then_some(capacity), 0)
    }

    fn reset_after_corruption(&mut self, reason: &'static str) {
        error!(
            "PacketRing: {} (read={} write={} len={} count={}), resetting",
            reason,
            self.read_pos,
            self.write_pos,
            self.buf.len(),
            self.packet_count
        );
        self.clear();
    }

    fn corrupted(&mut self, reason: &'static str) -> RingError {
        let lost_packets = self.packet_count;
        self.reset_after_corruption(reason);
        RingError::Corrupted {
            reason,
            lost_packets,
        }
    }
}
