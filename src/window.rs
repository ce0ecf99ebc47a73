use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::frame::Frame;
use crate::seq::SeqNr;

/// Outcome of offering a frame to the send window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admit {
    /// The frame was admitted under the returned sequence number.
    Ready(SeqNr),
    /// The window is full; retry once acks advance the base.
    WouldBlock,
}

/// Verdict for a retransmit timer that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutVerdict {
    /// Retransmit this frame and re-arm its timer.
    Resend(Frame),
    /// The frame exhausted its retransmit budget; the stream is lost.
    FatalLoss,
    /// The seq was acknowledged in the meantime; nothing to do.
    Stale,
}

struct PendingFrame {
    frame: Frame,
    retries: u32,
}

/// Sender side of the sliding window: the bounded set of frames sent but
/// not yet cumulatively acknowledged.
///
/// Invariant: `base <= next <= base + window_size` in modular order.
pub struct SendWindow {
    window_size: u32,
    max_retransmits: u32,
    base: SeqNr,
    next: SeqNr,
    pending: FxHashMap<SeqNr, PendingFrame>,
}

impl SendWindow {
    pub fn new(window_size: u32, max_retransmits: u32) -> SendWindow {
        SendWindow {
            window_size,
            max_retransmits,
            base: SeqNr::ZERO,
            next: SeqNr::ZERO,
            pending: FxHashMap::default(),
        }
    }

    pub fn base(&self) -> SeqNr {
        self.base
    }

    /// The sequence number the next admitted frame will get.
    pub fn next_seq(&self) -> SeqNr {
        self.next
    }

    pub fn in_flight(&self) -> u32 {
        self.next.distance_from(self.base) as u32
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.window_size
    }

    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }

    /// Admit a frame built against [`SendWindow::next_seq`]. Returns
    /// `WouldBlock` when the window is full.
    pub fn admit(&mut self, frame: Frame) -> Admit {
        if !self.has_capacity() {
            return Admit::WouldBlock;
        }
        debug_assert_eq!(frame.seq, self.next, "frames must be admitted in seq order");

        let seq = self.next;
        self.next = self.next.next();
        self.pending.insert(seq, PendingFrame { frame, retries: 0 });

        debug_assert!(self.in_flight() <= self.window_size);
        Admit::Ready(seq)
    }

    /// Apply a cumulative ack: every seq strictly below `ack` is settled.
    /// Returns the seqs that were newly acknowledged (their timers should be
    /// cancelled). Stale and out-of-range acks are ignored.
    pub fn on_ack(&mut self, ack: SeqNr) -> Vec<SeqNr> {
        if ack.distance_from(self.base) <= 0 {
            return Vec::new(); // superseded by an earlier ack
        }

        let target = if ack.distance_from(self.next) > 0 {
            debug!("ack {} beyond highest sent seq {} - clamping", ack, self.next);
            self.next
        } else {
            ack
        };

        let mut acked = Vec::new();
        for seq in self.base.until(target) {
            if self.pending.remove(&seq).is_some() {
                acked.push(seq);
            }
        }
        self.base = target;
        trace!("ack advanced base to {}, {} in flight", self.base, self.in_flight());
        acked
    }

    /// Resend the listed seqs immediately. Each resend counts one retry.
    /// Seqs no longer pending are skipped.
    pub fn on_nack(&mut self, seqs: &[SeqNr]) -> Vec<Frame> {
        let mut frames = Vec::new();
        for seq in seqs {
            if let Some(pending) = self.pending.get_mut(seq) {
                pending.retries += 1;
                frames.push(pending.frame.clone());
            } else {
                debug!("NACK for seq {} that is not in the send window", seq);
            }
        }
        frames
    }

    /// Clone a pending frame without charging a retry - for idempotent
    /// handshake replays.
    pub fn pending_frame(&self, seq: SeqNr) -> Option<Frame> {
        self.pending.get(&seq).map(|pending| pending.frame.clone())
    }

    /// A retransmit timer for `seq` fired.
    pub fn on_timeout(&mut self, seq: SeqNr) -> TimeoutVerdict {
        match self.pending.get_mut(&seq) {
            None => TimeoutVerdict::Stale,
            Some(pending) => {
                if pending.retries >= self.max_retransmits {
                    TimeoutVerdict::FatalLoss
                } else {
                    pending.retries += 1;
                    TimeoutVerdict::Resend(pending.frame.clone())
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.base = self.next;
    }
}

/// What the reorder buffer holds per sequence number: stream payload, or
/// the peer's FIN (which consumes a seq like a data frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Data(Bytes),
    Fin,
}

/// Outcome of accepting an inbound sequenced frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// The frame was in order; it and any buffered successors are released.
    Delivered(Vec<Slot>),
    /// Out of order; buffered until the gap fills.
    Buffered,
    /// Already delivered or already buffered.
    Duplicate,
    /// Too far ahead of the receive window; dropped.
    Discarded,
}

/// Receiver side: buffers out-of-order payloads and releases the contiguous
/// prefix in sequence order.
pub struct ReorderBuffer {
    window_size: u32,
    next_expected: SeqNr,
    buffered: FxHashMap<SeqNr, Slot>,
}

impl ReorderBuffer {
    /// `first` is the first sequence number expected to carry data - one
    /// past the peer's SYN.
    pub fn starting_at(first: SeqNr, window_size: u32) -> ReorderBuffer {
        ReorderBuffer {
            window_size,
            next_expected: first,
            buffered: FxHashMap::default(),
        }
    }

    /// The cumulative ack value: all seq below this have been delivered.
    pub fn next_expected(&self) -> SeqNr {
        self.next_expected
    }

    pub fn accept(&mut self, seq: SeqNr, slot: Slot) -> Accepted {
        let distance = seq.distance_from(self.next_expected);

        if distance < 0 {
            return Accepted::Duplicate;
        }
        if distance as u32 >= self.window_size.saturating_mul(2) {
            // a well-behaved sender cannot be this far ahead
            return Accepted::Discarded;
        }

        if distance > 0 {
            if self.buffered.contains_key(&seq) {
                return Accepted::Duplicate;
            }
            self.buffered.insert(seq, slot);
            return Accepted::Buffered;
        }

        // in order: release this slot plus the contiguous buffered prefix
        let mut released = vec![slot];
        self.next_expected = self.next_expected.next();
        while let Some(next) = self.buffered.remove(&self.next_expected) {
            released.push(next);
            self.next_expected = self.next_expected.next();
        }
        Accepted::Delivered(released)
    }

    /// Seqs missing between `next_expected` and the highest buffered seq,
    /// capped at `cap` entries - the NACK candidates.
    pub fn missing(&self, cap: usize) -> Vec<SeqNr> {
        let Some(highest) = self
            .buffered
            .keys()
            .copied()
            .max_by_key(|seq| seq.distance_from(self.next_expected))
        else {
            return Vec::new();
        };

        self.next_expected
            .until(highest)
            .filter(|seq| !self.buffered.contains_key(seq))
            .take(cap)
            .collect()
    }

    pub fn clear(&mut self) {
        self.buffered.clear();
    }
}
