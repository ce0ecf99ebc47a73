use rustc_hash::FxHashMap;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::time::Instant;

use crate::seq::SeqNr;

/// One scheduled retransmit deadline. Entries are plain data - the timer
/// task looks up the owning stream by `stream_id` when an entry fires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimerEntry {
    pub deadline: Instant,
    pub stream_id: u32,
    pub seq: SeqNr,
    pub generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.stream_id.cmp(&other.stream_id))
            .then(self.seq.to_raw().cmp(&other.seq.to_raw()))
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of retransmit deadlines for all streams of one multiplexer.
///
/// Cancellation is lazy: cancelling or rescheduling a `(stream, seq)` bumps
/// its live generation, and entries whose generation no longer matches are
/// skipped when they surface at the top of the heap.
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    live: FxHashMap<(u32, u32), u64>,
    next_generation: u64,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            heap: BinaryHeap::new(),
            live: FxHashMap::default(),
            next_generation: 1,
        }
    }

    /// Schedule (or reschedule) the deadline for `(stream_id, seq)`.
    pub fn schedule(&mut self, stream_id: u32, seq: SeqNr, deadline: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;

        self.live.insert((stream_id, seq.to_raw()), generation);
        self.heap.push(Reverse(TimerEntry {
            deadline,
            stream_id,
            seq,
            generation,
        }));
    }

    pub fn cancel(&mut self, stream_id: u32, seq: SeqNr) {
        self.live.remove(&(stream_id, seq.to_raw()));
    }

    pub fn cancel_stream(&mut self, stream_id: u32) {
        self.live.retain(|(id, _), _| *id != stream_id);
    }

    /// Earliest live deadline, pruning stale entries off the top.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.is_live(top) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop all live entries with `deadline <= now`. Popped entries are no
    /// longer tracked; the owner reschedules if it retransmits.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut expired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry must pop").0;
            if self.is_live(&entry) {
                self.live.remove(&(entry.stream_id, entry.seq.to_raw()));
                expired.push(entry);
            }
        }
        expired
    }

    fn is_live(&self, entry: &TimerEntry) -> bool {
        self.live.get(&(entry.stream_id, entry.seq.to_raw())) == Some(&entry.generation)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
