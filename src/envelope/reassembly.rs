use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::radio::NodeId;

/// Reassembly is indexed per sender and envelope-id prefix; chunks of
/// different envelopes never mix.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ReassemblyKey {
    pub sender: NodeId,
    pub id_prefix: [u8; 8],
}

/// Outcome of feeding one chunk into the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// All sequences are present; the ordered segments are released exactly
    /// once.
    Complete(Vec<Bytes>),
    /// Still missing sequences.
    Pending,
    /// The envelope completed earlier; this chunk changes nothing.
    AlreadyComplete,
}

struct PartialEnvelope {
    total: u16,
    chunks: FxHashMap<u16, Bytes>,
    parity: FxHashMap<u16, Bytes>,
    first_seen: Instant,
    last_chunk: Instant,
    completed: bool,
    nacked_at: Option<Instant>,
}

impl PartialEnvelope {
    fn new(total: u16, now: Instant) -> PartialEnvelope {
        PartialEnvelope {
            total,
            chunks: FxHashMap::default(),
            parity: FxHashMap::default(),
            first_seen: now,
            last_chunk: now,
            completed: false,
            nacked_at: None,
        }
    }

    fn missing(&self) -> Vec<u16> {
        (1..=self.total)
            .filter(|seq| !self.chunks.contains_key(seq))
            .collect()
    }

    fn highest_contiguous(&self) -> u16 {
        let mut highest = 0;
        while highest < self.total && self.chunks.contains_key(&(highest + 1)) {
            highest += 1;
        }
        highest
    }
}

/// Collects data (and parity) chunks per envelope until all sequences are
/// present, then releases the ordered segments exactly once. Partial state
/// is evicted after the TTL; completed markers are kept for the same time
/// so replayed chunks stay no-ops.
pub struct ReassemblyBuffer {
    ttl: Duration,
    parity_window: usize,
    partials: FxHashMap<ReassemblyKey, PartialEnvelope>,
}

impl ReassemblyBuffer {
    pub fn new(ttl: Duration, parity_window: usize) -> ReassemblyBuffer {
        ReassemblyBuffer {
            ttl,
            parity_window,
            partials: FxHashMap::default(),
        }
    }

    pub fn insert_data(
        &mut self,
        key: ReassemblyKey,
        sequence: u16,
        total: u16,
        payload: Bytes,
        now: Instant,
    ) -> ChunkOutcome {
        if sequence == 0 || total == 0 || sequence > total {
            debug!("chunk with invalid sequence {}/{} - dropping", sequence, total);
            return ChunkOutcome::Pending;
        }

        let partial = self
            .partials
            .entry(key)
            .or_insert_with(|| PartialEnvelope::new(total, now));
        if partial.completed {
            return ChunkOutcome::AlreadyComplete;
        }
        if partial.total != total {
            warn!(
                "chunk declares total {} but envelope started with {} - dropping",
                total, partial.total
            );
            return ChunkOutcome::Pending;
        }

        partial.last_chunk = now;
        partial.chunks.entry(sequence).or_insert(payload);
        Self::recover_from_parity(partial, self.parity_window);
        Self::try_complete(partial)
    }

    pub fn insert_parity(
        &mut self,
        key: ReassemblyKey,
        window: u16,
        total: u16,
        payload: Bytes,
        now: Instant,
    ) -> ChunkOutcome {
        if window == 0 || total == 0 {
            return ChunkOutcome::Pending;
        }

        let partial = self
            .partials
            .entry(key)
            .or_insert_with(|| PartialEnvelope::new(total, now));
        if partial.completed {
            return ChunkOutcome::AlreadyComplete;
        }

        partial.last_chunk = now;
        partial.parity.entry(window).or_insert(payload);
        Self::recover_from_parity(partial, self.parity_window);
        Self::try_complete(partial)
    }

    /// Rebuild single missing chunks from their window's parity. The parity
    /// payload is the XOR over each data chunk extended as
    /// `len: u16 LE || payload`, zero-padded to the longest such record.
    fn recover_from_parity(partial: &mut PartialEnvelope, parity_window: usize) {
        let k = parity_window as u16;
        let windows = partial.parity.keys().copied().collect::<Vec<_>>();

        for window in windows {
            let lo = (window - 1).saturating_mul(k) + 1;
            if lo > partial.total {
                continue;
            }
            let hi = (window.saturating_mul(k)).min(partial.total);

            let missing = (lo..=hi)
                .filter(|seq| !partial.chunks.contains_key(seq))
                .collect::<Vec<_>>();
            if missing.len() != 1 {
                continue;
            }
            let missing_seq = missing[0];

            let parity_payload = partial.parity.get(&window).expect("window key just listed");
            let mut accumulator = parity_payload.to_vec();
            for seq in lo..=hi {
                if seq == missing_seq {
                    continue;
                }
                let chunk = partial.chunks.get(&seq).expect("present chunks only");
                xor_record(&mut accumulator, chunk);
            }

            if accumulator.len() < 2 {
                debug!("parity for window {} too short to recover from", window);
                continue;
            }
            let len = u16::from_le_bytes([accumulator[0], accumulator[1]]) as usize;
            if 2 + len > accumulator.len() {
                debug!(
                    "parity recovery for seq {} yields inconsistent length {} - more than one loss?",
                    missing_seq, len
                );
                continue;
            }

            trace!("recovered chunk {} from parity window {}", missing_seq, window);
            partial
                .chunks
                .insert(missing_seq, Bytes::copy_from_slice(&accumulator[2..2 + len]));
        }
    }

    fn try_complete(partial: &mut PartialEnvelope) -> ChunkOutcome {
        if (1..=partial.total).any(|seq| !partial.chunks.contains_key(&seq)) {
            return ChunkOutcome::Pending;
        }

        let segments = (1..=partial.total)
            .map(|seq| partial.chunks.remove(&seq).expect("all sequences present"))
            .collect::<Vec<_>>();
        partial.completed = true;
        partial.parity.clear();
        ChunkOutcome::Complete(segments)
    }

    pub fn highest_contiguous(&self, key: &ReassemblyKey) -> u16 {
        self.partials
            .get(key)
            .map(|partial| {
                if partial.completed {
                    partial.total
                } else {
                    partial.highest_contiguous()
                }
            })
            .unwrap_or(0)
    }

    pub fn total_of(&self, key: &ReassemblyKey) -> Option<u16> {
        self.partials.get(key).map(|partial| partial.total)
    }

    /// Evict everything older than the TTL. Returns the keys of incomplete
    /// envelopes that were lost (for the timeout counter).
    pub fn purge(&mut self, now: Instant) -> Vec<ReassemblyKey> {
        let ttl = self.ttl;
        let mut timed_out = Vec::new();
        self.partials.retain(|key, partial| {
            if now.duration_since(partial.first_seen) < ttl {
                return true;
            }
            if !partial.completed {
                debug!("evicting incomplete envelope after TTL ({} chunks)", partial.chunks.len());
                timed_out.push(*key);
            }
            false
        });
        timed_out
    }

    /// Incomplete envelopes that have been quiet long enough to NACK, with
    /// their missing sequences. Re-NACKs are spaced by the same quiet
    /// interval.
    pub fn gaps(&mut self, now: Instant, quiet: Duration) -> Vec<(ReassemblyKey, Vec<u16>)> {
        let mut result = Vec::new();
        for (key, partial) in self.partials.iter_mut() {
            if partial.completed {
                continue;
            }
            if now.duration_since(partial.last_chunk) < quiet {
                continue;
            }
            if let Some(nacked_at) = partial.nacked_at {
                if now.duration_since(nacked_at) < quiet {
                    continue;
                }
            }
            let missing = partial.missing();
            if missing.is_empty() {
                continue;
            }
            partial.nacked_at = Some(now);
            result.push((*key, missing));
        }
        result
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }
}

/// XOR a `len || payload` record into the accumulator, padding the record
/// with zeroes (xor with zero is a no-op beyond the record's end).
fn xor_record(accumulator: &mut Vec<u8>, payload: &[u8]) {
    let record_len = 2 + payload.len();
    if accumulator.len() < record_len {
        accumulator.resize(record_len, 0);
    }
    let len_bytes = (payload.len() as u16).to_le_bytes();
    accumulator[0] ^= len_bytes[0];
    accumulator[1] ^= len_bytes[1];
    for (i, byte) in payload.iter().enumerate() {
        accumulator[2 + i] ^= byte;
    }
}

/// Build the parity payload over one window of data chunks (sender side).
pub fn parity_over(chunks: &[Bytes]) -> Bytes {
    let record_len = chunks.iter().map(|c| 2 + c.len()).max().unwrap_or(2);
    let mut accumulator = vec![0u8; record_len];
    for chunk in chunks {
        xor_record(&mut accumulator, chunk);
    }
    Bytes::from(accumulator)
}
