use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::envelope::DedupeKey;

struct SeenEntry {
    expires_at: Instant,
    stamp: u64,
}

/// Bounded LRU of recently completed envelope keys. An envelope matching
/// any live key is a replay: acknowledged, never re-delivered.
///
/// Entries also carry a lease so a key stops suppressing once it is old
/// enough that the sender cannot be retrying anymore.
pub struct DedupeCache {
    max_entries: usize,
    lease: Duration,
    seen: FxHashMap<DedupeKey, SeenEntry>,
    order: VecDeque<(DedupeKey, u64)>,
    next_stamp: u64,
}

impl DedupeCache {
    pub fn new(max_entries: usize, lease: Duration) -> DedupeCache {
        DedupeCache {
            max_entries,
            lease,
            seen: FxHashMap::default(),
            order: VecDeque::new(),
            next_stamp: 0,
        }
    }

    /// Check all keys of one envelope atomically. If any is live this is a
    /// replay (returns true); otherwise all keys are recorded.
    pub fn check_and_record(&mut self, keys: &[DedupeKey], now: Instant) -> bool {
        self.purge_expired(now);

        if keys.iter().any(|key| self.seen.contains_key(key)) {
            // refresh recency of the hit keys
            for key in keys {
                if self.seen.contains_key(key) {
                    self.record(key.clone(), now);
                }
            }
            return true;
        }

        for key in keys {
            self.record(key.clone(), now);
        }
        self.enforce_limit();
        false
    }

    fn record(&mut self, key: DedupeKey, now: Instant) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.seen.insert(
            key.clone(),
            SeenEntry {
                expires_at: now + self.lease,
                stamp,
            },
        );
        self.order.push_back((key, stamp));
    }

    fn purge_expired(&mut self, now: Instant) {
        self.seen.retain(|_, entry| entry.expires_at > now);
    }

    fn enforce_limit(&mut self) {
        while self.seen.len() > self.max_entries {
            let Some((key, stamp)) = self.order.pop_front() else {
                break;
            };
            // skip stale order entries left behind by re-records
            if self.seen.get(&key).map(|entry| entry.stamp) == Some(stamp) {
                self.seen.remove(&key);
            }
        }
        // drop fully-stale queue entries so the queue cannot grow unbounded
        while let Some((key, stamp)) = self.order.front() {
            if self.seen.get(key).map(|entry| entry.stamp) == Some(*stamp) {
                break;
            }
            self.order.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
