//! Bounded, expiring set of processed message ids.

use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Entries are kept in write order, so the front of the map is always the
/// least recently written id. That makes both expiry and size eviction a
/// pop from the front.
pub struct IdempotencyGuard {
    entries: Mutex<IndexMap<String, Instant>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl IdempotencyGuard {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn is_processed(&self, message_id: &str) -> bool {
        let mut entries = self.entries.lock();
        let live = entries.get(message_id).map(|written| written.elapsed() < self.ttl);
        match live {
            Some(true) => true,
            Some(false) => {
                entries.shift_remove(message_id);
                false
            }
            None => false,
        }
    }

    pub fn mark_processed(&self, message_id: &str) {
        let mut entries = self.entries.lock();
        entries.shift_remove(message_id);
        Self::purge_expired(&mut entries, self.ttl);
        entries.insert(message_id.to_string(), Instant::now());
        while entries.len() > self.max_entries {
            entries.shift_remove_index(0);
        }
    }

    /// Live entries, after dropping expired ones.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, self.ttl);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn purge_expired(entries: &mut IndexMap<String, Instant>, ttl: Duration) {
        while let Some((_, written)) = entries.first() {
            if written.elapsed() < ttl {
                break;
            }
            entries.shift_remove_index(0);
        }
    }
}
