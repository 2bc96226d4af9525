use serde::{Deserialize, Serialize};

use crate::keys::QueryKey;
use crate::state::QueryState;

/// The store's view of one query: its last known state plus access bookkeeping.
///
/// Entries are plain data. Timer handles live beside the entry table inside the
/// store, so an entry can be cloned out to callers and serialized for persistence.
///
/// # Fields
///
/// * `hash` - Canonical form of `key`, the store's lookup key
/// * `created_at` - When the key was first written (ms)
/// * `updated_at` - Last `set` (ms)
/// * `accessed_at` - Last `get` or `set` (ms), drives LRU eviction
/// * `access_count` - Number of reads and writes
///
/// # Examples
///
/// ```
/// use forge_query_core::{CacheEntry, QueryKey, QueryState};
///
/// let mut entry = CacheEntry::new(QueryKey::from("todos"), QueryState::seeded(3, 100), 100);
/// assert_eq!(entry.access_count, 1);
///
/// entry.touch(250, 2);
/// assert_eq!(entry.accessed_at, 250);
/// assert_eq!(entry.access_count, 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: QueryKey,
    pub hash: String,
    pub state: QueryState<T>,
    pub created_at: u64,
    pub updated_at: u64,
    pub accessed_at: u64,
    pub access_count: u64,
    /// Monotonic recency stamp; breaks `accessed_at` ties within a millisecond.
    #[serde(default)]
    pub(crate) access_seq: u64,
}

impl<T> CacheEntry<T> {
    /// Creates an entry written at `now`.
    pub fn new(key: QueryKey, state: QueryState<T>, now: u64) -> Self {
        Self {
            hash: key.hash(),
            key,
            state,
            created_at: now,
            updated_at: now,
            accessed_at: now,
            access_count: 1,
            access_seq: 0,
        }
    }

    /// Records a read or write at `now`.
    pub fn touch(&mut self, now: u64, seq: u64) {
        self.accessed_at = now;
        self.access_count = self.access_count.saturating_add(1);
        self.access_seq = seq;
    }

    /// Replaces the state, keeping `created_at` and the access history.
    pub(crate) fn update(&mut self, state: QueryState<T>, now: u64, seq: u64) {
        self.state = state;
        self.updated_at = now;
        self.touch(now, seq);
    }

    /// Recency ordering key: older entries compare lower.
    pub(crate) fn recency(&self) -> (u64, u64) {
        (self.accessed_at, self.access_seq)
    }
}

impl<T: Serialize> CacheEntry<T> {
    /// Approximate serialized size of the entry's data in bytes.
    ///
    /// Returns `None` when there is no data or it cannot be serialized.
    pub fn data_size(&self) -> Option<usize> {
        let data = self.state.data.as_ref()?;
        serde_json::to_vec(data).ok().map(|bytes| bytes.len())
    }
}
