//! Keyed store of query snapshots.
//!
//! The [`Store`] holds one [`CacheEntry`] per canonical key. It enforces an entry
//! cap with least-recently-accessed eviction, runs per-entry TTL garbage
//! collection, fans out [`CacheEvent`]s, and optionally persists its table through
//! a [`StorageBackend`].
//!
//! LRU eviction and GC are independent. Whichever removes an entry first cancels
//! the other: deleting an entry always aborts its GC timer, so a late timer can
//! never remove a re-created entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cache_entry::CacheEntry;
use crate::clock::{spawn_timer, Clock, TokioClock, NEVER};
use crate::error::StoreError;
use crate::events::{CacheEvent, CacheEventKind, ListenerSet, Unsubscribe};
use crate::keys::QueryKey;
use crate::persistence::{EntryCodec, JsonCodec, StorageBackend};
use crate::state::{QueryData, QueryState};
use crate::stats::{CacheStats, StoreStats};

/// Default entry cap.
pub const DEFAULT_MAX_ENTRIES: usize = 1_000;

/// Default time an unobserved entry survives.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Default storage key of the persisted table.
pub const DEFAULT_PERSIST_KEY: &str = "forge-query-cache";

/// Store configuration.
///
/// # Examples
///
/// ```
/// use forge_query_core::{MemoryStorage, StoreConfig};
/// use std::sync::Arc;
///
/// let config = StoreConfig::<String>::default()
///     .with_max_entries(50)
///     .with_storage(Arc::new(MemoryStorage::new()))
///     .with_persist(true);
/// assert_eq!(config.max_entries, 50);
/// assert_eq!(config.persist_key, "forge-query-cache");
/// ```
pub struct StoreConfig<T> {
    /// Entry cap; `0` disables caching and every `set` is dropped.
    pub max_entries: usize,
    pub default_gc_time: Duration,
    pub persist: bool,
    pub persist_key: String,
    pub storage: Option<Arc<dyn StorageBackend>>,
    pub codec: Arc<dyn EntryCodec<T>>,
}

impl<T: QueryData> Default for StoreConfig<T> {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            default_gc_time: DEFAULT_GC_TIME,
            persist: false,
            persist_key: DEFAULT_PERSIST_KEY.to_string(),
            storage: None,
            codec: Arc::new(JsonCodec::new()),
        }
    }
}

impl<T> StoreConfig<T> {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_default_gc_time(mut self, gc_time: Duration) -> Self {
        self.default_gc_time = gc_time;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_persist_key(mut self, key: impl Into<String>) -> Self {
        self.persist_key = key.into();
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn EntryCodec<T>>) -> Self {
        self.codec = codec;
        self
    }

    fn persistence(&self) -> Option<&Arc<dyn StorageBackend>> {
        if self.persist {
            self.storage.as_ref()
        } else {
            None
        }
    }
}

impl<T> Clone for StoreConfig<T> {
    fn clone(&self) -> Self {
        Self {
            max_entries: self.max_entries,
            default_gc_time: self.default_gc_time,
            persist: self.persist,
            persist_key: self.persist_key.clone(),
            storage: self.storage.clone(),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<T> fmt::Debug for StoreConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("max_entries", &self.max_entries)
            .field("default_gc_time", &self.default_gc_time)
            .field("persist", &self.persist)
            .field("persist_key", &self.persist_key)
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

/// Per-write options for [`Store::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Arms a GC timer for the written entry. `None` leaves it unscheduled.
    pub gc_time: Option<Duration>,
}

impl SetOptions {
    pub fn with_gc_time(gc_time: Duration) -> Self {
        Self {
            gc_time: Some(gc_time),
        }
    }
}

enum PersistOp {
    Write(Vec<u8>),
    Remove,
}

struct StoreInner<T> {
    config: StoreConfig<T>,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    gc_timers: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    next_timer_id: AtomicU64,
    access_seq: AtomicU64,
    stats: CacheStats,
    listeners: ListenerSet<CacheEvent<T>>,
    persist_seq: AtomicU64,
    // highest sequence already written; serializes backend writes
    persisted: tokio::sync::Mutex<u64>,
    pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> Drop for StoreInner<T> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.gc_timers.get_mut().drain() {
            handle.abort();
        }
    }
}

/// Thread-safe keyed store. Cloning yields another handle to the same table.
///
/// # Examples
///
/// ```
/// use forge_query_core::{QueryKey, QueryState, SetOptions, Store, StoreConfig};
///
/// let store = Store::new(StoreConfig::default().with_max_entries(2));
/// store.set(&QueryKey::from("a"), QueryState::seeded(1, 0), SetOptions::default());
/// store.set(&QueryKey::from("b"), QueryState::seeded(2, 0), SetOptions::default());
///
/// assert_eq!(store.get(&QueryKey::from("a")).and_then(|e| e.state.data), Some(1));
/// assert_eq!(store.len(), 2);
///
/// // "b" is now the least recently accessed entry
/// store.set(&QueryKey::from("c"), QueryState::seeded(3, 0), SetOptions::default());
/// assert!(!store.has(&QueryKey::from("b")));
/// ```
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.entries.read().len())
            .finish()
    }
}

impl<T: QueryData> Store<T> {
    /// Creates a store driven by tokio time.
    pub fn new(config: StoreConfig<T>) -> Self {
        Self::with_clock(config, Arc::new(TokioClock::new()))
    }

    pub fn with_clock(config: StoreConfig<T>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                clock,
                entries: RwLock::new(HashMap::new()),
                gc_timers: Mutex::new(HashMap::new()),
                next_timer_id: AtomicU64::new(1),
                access_seq: AtomicU64::new(1),
                stats: CacheStats::new(),
                listeners: ListenerSet::new(),
                persist_seq: AtomicU64::new(0),
                persisted: tokio::sync::Mutex::new(0),
                pending_writes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a store and loads the persisted table, if persistence is enabled.
    ///
    /// A missing or unreadable table leaves the store empty.
    pub async fn open(config: StoreConfig<T>, clock: Arc<dyn Clock>) -> Self {
        let store = Self::with_clock(config, clock);
        if let Err(err) = store.restore().await {
            warn!(error = %err, "failed to restore persisted cache; starting empty");
        }
        store
    }

    pub fn config(&self) -> &StoreConfig<T> {
        &self.inner.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Looks up an entry, counting a hit or a miss.
    ///
    /// A hit refreshes the entry's recency and emits a `get` event.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
        let hash = key.hash();
        let now = self.inner.clock.now();
        let found = {
            let mut entries = self.inner.entries.write();
            entries.get_mut(&hash).map(|entry| {
                entry.touch(now, self.next_access_seq());
                entry.clone()
            })
        };

        match &found {
            Some(entry) => {
                self.inner.stats.record_hit();
                self.emit(
                    CacheEvent::new(CacheEventKind::Get, Some(entry.key.clone()), now)
                        .with_data(entry.state.data.clone()),
                );
            }
            None => self.inner.stats.record_miss(),
        }
        found
    }

    /// Reads an entry without touching counters or recency.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
        self.inner.entries.read().get(&key.hash()).cloned()
    }

    pub fn has(&self, key: &QueryKey) -> bool {
        self.inner.entries.read().contains_key(&key.hash())
    }

    /// Creates or updates the entry for `key`.
    ///
    /// Any pending GC timer of the entry is cancelled; `options.gc_time` arms a new
    /// one. Inserting a new key into a full store first evicts the least recently
    /// accessed entry. A store with `max_entries == 0` keeps nothing.
    pub fn set(&self, key: &QueryKey, state: QueryState<T>, options: SetOptions) {
        if self.inner.config.max_entries == 0 {
            trace!(key = %key, "caching disabled, entry not stored");
            return;
        }
        let hash = key.hash();
        let now = self.inner.clock.now();
        self.cancel_gc_hash(&hash);

        let evicted = {
            let mut entries = self.inner.entries.write();
            let evicted = if !entries.contains_key(&hash)
                && entries.len() >= self.inner.config.max_entries
            {
                least_recently_accessed(&entries)
                    .and_then(|victim| entries.remove(&victim))
            } else {
                None
            };

            let seq = self.next_access_seq();
            match entries.get_mut(&hash) {
                Some(entry) => entry.update(state.clone(), now, seq),
                None => {
                    let mut entry = CacheEntry::new(key.clone(), state.clone(), now);
                    entry.access_seq = seq;
                    entries.insert(hash.clone(), entry);
                }
            }
            evicted
        };

        if let Some(victim) = evicted {
            self.cancel_gc_hash(&victim.hash);
            self.inner.stats.record_eviction();
            debug!(key = %victim.key, "evicted least recently accessed entry");
            self.emit(CacheEvent::new(CacheEventKind::Delete, Some(victim.key), now));
        }

        self.emit(CacheEvent::new(CacheEventKind::Set, Some(key.clone()), now).with_data(state.data));

        if let Some(gc_time) = options.gc_time {
            self.schedule_gc(key, gc_time);
        }
        self.persist();
    }

    /// Removes the entry for `key`, cancelling its GC timer.
    pub fn delete(&self, key: &QueryKey) -> bool {
        let hash = key.hash();
        self.cancel_gc_hash(&hash);
        let removed = self.inner.entries.write().remove(&hash);
        match removed {
            Some(entry) => {
                self.emit(CacheEvent::new(
                    CacheEventKind::Delete,
                    Some(entry.key),
                    self.inner.clock.now(),
                ));
                self.persist();
                true
            }
            None => false,
        }
    }

    /// Removes every entry, cancels every GC timer and resets the counters.
    pub fn clear(&self) {
        let timers: Vec<JoinHandle<()>> = self
            .inner
            .gc_timers
            .lock()
            .drain()
            .map(|(_, (_, handle))| handle)
            .collect();
        for handle in timers {
            handle.abort();
        }

        self.inner.entries.write().clear();
        self.inner.stats.reset();
        self.emit(CacheEvent::new(
            CacheEventKind::Clear,
            None,
            self.inner.clock.now(),
        ));

        if self.inner.config.persistence().is_some() {
            self.spawn_persist(PersistOp::Remove);
        }
    }

    /// Arms a one-shot timer deleting the entry after `ttl`, replacing any existing
    /// timer for the key. `NEVER` only cancels. Absent keys are ignored.
    pub fn schedule_gc(&self, key: &QueryKey, ttl: Duration) {
        let hash = key.hash();
        if !self.inner.entries.read().contains_key(&hash) {
            return;
        }
        if ttl == NEVER {
            self.cancel_gc_hash(&hash);
            return;
        }

        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let sleep = self.inner.clock.sleep(ttl);
        let weak: Weak<StoreInner<T>> = Arc::downgrade(&self.inner);
        let timer_hash = hash.clone();

        // the timer table stays locked until the handle is stored, so a zero ttl
        // cannot fire before its id is registered
        let mut timers = self.inner.gc_timers.lock();
        let spawned = spawn_timer(async move {
            sleep.await;
            if let Some(inner) = weak.upgrade() {
                Store { inner }.fire_gc(&timer_hash, id);
            }
        });
        if let Some(handle) = spawned {
            if let Some((_, previous)) = timers.insert(hash, (id, handle)) {
                previous.abort();
            }
        }
    }

    pub fn cancel_gc(&self, key: &QueryKey) {
        self.cancel_gc_hash(&key.hash());
    }

    pub fn has_pending_gc(&self, key: &QueryKey) -> bool {
        self.inner.gc_timers.lock().contains_key(&key.hash())
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Vec<CacheEntry<T>> {
        self.inner.entries.read().values().cloned().collect()
    }

    /// Entries for which `predicate` returns `true`.
    pub fn find<P>(&self, predicate: P) -> Vec<CacheEntry<T>>
    where
        P: Fn(&CacheEntry<T>) -> bool,
    {
        self.inner
            .entries
            .read()
            .values()
            .filter(|entry| predicate(entry))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Read-only summary; never changes the counters.
    pub fn stats(&self) -> StoreStats {
        let entries = self.inner.entries.read();
        let size = entries.values().filter_map(CacheEntry::data_size).sum();
        let oldest_entry = entries.values().map(|e| e.created_at).min();
        let newest_entry = entries.values().map(|e| e.created_at).max();
        StoreStats {
            entries: entries.len(),
            hits: self.inner.stats.hits(),
            misses: self.inner.stats.misses(),
            hit_rate: self.inner.stats.hit_rate(),
            size,
            oldest_entry,
            newest_entry,
        }
    }

    /// Raw counters, including LRU evictions.
    pub fn counters(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Registers a cache event listener.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&CacheEvent<T>) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.add(Arc::new(listener));
        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(id);
            }
        })
    }

    /// Loads the persisted table. Keys already present are kept; entries beyond
    /// `max_entries` are dropped. Returns the number of restored entries.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let Some(storage) = self.inner.config.persistence() else {
            return Ok(0);
        };
        let Some(bytes) = storage.get_item(&self.inner.config.persist_key).await? else {
            return Ok(0);
        };
        let mut decoded = self.inner.config.codec.decode(&bytes)?;
        decoded.sort_by_key(CacheEntry::recency);

        let mut restored = 0;
        let mut entries = self.inner.entries.write();
        for mut entry in decoded {
            if entries.len() >= self.inner.config.max_entries {
                break;
            }
            // recompute in case the table was written by another canonicalizer
            entry.hash = entry.key.hash();
            if entries.contains_key(&entry.hash) {
                continue;
            }
            entry.access_seq = self.next_access_seq();
            entries.insert(entry.hash.clone(), entry);
            restored += 1;
        }
        debug!(restored, "restored persisted cache entries");
        Ok(restored)
    }

    /// Waits for every persistence write scheduled so far.
    pub async fn flush(&self) {
        let pending: Vec<JoinHandle<()>> = self.inner.pending_writes.lock().drain(..).collect();
        for handle in pending {
            let _ = handle.await;
        }
    }

    fn fire_gc(&self, hash: &str, id: u64) {
        {
            let mut timers = self.inner.gc_timers.lock();
            match timers.get(hash) {
                Some((current, _)) if *current == id => {
                    timers.remove(hash);
                }
                _ => return,
            }
        }

        let removed = self.inner.entries.write().remove(hash);
        if let Some(entry) = removed {
            trace!(key = %entry.key, "garbage collected entry");
            let now = self.inner.clock.now();
            self.emit(CacheEvent::new(CacheEventKind::Delete, Some(entry.key.clone()), now));
            self.emit(CacheEvent::new(CacheEventKind::Gc, Some(entry.key), now));
            self.persist();
        }
    }

    fn cancel_gc_hash(&self, hash: &str) {
        if let Some((_, handle)) = self.inner.gc_timers.lock().remove(hash) {
            handle.abort();
        }
    }

    fn next_access_seq(&self) -> u64 {
        self.inner.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: CacheEvent<T>) {
        self.inner.listeners.notify(&event);
    }

    /// Encodes the table now and writes it in the background.
    fn persist(&self) {
        if self.inner.config.persistence().is_none() {
            return;
        }
        let snapshot: Vec<CacheEntry<T>> = self.entries();
        match self.inner.config.codec.encode(&snapshot) {
            Ok(bytes) => self.spawn_persist(PersistOp::Write(bytes)),
            Err(err) => warn!(error = %err, "failed to encode cache for persistence"),
        }
    }

    fn spawn_persist(&self, op: PersistOp) {
        let Some(storage) = self.inner.config.persistence().cloned() else {
            return;
        };
        let seq = self.inner.persist_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let key = self.inner.config.persist_key.clone();
        let weak = Arc::downgrade(&self.inner);

        let handle = spawn_timer(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut written = inner.persisted.lock().await;
            if *written > seq {
                trace!(seq, "skipping superseded cache snapshot");
                return;
            }
            let result = match op {
                PersistOp::Write(bytes) => storage.set_item(&key, bytes).await,
                PersistOp::Remove => storage.remove_item(&key).await,
            };
            match result {
                Ok(()) => *written = seq,
                Err(err) => warn!(error = %err, "failed to persist cache"),
            }
        });

        if let Some(handle) = handle {
            let mut pending = self.inner.pending_writes.lock();
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
    }
}

fn least_recently_accessed<T>(entries: &HashMap<String, CacheEntry<T>>) -> Option<String> {
    entries
        .values()
        .min_by_key(|entry| entry.recency())
        .map(|entry| entry.hash.clone())
}
