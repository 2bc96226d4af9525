//! The query client: owns every record, mirrors their state into the store, and
//! fans invalidation, refetch, removal and cancellation out across keys.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use forge_query_core::{
    CacheEvent, CacheEventKind, CacheStats, Clock, ListenerSet, QueryData, QueryError, QueryKey,
    QueryState, SetOptions, Store, StoreConfig, StoreStats, TokioClock, Unsubscribe,
};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::filter::QueryFilter;
use crate::log::{EventLog, LogEntry, LogKind, DEFAULT_MAX_LOGS};
use crate::options::{QueryDefaults, QueryOptions};
use crate::record::{QueryRecord, RecordChange, RecordObserver};

/// Client configuration.
///
/// ```
/// use forge_query_async::{ClientConfig, QueryDefaults};
/// use forge_query_core::StoreConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::<String>::default()
///     .with_store(StoreConfig::default().with_max_entries(200))
///     .with_defaults(QueryDefaults::default().with_stale_time(Duration::from_secs(30)))
///     .with_max_logs(0);
/// assert_eq!(config.store.max_entries, 200);
/// ```
pub struct ClientConfig<T> {
    pub store: StoreConfig<T>,
    pub defaults: QueryDefaults,
    /// Retained lifecycle log entries; `0` disables the log.
    pub max_logs: usize,
    pub clock: Arc<dyn Clock>,
}

impl<T: QueryData> Default for ClientConfig<T> {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            defaults: QueryDefaults::default(),
            max_logs: DEFAULT_MAX_LOGS,
            clock: Arc::new(TokioClock::new()),
        }
    }
}

impl<T> ClientConfig<T> {
    pub fn with_store(mut self, store: StoreConfig<T>) -> Self {
        self.store = store;
        self
    }

    pub fn with_defaults(mut self, defaults: QueryDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_max_logs(mut self, max_logs: usize) -> Self {
        self.max_logs = max_logs;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl<T> fmt::Debug for ClientConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("store", &self.store)
            .field("defaults", &self.defaults)
            .field("max_logs", &self.max_logs)
            .field("clock", &self.clock)
            .finish()
    }
}

/// One record as seen by [`QueryClient::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct RecordSnapshot<T> {
    pub id: Uuid,
    pub key: QueryKey,
    pub hash: String,
    pub state: QueryState<T>,
    pub observers: usize,
    pub is_stale: bool,
    pub is_active: bool,
}

/// Read-only composite view for introspection tooling.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot<T> {
    /// Sorted by key hash.
    pub records: Vec<RecordSnapshot<T>>,
    pub logs: Vec<LogEntry<T>>,
    pub cache_stats: StoreStats,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct ClientInner<T> {
    records: RwLock<HashMap<String, QueryRecord<T>>>,
    store: Store<T>,
    defaults: QueryDefaults,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
    log: EventLog<T>,
    listeners: ListenerSet<CacheEvent<T>>,
    store_subscription: Mutex<Option<Unsubscribe>>,
    this: Weak<ClientInner<T>>,
}

impl<T> Drop for ClientInner<T> {
    fn drop(&mut self) {
        if let Some(subscription) = self.store_subscription.get_mut().take() {
            subscription.unsubscribe();
        }
    }
}

/// Central manager of every query.
///
/// Cloning yields another handle to the same client.
///
/// # Examples
///
/// ```
/// use forge_query_async::{loader, ClientConfig, QueryClient, QueryFilter, QueryOptions};
/// use forge_query_core::query_key;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = QueryClient::new(ClientConfig::default());
///
/// let todos = client
///     .fetch_query(
///         QueryOptions::new(query_key!["todos"])
///             .with_loader(loader(|_| async { Ok::<_, std::io::Error>(vec![1, 2, 3]) })),
///     )
///     .await
///     .unwrap();
/// assert_eq!(todos, vec![1, 2, 3]);
///
/// assert_eq!(client.invalidate_queries(QueryFilter::key(query_key!["todos"])), 1);
/// assert_eq!(client.get_data(&query_key!["todos"]), Some(vec![1, 2, 3]));
/// # }
/// ```
pub struct QueryClient<T> {
    inner: Arc<ClientInner<T>>,
}

impl<T> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for QueryClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("records", &self.inner.records.read().len())
            .field("defaults", &self.inner.defaults)
            .finish()
    }
}

impl<T: QueryData> QueryClient<T> {
    pub fn new(config: ClientConfig<T>) -> Self {
        let store = Store::with_clock(config.store, Arc::clone(&config.clock));
        Self::with_store(store, config.defaults, config.max_logs, config.clock)
    }

    /// Creates a client over a restored store and seeds a record for every
    /// persisted entry that holds data.
    ///
    /// Seeded records have no loader until a later [`QueryClient::resolve`]
    /// supplies one.
    pub async fn open(config: ClientConfig<T>) -> Self {
        let store = Store::open(config.store, Arc::clone(&config.clock)).await;
        let client = Self::with_store(store, config.defaults, config.max_logs, config.clock);
        client.hydrate();
        client
    }

    fn with_store(
        store: Store<T>,
        defaults: QueryDefaults,
        max_logs: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<ClientInner<T>>| {
            let weak = this.clone();
            let subscription = store.subscribe(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_store_event(event);
                }
            });
            ClientInner {
                records: RwLock::new(HashMap::new()),
                store,
                defaults,
                clock,
                stats: CacheStats::new(),
                log: EventLog::new(max_logs),
                listeners: ListenerSet::new(),
                store_subscription: Mutex::new(Some(subscription)),
                this: this.clone(),
            }
        });
        Self { inner }
    }

    fn hydrate(&self) {
        let mut seeded = 0;
        for entry in self.inner.store.entries() {
            let Some(data) = entry.state.data else {
                continue;
            };
            let options = QueryOptions::new(entry.key)
                .with_initial_data(data)
                .with_initial_data_updated_at(entry.state.data_updated_at);
            let record = self.inner.create_record(options);
            let previous = self
                .inner
                .records
                .write()
                .insert(record.hash().to_string(), record);
            if let Some(previous) = previous {
                previous.destroy();
            }
            seeded += 1;
        }
        debug!(seeded, "hydrated query records from persisted cache");
    }

    pub fn store(&self) -> &Store<T> {
        &self.inner.store
    }

    pub fn defaults(&self) -> &QueryDefaults {
        &self.inner.defaults
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Returns the record for `options.key`, creating it on first use.
    ///
    /// Creating counts a miss. Resolving an existing record that holds data counts
    /// a hit; its options are kept, except that a loader is attached if the record
    /// has none.
    pub fn resolve(&self, options: QueryOptions<T>) -> QueryRecord<T> {
        let hash = options.key.hash();
        let existing = self.inner.records.read().get(&hash).cloned();
        if let Some(record) = existing {
            self.on_existing(&record, options);
            return record;
        }

        let key = options.key.clone();
        let fresh = self.inner.create_record(options.clone());
        let winner = match self.inner.records.write().entry(hash) {
            Entry::Occupied(occupied) => Err(occupied.get().clone()),
            Entry::Vacant(vacant) => Ok(vacant.insert(fresh.clone()).clone()),
        };

        match winner {
            Ok(record) => {
                self.inner.stats.record_miss();
                self.inner
                    .log(LogKind::Cache, &key, "Cache miss - Query created", None, None);
                self.inner
                    .store
                    .set(&key, record.state(), SetOptions::default());
                record
            }
            Err(record) => {
                // lost a creation race; keep the registered record
                fresh.destroy();
                self.on_existing(&record, options);
                record
            }
        }
    }

    fn on_existing(&self, record: &QueryRecord<T>, options: QueryOptions<T>) {
        if !record.has_loader() {
            if let Some(loader) = options.loader {
                record.set_options(QueryOptions::new(options.key.clone()).with_loader(loader));
            }
        }
        if record.state().data.is_some() {
            self.inner.stats.record_hit();
            self.inner
                .log(LogKind::Cache, &options.key, "Cache hit", None, None);
        }
    }

    /// Resolves the record and fetches it, joining any fetch in flight.
    pub async fn fetch_query(&self, options: QueryOptions<T>) -> Result<T, QueryError> {
        let key = options.key.clone();
        let record = self.resolve(options);
        let started = self.inner.clock.now();
        self.inner
            .log(LogKind::Fetch, &key, "Fetching started", None, None);

        match record.fetch().await {
            Ok(data) => {
                let elapsed = self.inner.clock.now().saturating_sub(started);
                self.inner.log(
                    LogKind::Success,
                    &key,
                    format!("Fetched in {elapsed}ms"),
                    Some(data.clone()),
                    None,
                );
                Ok(data)
            }
            Err(err) => {
                let elapsed = self.inner.clock.now().saturating_sub(started);
                self.inner.log(
                    LogKind::Error,
                    &key,
                    format!("Fetch failed after {elapsed}ms"),
                    None,
                    Some(&err),
                );
                Err(err)
            }
        }
    }

    /// Like [`QueryClient::fetch_query`], but failures are swallowed.
    pub async fn prefetch_query(&self, options: QueryOptions<T>) {
        if let Err(err) = self.fetch_query(options).await {
            trace!(error = %err, "prefetch failed");
        }
    }

    /// Cached data for `key`, read through the store.
    ///
    /// `None` when no record is registered for `key` or when the store has
    /// evicted its entry; the entry comes back with the record's next state change.
    pub fn get_data(&self, key: &QueryKey) -> Option<T> {
        self.record(key)?;
        self.inner.store.get(key).and_then(|entry| entry.state.data)
    }

    /// Writes data directly, creating a loader-less record if none exists.
    pub fn set_data(&self, key: &QueryKey, data: T) {
        self.record_for_write(key).set_data(data);
        self.inner
            .log(LogKind::Cache, key, "Data updated manually", None, None);
    }

    /// Writes data computed from the previous value.
    pub fn update_data<F>(&self, key: &QueryKey, update: F)
    where
        F: FnOnce(Option<&T>) -> T,
    {
        self.record_for_write(key).update_data(update);
        self.inner
            .log(LogKind::Cache, key, "Data updated manually", None, None);
    }

    fn record_for_write(&self, key: &QueryKey) -> QueryRecord<T> {
        let hash = key.hash();
        if let Some(record) = self.inner.records.read().get(&hash) {
            return record.clone();
        }
        let fresh = self.inner.create_record(QueryOptions::new(key.clone()));
        let (record, created) = match self.inner.records.write().entry(hash) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => (vacant.insert(fresh.clone()).clone(), true),
        };
        if !created {
            fresh.destroy();
        }
        record
    }

    /// Marks matching records stale. Prefix matching unless `exact` is set.
    ///
    /// Returns the number of invalidated records.
    pub fn invalidate_queries(&self, filter: QueryFilter<T>) -> usize {
        let matched = self.select(&filter, false);
        for record in &matched {
            record.invalidate();
            self.inner
                .log(LogKind::Invalidate, record.key(), "Query invalidated", None, None);
        }
        matched.len()
    }

    /// Refetches matching active records concurrently.
    ///
    /// Inactive records are skipped. Each fetch settles on its own; one failure
    /// never cancels the others.
    pub async fn refetch_queries(&self, filter: QueryFilter<T>) -> Vec<Result<T, QueryError>> {
        let fetches: Vec<_> = self
            .select(&filter, false)
            .into_iter()
            .filter(QueryRecord::is_active)
            .map(|record| record.fetch())
            .collect();
        join_all(fetches).await
    }

    /// Destroys matching records and deletes their store entries.
    pub fn remove_queries(&self, filter: QueryFilter<T>) -> usize {
        let matched = self.select(&filter, false);
        {
            let mut records = self.inner.records.write();
            for record in &matched {
                if records
                    .get(record.hash())
                    .map_or(false, |r| r.id() == record.id())
                {
                    records.remove(record.hash());
                }
            }
        }
        for record in &matched {
            record.destroy();
            self.inner.store.delete(record.key());
        }
        debug!(removed = matched.len(), "removed queries");
        matched.len()
    }

    /// Resets matching records to their initial state, abandoning in-flight
    /// fetches. Exact matching unless `exact` is set.
    pub fn cancel_queries(&self, filter: QueryFilter<T>) -> usize {
        let matched = self.select(&filter, true);
        for record in &matched {
            record.reset();
        }
        matched.len()
    }

    /// Destroys every record and clears the store and the log.
    pub fn clear(&self) {
        let records: Vec<QueryRecord<T>> = self
            .inner
            .records
            .write()
            .drain()
            .map(|(_, record)| record)
            .collect();
        for record in records {
            record.destroy();
        }
        self.inner.store.clear();
        self.inner.log.clear();
    }

    /// Number of matching records with a fetch in flight.
    pub fn fetching_count(&self, filter: QueryFilter<T>) -> usize {
        self.select(&filter, false)
            .iter()
            .filter(|record| record.state().is_fetching())
            .count()
    }

    /// Refetches every active stale record that opted into refetch on focus.
    /// Returns the number of fetches started.
    pub fn notify_focus(&self) -> usize {
        if !self.inner.defaults.refetch_on_focus {
            return 0;
        }
        self.refetch_where(|record| {
            record.refetch_on_focus() && record.is_active() && record.is_stale()
        })
    }

    /// Refetches every active record that opted into refetch on reconnect.
    /// Returns the number of fetches started.
    pub fn notify_online(&self) -> usize {
        if !self.inner.defaults.refetch_on_reconnect {
            return 0;
        }
        self.refetch_where(|record| record.refetch_on_reconnect() && record.is_active())
    }

    fn refetch_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&QueryRecord<T>) -> bool,
    {
        let matched: Vec<QueryRecord<T>> = self
            .records()
            .into_iter()
            .filter(|record| predicate(record))
            .collect();
        for record in &matched {
            // the fetch runs as its own task
            drop(record.fetch());
        }
        matched.len()
    }

    /// Registers a listener for store events and record lifecycle events.
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

    /// Read-only view of every record, the log and the counters.
    pub fn snapshot(&self) -> ClientSnapshot<T> {
        let mut records: Vec<RecordSnapshot<T>> = self
            .records()
            .into_iter()
            .map(|record| RecordSnapshot {
                id: record.id(),
                key: record.key().clone(),
                hash: record.hash().to_string(),
                state: record.state(),
                observers: record.observer_count(),
                is_stale: record.is_stale(),
                is_active: record.is_active(),
            })
            .collect();
        records.sort_by(|a, b| a.hash.cmp(&b.hash));

        ClientSnapshot {
            records,
            logs: self.inner.log.entries(),
            cache_stats: self.inner.store.stats(),
            hits: self.inner.stats.hits(),
            misses: self.inner.stats.misses(),
            hit_rate: self.inner.stats.hit_rate(),
        }
    }

    /// The registered record for `key`, if any. Does not count a hit or a miss.
    pub fn record(&self, key: &QueryKey) -> Option<QueryRecord<T>> {
        self.inner.records.read().get(&key.hash()).cloned()
    }

    pub fn records(&self) -> Vec<QueryRecord<T>> {
        self.inner.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }

    fn select(&self, filter: &QueryFilter<T>, default_exact: bool) -> Vec<QueryRecord<T>> {
        self.records()
            .into_iter()
            .filter(|record| filter.matches(record, default_exact))
            .collect()
    }
}

impl<T: QueryData> ClientInner<T> {
    fn create_record(&self, options: QueryOptions<T>) -> QueryRecord<T> {
        let observer: Weak<dyn RecordObserver<T>> = self.this.clone();
        QueryRecord::with_observer(options, &self.defaults, Arc::clone(&self.clock), observer)
    }

    fn is_registered(&self, record: &QueryRecord<T>) -> bool {
        self.records
            .read()
            .get(record.hash())
            .map_or(false, |r| r.id() == record.id())
    }

    fn log(
        &self,
        kind: LogKind,
        key: &QueryKey,
        message: impl Into<String>,
        data: Option<T>,
        error: Option<&QueryError>,
    ) {
        self.log.push(LogEntry {
            id: Uuid::new_v4(),
            timestamp: self.clock.now(),
            kind,
            key: key.clone(),
            message: message.into(),
            data,
            error: error.map(ToString::to_string),
        });
    }

    fn emit(&self, event: CacheEvent<T>) {
        self.listeners.notify(&event);
    }

    /// Store events are forwarded as is. A store eviction drops only the entry;
    /// records leave the registry through removal, `clear` or their own GC.
    fn on_store_event(&self, event: &CacheEvent<T>) {
        self.emit(event.clone());
    }
}

impl<T: QueryData> RecordObserver<T> for ClientInner<T> {
    fn state_changed(&self, record: &QueryRecord<T>, state: &QueryState<T>, change: RecordChange) {
        if !self.is_registered(record) {
            return;
        }
        self.store
            .set(record.key(), state.clone(), SetOptions::default());

        let now = self.clock.now();
        let key = Some(record.key().clone());
        let event = match change {
            RecordChange::FetchStarted => CacheEvent::new(CacheEventKind::Fetch, key, now),
            RecordChange::Succeeded => {
                CacheEvent::new(CacheEventKind::Success, key, now).with_data(state.data.clone())
            }
            RecordChange::Failed => match &state.error {
                Some(err) => CacheEvent::new(CacheEventKind::Error, key, now).with_error(err),
                None => CacheEvent::new(CacheEventKind::Error, key, now),
            },
            RecordChange::Invalidated => CacheEvent::new(CacheEventKind::Invalidate, key, now),
            RecordChange::FetchFailed
            | RecordChange::Cancelled
            | RecordChange::DataSet
            | RecordChange::Reset => return,
        };
        self.emit(event);
    }

    fn evicted(&self, record: &QueryRecord<T>) {
        let removed = {
            let mut records = self.records.write();
            let current = records
                .get(record.hash())
                .map_or(false, |r| r.id() == record.id());
            if current {
                records.remove(record.hash())
            } else {
                None
            }
        };
        record.destroy();
        if removed.is_some() {
            debug!(key = %record.key(), "query garbage collected");
            self.store.delete(record.key());
            self.emit(CacheEvent::new(
                CacheEventKind::Gc,
                Some(record.key().clone()),
                self.clock.now(),
            ));
        }
    }
}
