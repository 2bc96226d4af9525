//! One query's lifecycle: fetch with de-duplication and retry, staleness,
//! subscribers, periodic refetch and eviction.
//!
//! A record is active while it has subscribers. An inactive record schedules its
//! own eviction after `gc_time`; the eviction timer is armed as soon as the record
//! is created and cancelled by the first subscriber.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use forge_query_core::clock::{as_millis, spawn_timer};
use forge_query_core::{
    Clock, FetchStatus, ListenerSet, QueryData, QueryError, QueryKey, QueryState, QueryStatus,
    RetryDelay, RetryPolicy, Unsubscribe, NEVER,
};
use futures_util::future::{self, BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::options::{Loader, QueryContext, QueryDefaults, QueryOptions, ResolvedOptions};

/// Future of an in-flight fetch. Cloning it joins the same fetch.
pub type FetchFuture<T> = Shared<BoxFuture<'static, Result<T, QueryError>>>;

/// Why a record notified its observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordChange {
    FetchStarted,
    /// An attempt failed; a retry may follow.
    FetchFailed,
    Succeeded,
    /// Retries exhausted, or no loader bound.
    Failed,
    Cancelled,
    DataSet,
    Invalidated,
    Reset,
}

/// Internal observer of a record.
///
/// Unlike subscribers, an observer does not make the record active and never
/// holds off its eviction.
pub trait RecordObserver<T>: Send + Sync {
    fn state_changed(&self, record: &QueryRecord<T>, state: &QueryState<T>, change: RecordChange);

    /// The eviction timer fired. Without an observer the record destroys itself.
    fn evicted(&self, record: &QueryRecord<T>);
}

struct InFlight<T> {
    seq: u64,
    future: FetchFuture<T>,
}

struct RecordState<T> {
    state: QueryState<T>,
    options: ResolvedOptions<T>,
    in_flight: Option<InFlight<T>>,
    fetch_seq: u64,
    signal: Option<CancellationToken>,
    timer_seq: u64,
    eviction: Option<(u64, JoinHandle<()>)>,
    interval: Option<JoinHandle<()>>,
}

struct RecordInner<T> {
    id: Uuid,
    key: QueryKey,
    hash: String,
    clock: Arc<dyn Clock>,
    state: Mutex<RecordState<T>>,
    listeners: ListenerSet<QueryState<T>>,
    observer: Option<Weak<dyn RecordObserver<T>>>,
}

impl<T> Drop for RecordInner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some((_, handle)) = state.eviction.take() {
            handle.abort();
        }
        if let Some(handle) = state.interval.take() {
            handle.abort();
        }
        if let Some(signal) = state.signal.take() {
            signal.cancel();
        }
    }
}

/// Handle to one query. Clones share the same record.
///
/// ```
/// use forge_query_async::{loader, QueryDefaults, QueryOptions, QueryRecord};
/// use forge_query_core::TokioClock;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let record = QueryRecord::new(
///     QueryOptions::new("greeting")
///         .with_loader(loader(|_| async { Ok::<_, std::io::Error>("hello".to_string()) })),
///     &QueryDefaults::default(),
///     Arc::new(TokioClock::new()),
/// );
///
/// // both callers share one loader invocation
/// let (a, b) = tokio::join!(record.fetch(), record.fetch());
/// assert_eq!(a.unwrap(), b.unwrap());
/// assert!(record.state().is_success());
/// # }
/// ```
pub struct QueryRecord<T> {
    inner: Arc<RecordInner<T>>,
}

impl<T> Clone for QueryRecord<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for QueryRecord<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRecord")
            .field("id", &self.inner.id)
            .field("key", &self.inner.hash)
            .field("observers", &self.inner.listeners.len())
            .finish()
    }
}

impl<T: QueryData> QueryRecord<T> {
    pub fn new(options: QueryOptions<T>, defaults: &QueryDefaults, clock: Arc<dyn Clock>) -> Self {
        Self::build(options, defaults, clock, None)
    }

    /// Creates a record reporting every state change to `observer`.
    pub fn with_observer(
        options: QueryOptions<T>,
        defaults: &QueryDefaults,
        clock: Arc<dyn Clock>,
        observer: Weak<dyn RecordObserver<T>>,
    ) -> Self {
        Self::build(options, defaults, clock, Some(observer))
    }

    fn build(
        options: QueryOptions<T>,
        defaults: &QueryDefaults,
        clock: Arc<dyn Clock>,
        observer: Option<Weak<dyn RecordObserver<T>>>,
    ) -> Self {
        let key = options.key.clone();
        let hash = key.hash();
        let options = options.resolve(defaults);
        let state = initial_state(&options, clock.now());

        let record = Self {
            inner: Arc::new(RecordInner {
                id: Uuid::new_v4(),
                key,
                hash,
                clock,
                state: Mutex::new(RecordState {
                    state,
                    options,
                    in_flight: None,
                    fetch_seq: 0,
                    signal: None,
                    timer_seq: 0,
                    eviction: None,
                    interval: None,
                }),
                listeners: ListenerSet::new(),
                observer,
            }),
        };

        {
            let mut guard = record.inner.state.lock();
            record.schedule_eviction(&mut guard);
        }
        trace!(key = %record.inner.hash, id = %record.inner.id, "query record created");
        record
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    pub fn hash(&self) -> &str {
        &self.inner.hash
    }

    /// Copy of the current state.
    pub fn state(&self) -> QueryState<T> {
        self.inner.state.lock().state.clone()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.lock().state.data.clone()
    }

    pub fn has_loader(&self) -> bool {
        self.inner.state.lock().options.loader.is_some()
    }

    pub fn stale_time(&self) -> Duration {
        self.inner.state.lock().options.stale_time
    }

    pub fn gc_time(&self) -> Duration {
        self.inner.state.lock().options.gc_time
    }

    pub(crate) fn refetch_on_focus(&self) -> bool {
        self.inner.state.lock().options.refetch_on_focus
    }

    pub(crate) fn refetch_on_reconnect(&self) -> bool {
        self.inner.state.lock().options.refetch_on_reconnect
    }

    /// Starts a fetch, or joins the one in flight.
    ///
    /// The fetch runs as a spawned task when a tokio runtime is available, so it
    /// completes even if the returned future is dropped. Late results of a fetch
    /// that was reset or destroyed never reach the record's state.
    pub fn fetch(&self) -> FetchFuture<T> {
        let mut guard = self.inner.state.lock();
        if let Some(in_flight) = &guard.in_flight {
            return in_flight.future.clone();
        }

        let Some(loader) = guard.options.loader.clone() else {
            let err = QueryError::NoLoader(self.inner.hash.clone());
            let now = self.inner.clock.now();
            let state = &mut guard.state;
            state.status = QueryStatus::Error;
            state.error = Some(err.clone());
            state.error_updated_at = now;
            state.fetch_status = FetchStatus::Idle;
            drop(guard);

            warn!(key = %self.inner.hash, "fetch attempted without a loader");
            self.notify(RecordChange::Failed);
            return future::ready(Err(err)).boxed().shared();
        };

        if let Some(previous) = guard.signal.take() {
            previous.cancel();
        }
        let signal = CancellationToken::new();
        guard.signal = Some(signal.clone());
        guard.fetch_seq += 1;
        let seq = guard.fetch_seq;

        guard.state.fetch_status = FetchStatus::Fetching;
        if guard.state.status == QueryStatus::Idle {
            guard.state.status = QueryStatus::Loading;
        }

        let ctx = QueryContext {
            key: self.inner.key.clone(),
            signal,
            meta: guard.options.meta.clone(),
        };
        let retry = guard.options.retry.clone();
        let retry_delay = guard.options.retry_delay.clone();

        let task = self.clone().run_fetch(seq, loader, ctx, retry, retry_delay);
        let future = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let join = handle.spawn(task);
                async move { join.await.unwrap_or(Err(QueryError::Cancelled)) }.boxed()
            }
            Err(_) => task.boxed(),
        }
        .shared();

        guard.in_flight = Some(InFlight {
            seq,
            future: future.clone(),
        });
        drop(guard);

        debug!(key = %self.inner.hash, seq, "fetch started");
        self.notify(RecordChange::FetchStarted);
        future
    }

    async fn run_fetch(
        self,
        seq: u64,
        loader: Loader<T>,
        ctx: QueryContext,
        retry: RetryPolicy,
        retry_delay: RetryDelay,
    ) -> Result<T, QueryError> {
        let mut failures = 0u32;
        let outcome = loop {
            if ctx.signal.is_cancelled() {
                break Err(QueryError::Cancelled);
            }

            let err = match invoke(&loader, ctx.clone()).await {
                Ok(data) => break Ok(data),
                Err(err) => err,
            };
            if ctx.signal.is_cancelled() {
                break Err(QueryError::Cancelled);
            }

            failures += 1;
            self.record_failure(seq, &err);
            if !retry.should_retry(failures, &err) {
                break Err(err);
            }

            let delay = retry_delay.delay(failures, &err);
            debug!(key = %self.inner.hash, failures, delay_ms = as_millis(delay), "retrying fetch");
            tokio::select! {
                _ = self.inner.clock.sleep(delay) => {}
                _ = ctx.signal.cancelled() => break Err(QueryError::Cancelled),
            }
        };

        self.settle(seq, outcome)
    }

    fn record_failure(&self, seq: u64, err: &QueryError) {
        {
            let mut guard = self.inner.state.lock();
            if guard.fetch_seq != seq {
                return;
            }
            guard.state.failure_count = guard.state.failure_count.saturating_add(1);
            guard.state.failure_reason = Some(err.clone());
        }
        self.notify(RecordChange::FetchFailed);
    }

    fn settle(&self, seq: u64, outcome: Result<T, QueryError>) -> Result<T, QueryError> {
        let mut guard = self.inner.state.lock();
        let current = guard.in_flight.as_ref().map_or(false, |f| f.seq == seq);
        if !current || guard.fetch_seq != seq {
            trace!(key = %self.inner.hash, seq, "ignoring result of superseded fetch");
            return outcome;
        }
        guard.in_flight = None;
        guard.signal = None;

        let now = self.inner.clock.now();
        let state = &mut guard.state;
        state.fetch_status = FetchStatus::Idle;
        let change = match &outcome {
            Ok(data) => {
                state.data = Some(data.clone());
                state.data_updated_at = now;
                state.error = None;
                state.error_updated_at = 0;
                state.failure_count = 0;
                state.failure_reason = None;
                state.status = QueryStatus::Success;
                state.is_invalidated = false;
                RecordChange::Succeeded
            }
            Err(QueryError::Cancelled) => {
                if state.status == QueryStatus::Loading {
                    state.status = QueryStatus::Idle;
                }
                RecordChange::Cancelled
            }
            Err(err) => {
                state.error = Some(err.clone());
                state.error_updated_at = now;
                state.failure_reason = Some(err.clone());
                state.status = QueryStatus::Error;
                RecordChange::Failed
            }
        };

        let on_success = guard.options.on_success.clone();
        let on_error = guard.options.on_error.clone();
        let on_settled = guard.options.on_settled.clone();
        drop(guard);

        match &outcome {
            Ok(_) => debug!(key = %self.inner.hash, "fetch succeeded"),
            Err(err) => debug!(key = %self.inner.hash, error = %err, "fetch failed"),
        }
        self.notify(change);

        if change != RecordChange::Cancelled {
            let (data, error) = match &outcome {
                Ok(data) => (Some(data), None),
                Err(err) => (None, Some(err)),
            };
            run_callback("on_success", || {
                if let (Some(f), Some(data)) = (&on_success, data) {
                    f(data);
                }
            });
            run_callback("on_error", || {
                if let (Some(f), Some(err)) = (&on_error, error) {
                    f(err);
                }
            });
            run_callback("on_settled", || {
                if let Some(f) = &on_settled {
                    f(data, error);
                }
            });
        }
        outcome
    }

    /// Writes data directly, bypassing the loader.
    ///
    /// The record becomes `success`; the fetch status is left as is.
    pub fn set_data(&self, data: T) {
        {
            let mut guard = self.inner.state.lock();
            let now = self.inner.clock.now();
            guard.state.data = Some(data);
            guard.state.data_updated_at = now;
            guard.state.status = QueryStatus::Success;
        }
        self.notify(RecordChange::DataSet);
    }

    /// Writes data computed from the previous value.
    pub fn update_data<F>(&self, update: F)
    where
        F: FnOnce(Option<&T>) -> T,
    {
        let previous = self.data();
        self.set_data(update(previous.as_ref()));
    }

    /// Marks the data stale without fetching.
    pub fn invalidate(&self) {
        self.inner.state.lock().state.is_invalidated = true;
        self.notify(RecordChange::Invalidated);
    }

    /// Returns `true` if invalidated, not successful, or older than `stale_time`.
    ///
    /// A zero `stale_time` makes data stale as soon as it arrives; `NEVER` disables
    /// time-based staleness.
    pub fn is_stale(&self) -> bool {
        let guard = self.inner.state.lock();
        is_stale_at(&guard.state, guard.options.stale_time, self.inner.clock.now())
    }

    /// Adds a subscriber.
    ///
    /// Cancels a pending eviction and (re)starts the refetch interval, if one is
    /// configured. When the last subscriber leaves, the interval stops and eviction
    /// is scheduled after `gc_time`.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&QueryState<T>) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.add(Arc::new(listener));
        {
            let mut guard = self.inner.state.lock();
            cancel_eviction(&mut guard);
            self.restart_interval(&mut guard);
        }

        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                QueryRecord { inner }.unsubscribe(id);
            }
        })
    }

    fn unsubscribe(&self, id: u64) {
        if !self.inner.listeners.remove(id) || !self.inner.listeners.is_empty() {
            return;
        }
        let mut guard = self.inner.state.lock();
        if let Some(handle) = guard.interval.take() {
            handle.abort();
        }
        self.schedule_eviction(&mut guard);
    }

    pub fn observer_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn is_active(&self) -> bool {
        !self.inner.listeners.is_empty()
    }

    pub fn has_pending_eviction(&self) -> bool {
        self.inner.state.lock().eviction.is_some()
    }

    /// Overlays every option set in `overlay`. The key is ignored.
    pub fn set_options(&self, overlay: QueryOptions<T>) {
        let mut guard = self.inner.state.lock();
        guard.options.apply(overlay);
        if self.is_active() {
            self.restart_interval(&mut guard);
        }
    }

    /// Restores the initial state and abandons any in-flight fetch.
    pub fn reset(&self) {
        {
            let mut guard = self.inner.state.lock();
            abandon_fetch(&mut guard);
            guard.state = initial_state(&guard.options, self.inner.clock.now());
        }
        debug!(key = %self.inner.hash, "query reset");
        self.notify(RecordChange::Reset);
    }

    /// Cancels the in-flight fetch and every timer, and drops all subscribers.
    /// Calling it again is harmless.
    pub fn destroy(&self) {
        {
            let mut guard = self.inner.state.lock();
            abandon_fetch(&mut guard);
            cancel_eviction(&mut guard);
            if let Some(handle) = guard.interval.take() {
                handle.abort();
            }
            guard.state.fetch_status = FetchStatus::Idle;
            if guard.state.status == QueryStatus::Loading {
                guard.state.status = QueryStatus::Idle;
            }
        }
        self.inner.listeners.clear();
        trace!(key = %self.inner.hash, "query record destroyed");
    }

    fn schedule_eviction(&self, guard: &mut RecordState<T>) {
        cancel_eviction(guard);
        let gc_time = guard.options.gc_time;
        if gc_time == NEVER {
            return;
        }

        guard.timer_seq += 1;
        let timer = guard.timer_seq;
        let sleep = self.inner.clock.sleep(gc_time);
        let weak = Arc::downgrade(&self.inner);
        if let Some(handle) = spawn_timer(async move {
            sleep.await;
            if let Some(inner) = weak.upgrade() {
                QueryRecord { inner }.fire_eviction(timer);
            }
        }) {
            guard.eviction = Some((timer, handle));
        }
    }

    fn fire_eviction(&self, timer: u64) {
        {
            let mut guard = self.inner.state.lock();
            match guard.eviction {
                Some((current, _)) if current == timer => guard.eviction = None,
                _ => return,
            }
            if self.is_active() {
                return;
            }
            if guard.state.fetch_status == FetchStatus::Fetching {
                trace!(key = %self.inner.hash, "fetch in flight, postponing eviction");
                self.schedule_eviction(&mut guard);
                return;
            }
        }

        debug!(key = %self.inner.hash, "evicting inactive query");
        match self.observer() {
            Some(observer) => observer.evicted(self),
            None => self.destroy(),
        }
    }

    fn restart_interval(&self, guard: &mut RecordState<T>) {
        if let Some(handle) = guard.interval.take() {
            handle.abort();
        }
        let Some(every) = guard.options.active_interval() else {
            return;
        };

        let clock = Arc::clone(&self.inner.clock);
        let weak = Arc::downgrade(&self.inner);
        guard.interval = spawn_timer(async move {
            loop {
                clock.sleep(every).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let record = QueryRecord { inner };
                if record.is_active() {
                    trace!(key = %record.inner.hash, "interval refetch");
                    drop(record.fetch());
                }
            }
        });
    }

    fn observer(&self) -> Option<Arc<dyn RecordObserver<T>>> {
        self.inner.observer.as_ref().and_then(Weak::upgrade)
    }

    fn notify(&self, change: RecordChange) {
        let state = self.state();
        if let Some(observer) = self.observer() {
            observer.state_changed(self, &state, change);
        }
        self.inner.listeners.notify(&state);
    }
}

fn initial_state<T: Clone>(options: &ResolvedOptions<T>, now: u64) -> QueryState<T> {
    match &options.initial_data {
        Some(data) => QueryState::seeded(
            data.clone(),
            options.initial_data_updated_at.unwrap_or(now),
        ),
        None => QueryState::idle(),
    }
}

pub(crate) fn is_stale_at<T>(state: &QueryState<T>, stale_time: Duration, now: u64) -> bool {
    if state.is_invalidated || state.status != QueryStatus::Success {
        return true;
    }
    if stale_time == NEVER {
        return false;
    }
    if stale_time.is_zero() {
        return true;
    }
    now.saturating_sub(state.data_updated_at) > as_millis(stale_time)
}

fn abandon_fetch<T>(guard: &mut RecordState<T>) {
    if let Some(signal) = guard.signal.take() {
        signal.cancel();
    }
    guard.in_flight = None;
    guard.fetch_seq += 1;
}

fn cancel_eviction<T>(guard: &mut RecordState<T>) {
    if let Some((_, handle)) = guard.eviction.take() {
        handle.abort();
    }
}

async fn invoke<T>(loader: &Loader<T>, ctx: QueryContext) -> Result<T, QueryError> {
    let attempt = match catch_unwind(AssertUnwindSafe(|| loader(ctx))) {
        Ok(attempt) => attempt,
        Err(_) => return Err(QueryError::loader("loader panicked")),
    };
    match AssertUnwindSafe(attempt).catch_unwind().await {
        Ok(result) => result.map_err(QueryError::loader),
        Err(_) => Err(QueryError::loader("loader panicked")),
    }
}

fn run_callback<F: FnOnce()>(name: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(callback = name, "query callback panicked; ignoring");
    }
}
