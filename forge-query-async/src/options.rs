//! Query options, client-wide defaults and the loader contract.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use forge_query_core::store::DEFAULT_GC_TIME;
use forge_query_core::{BoxError, QueryError, QueryKey, RetryDelay, RetryPolicy};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// What a loader receives for one attempt.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub key: QueryKey,
    /// Cancelled when the fetch is superseded, reset or destroyed.
    pub signal: CancellationToken,
    pub meta: Option<Value>,
}

/// Asynchronous data source of a query.
pub type Loader<T> =
    Arc<dyn Fn(QueryContext) -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&QueryError) + Send + Sync>;
pub type SettledCallback<T> = Arc<dyn Fn(Option<&T>, Option<&QueryError>) + Send + Sync>;

/// Wraps an async closure as a [`Loader`].
///
/// ```
/// use forge_query_async::{loader, Loader};
///
/// let load: Loader<u32> = loader(|ctx| async move {
///     if ctx.signal.is_cancelled() {
///         return Err("cancelled");
///     }
///     Ok(42)
/// });
/// # let _ = load;
/// ```
pub fn loader<T, F, Fut, E>(f: F) -> Loader<T>
where
    F: Fn(QueryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
    T: 'static,
{
    Arc::new(move |ctx| f(ctx).map(|result| result.map_err(Into::<BoxError>::into)).boxed())
}

/// Client-wide defaults applied beneath every query's own options.
#[derive(Debug, Clone)]
pub struct QueryDefaults {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub refetch_interval: Option<Duration>,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            gc_time: DEFAULT_GC_TIME,
            retry: RetryPolicy::default(),
            retry_delay: RetryDelay::default(),
            refetch_interval: None,
            refetch_on_focus: true,
            refetch_on_reconnect: true,
        }
    }
}

impl QueryDefaults {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = retry_delay.into();
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = enabled;
        self
    }

    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = enabled;
        self
    }
}

/// Options of one query. Unset fields fall back to [`QueryDefaults`].
///
/// ```
/// use forge_query_async::{loader, QueryOptions};
/// use forge_query_core::query_key;
/// use std::time::Duration;
///
/// let options = QueryOptions::new(query_key!["todos", 1])
///     .with_loader(loader(|_| async { Ok::<_, std::io::Error>(vec![1, 2, 3]) }))
///     .with_stale_time(Duration::from_secs(30))
///     .with_retry(2u32);
/// assert!(options.loader.is_some());
/// ```
pub struct QueryOptions<T> {
    pub key: QueryKey,
    pub loader: Option<Loader<T>>,
    pub stale_time: Option<Duration>,
    pub gc_time: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub refetch_interval: Option<Duration>,
    pub refetch_on_focus: Option<bool>,
    pub refetch_on_reconnect: Option<bool>,
    pub initial_data: Option<T>,
    /// Defaults to the creation time when `initial_data` is set.
    pub initial_data_updated_at: Option<u64>,
    pub meta: Option<Value>,
    pub on_success: Option<SuccessCallback<T>>,
    pub on_error: Option<ErrorCallback>,
    pub on_settled: Option<SettledCallback<T>>,
}

impl<T> QueryOptions<T> {
    pub fn new(key: impl Into<QueryKey>) -> Self {
        Self {
            key: key.into(),
            loader: None,
            stale_time: None,
            gc_time: None,
            retry: None,
            retry_delay: None,
            refetch_interval: None,
            refetch_on_focus: None,
            refetch_on_reconnect: None,
            initial_data: None,
            initial_data_updated_at: None,
            meta: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    pub fn with_loader(mut self, loader: Loader<T>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(retry_delay.into());
        self
    }

    /// A zero interval disables periodic refetching.
    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = Some(enabled);
        self
    }

    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = Some(enabled);
        self
    }

    pub fn with_initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn with_initial_data_updated_at(mut self, at: u64) -> Self {
        self.initial_data_updated_at = Some(at);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&T>, Option<&QueryError>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Merges these options over `defaults`.
    pub(crate) fn resolve(self, defaults: &QueryDefaults) -> ResolvedOptions<T> {
        ResolvedOptions {
            loader: self.loader,
            stale_time: self.stale_time.unwrap_or(defaults.stale_time),
            gc_time: self.gc_time.unwrap_or(defaults.gc_time),
            retry: self.retry.unwrap_or_else(|| defaults.retry.clone()),
            retry_delay: self
                .retry_delay
                .unwrap_or_else(|| defaults.retry_delay.clone()),
            refetch_interval: self.refetch_interval.or(defaults.refetch_interval),
            refetch_on_focus: self.refetch_on_focus.unwrap_or(defaults.refetch_on_focus),
            refetch_on_reconnect: self
                .refetch_on_reconnect
                .unwrap_or(defaults.refetch_on_reconnect),
            initial_data: self.initial_data,
            initial_data_updated_at: self.initial_data_updated_at,
            meta: self.meta,
            on_success: self.on_success,
            on_error: self.on_error,
            on_settled: self.on_settled,
        }
    }
}

impl<T: Clone> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            loader: self.loader.clone(),
            stale_time: self.stale_time,
            gc_time: self.gc_time,
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            refetch_interval: self.refetch_interval,
            refetch_on_focus: self.refetch_on_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            initial_data: self.initial_data.clone(),
            initial_data_updated_at: self.initial_data_updated_at,
            meta: self.meta.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("loader", &self.loader.is_some())
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("refetch_interval", &self.refetch_interval)
            .field("initial_data", &self.initial_data.is_some())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Options of a live record, every default already applied.
pub(crate) struct ResolvedOptions<T> {
    pub(crate) loader: Option<Loader<T>>,
    pub(crate) stale_time: Duration,
    pub(crate) gc_time: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) retry_delay: RetryDelay,
    pub(crate) refetch_interval: Option<Duration>,
    pub(crate) refetch_on_focus: bool,
    pub(crate) refetch_on_reconnect: bool,
    pub(crate) initial_data: Option<T>,
    pub(crate) initial_data_updated_at: Option<u64>,
    pub(crate) meta: Option<Value>,
    pub(crate) on_success: Option<SuccessCallback<T>>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_settled: Option<SettledCallback<T>>,
}

impl<T> ResolvedOptions<T> {
    /// Overlays every field set in `overlay`; the key is ignored.
    pub(crate) fn apply(&mut self, overlay: QueryOptions<T>) {
        if overlay.loader.is_some() {
            self.loader = overlay.loader;
        }
        if let Some(stale_time) = overlay.stale_time {
            self.stale_time = stale_time;
        }
        if let Some(gc_time) = overlay.gc_time {
            self.gc_time = gc_time;
        }
        if let Some(retry) = overlay.retry {
            self.retry = retry;
        }
        if let Some(retry_delay) = overlay.retry_delay {
            self.retry_delay = retry_delay;
        }
        if overlay.refetch_interval.is_some() {
            self.refetch_interval = overlay.refetch_interval;
        }
        if let Some(enabled) = overlay.refetch_on_focus {
            self.refetch_on_focus = enabled;
        }
        if let Some(enabled) = overlay.refetch_on_reconnect {
            self.refetch_on_reconnect = enabled;
        }
        if overlay.initial_data.is_some() {
            self.initial_data = overlay.initial_data;
        }
        if overlay.initial_data_updated_at.is_some() {
            self.initial_data_updated_at = overlay.initial_data_updated_at;
        }
        if overlay.meta.is_some() {
            self.meta = overlay.meta;
        }
        if overlay.on_success.is_some() {
            self.on_success = overlay.on_success;
        }
        if overlay.on_error.is_some() {
            self.on_error = overlay.on_error;
        }
        if overlay.on_settled.is_some() {
            self.on_settled = overlay.on_settled;
        }
    }

    /// Positive refetch interval, if any.
    pub(crate) fn active_interval(&self) -> Option<Duration> {
        self.refetch_interval.filter(|d| !d.is_zero())
    }
}
