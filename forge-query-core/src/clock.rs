//! Time source and timer capability.
//!
//! Every timestamp and every delay in the cache goes through a [`Clock`], so tests
//! can drive retry backoff, garbage collection and refetch intervals without
//! waiting on the wall clock.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Sentinel for "never": a stale time that never elapses or a disabled GC.
pub const NEVER: Duration = Duration::MAX;

/// Source of timestamps (milliseconds since the Unix epoch) and delays.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds.
    fn now(&self) -> u64;

    /// Completes once `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by `tokio::time`.
///
/// Timestamps are anchored to the wall clock at construction and then advance with
/// `tokio::time::Instant`, so a paused tokio runtime (`start_paused`) controls both
/// sleeping and `now()`.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_ms: u64,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(as_millis)
            .unwrap_or(0);
        Self {
            origin_ms,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> u64 {
        self.origin_ms
            .saturating_add(as_millis(self.origin.elapsed()))
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if duration == NEVER {
            return futures_util::future::pending().boxed();
        }
        // created on first poll, so the future may be built outside a runtime
        async move { tokio::time::sleep(duration).await }.boxed()
    }
}

/// Fully simulated clock.
///
/// Time only moves through [`ManualClock::advance`] or [`ManualClock::set`];
/// pending sleepers wake as soon as their deadline has been reached.
///
/// ```
/// use forge_query_core::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.now(), 1_250);
/// ```
pub struct ManualClock {
    now: AtomicU64,
    ticks: watch::Sender<u64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        let (ticks, _) = watch::channel(start_ms);
        Self {
            now: AtomicU64::new(start_ms),
            ticks,
        }
    }

    /// Moves time forward and wakes every sleeper whose deadline passed.
    pub fn advance(&self, by: Duration) {
        let now = self
            .now
            .fetch_add(as_millis(by), Ordering::SeqCst)
            .saturating_add(as_millis(by));
        self.ticks.send_replace(now);
    }

    /// Jumps to an absolute timestamp.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
        self.ticks.send_replace(now_ms);
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &self.now.load(Ordering::SeqCst))
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if duration == NEVER {
            return futures_util::future::pending().boxed();
        }
        let deadline = self.now().saturating_add(as_millis(duration));
        let mut ticks = self.ticks.subscribe();
        async move {
            // the sender lives as long as the clock; a dropped clock releases sleepers
            let _ = ticks.wait_for(|now| *now >= deadline).await;
        }
        .boxed()
    }
}

/// Saturating conversion of a duration to whole milliseconds.
pub fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Spawns a timer task on the ambient tokio runtime.
///
/// Returns `None` (and logs) when called outside a runtime; timers are an
/// optimisation of memory use, never a requirement for correctness.
pub fn spawn_timer<F>(task: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(task)),
        Err(_) => {
            warn!("no tokio runtime available, timer not scheduled");
            None
        }
    }
}
