//! Integration tests for the query record lifecycle

use forge_query_async::{loader, Loader, QueryContext, QueryDefaults, QueryOptions, QueryRecord};
use forge_query_core::{
    Clock, ManualClock, QueryError, QueryStatus, RetryDelay, RetryPolicy, TokioClock, NEVER,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn tokio_clock() -> Arc<dyn Clock> {
    Arc::new(TokioClock::new())
}

fn counting(calls: &Arc<AtomicUsize>, value: u32, latency: Duration) -> Loader<u32> {
    let calls = Arc::clone(calls);
    loader(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(latency).await;
            Ok::<_, io::Error>(value)
        }
    })
}

fn failing(calls: &Arc<AtomicUsize>) -> Loader<u32> {
    let calls = Arc::clone(calls);
    loader(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err::<u32, _>(io::Error::new(io::ErrorKind::Other, "boom")) }
    })
}

fn record(options: QueryOptions<u32>) -> QueryRecord<u32> {
    QueryRecord::new(options, &QueryDefaults::default(), tokio_clock())
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_invocation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let record = record(
        QueryOptions::new("shared").with_loader(counting(&calls, 7, Duration::from_millis(20))),
    );

    let results = join_all((0..10).map(|_| record.fetch())).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap(), 7);
    }
    let state = record.state();
    assert!(state.is_success());
    assert!(!state.is_fetching());
    assert_eq!(state.data, Some(7));
}

#[tokio::test]
async fn test_sequential_fetches_invoke_loader_again() {
    let calls = Arc::new(AtomicUsize::new(0));
    let record = record(QueryOptions::new("again").with_loader(counting(&calls, 1, Duration::ZERO)));

    record.fetch().await.unwrap();
    record.fetch().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_count_bounds_invocations() {
    let calls = Arc::new(AtomicUsize::new(0));
    let record = record(
        QueryOptions::new("flaky")
            .with_loader(failing(&calls))
            .with_retry(2u32)
            .with_retry_delay(Duration::from_millis(1)),
    );

    let result = record.fetch().await;

    assert!(matches!(result, Err(QueryError::Loader(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let state = record.state();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.failure_count, 3);
    assert!(state.error.is_some());
}

#[tokio::test]
async fn test_retry_disabled_invokes_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let record = record(
        QueryOptions::new("once")
            .with_loader(failing(&calls))
            .with_retry(false),
    );

    assert!(record.fetch().await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_success_after_retries_clears_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let record = record(
        QueryOptions::new("eventually")
            .with_loader(loader(move |_| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(io::Error::new(io::ErrorKind::Other, "not yet"))
                    } else {
                        Ok(99)
                    }
                }
            }))
            .with_retry(3u32)
            .with_retry_delay(RetryDelay::Fixed(Duration::ZERO)),
    );

    assert_eq!(record.fetch().await.unwrap(), 99);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let state = record.state();
    assert_eq!(state.failure_count, 0);
    assert!(state.error.is_none());
    assert!(state.failure_reason.is_none());
}

#[tokio::test]
async fn test_retry_predicate_sees_failure_count() {
    let calls = Arc::new(AtomicUsize::new(0));
    let record = record(
        QueryOptions::new("predicate")
            .with_loader(failing(&calls))
            .with_retry(RetryPolicy::predicate(|failures, _| failures < 4))
            .with_retry_delay(Duration::ZERO),
    );

    assert!(record.fetch().await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

fn failing_at(times: &Arc<Mutex<Vec<Instant>>>) -> Loader<u32> {
    let times = Arc::clone(times);
    loader(move |_| {
        times.lock().push(Instant::now());
        async { Err::<u32, _>(io::Error::new(io::ErrorKind::Other, "boom")) }
    })
}

#[tokio::test(start_paused = true)]
async fn test_fixed_delay_waits_before_retrying() {
    let calls = Arc::new(AtomicUsize::new(0));
    let record = record(
        QueryOptions::new("fixed")
            .with_loader(failing(&calls))
            .with_retry(1u32)
            .with_retry_delay(Duration::from_millis(500)),
    );

    let fetch = record.fetch();
    tokio::time::sleep(Duration::from_millis(499)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(fetch.await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_default_backoff_doubles_then_caps() {
    let times = Arc::new(Mutex::new(Vec::new()));
    let record = record(
        QueryOptions::new("backoff")
            .with_loader(failing_at(&times))
            .with_retry(4u32),
    );

    let fetch = record.fetch();
    tokio::time::sleep(Duration::from_millis(1_999)).await;
    assert_eq!(times.lock().len(), 1);

    assert!(fetch.await.is_err());
    let times = times.lock();
    assert_eq!(times.len(), 5);
    let gaps: Vec<u128> = times
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_millis())
        .collect();
    // base 1s: 2s, 4s, 8s plus up to 1s of jitter, then the 10s cap
    assert!((2_000..=3_000).contains(&gaps[0]), "{gaps:?}");
    assert!((4_000..=5_000).contains(&gaps[1]), "{gaps:?}");
    assert!((8_000..=9_000).contains(&gaps[2]), "{gaps:?}");
    assert!((10_000..=10_001).contains(&gaps[3]), "{gaps:?}");
}

#[tokio::test(start_paused = true)]
async fn test_reset_during_backoff_cancels_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let record = record(QueryOptions::new("backing-off").with_loader(failing(&calls)));

    let fetch = record.fetch();
    // the first retry waits at least two seconds
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(record.state().is_fetching());

    record.reset();

    assert!(matches!(fetch.await, Err(QueryError::Cancelled)));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let state = record.state();
    assert_eq!(state.status, QueryStatus::Idle);
    assert_eq!(state.failure_count, 0);
}

#[tokio::test]
async fn test_failed_refetch_keeps_previous_data() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let record = record(
        QueryOptions::new("keeps-data")
            .with_loader(loader(move |_| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Ok(5)
                    } else {
                        Err(io::Error::new(io::ErrorKind::Other, "down"))
                    }
                }
            }))
            .with_retry(false),
    );

    assert_eq!(record.fetch().await.unwrap(), 5);
    assert!(record.fetch().await.is_err());

    let state = record.state();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.data, Some(5));
    assert!(state.error.is_some());
}

#[tokio::test]
async fn test_fetch_without_loader_fails() {
    let record = record(QueryOptions::new("bare"));

    let result = record.fetch().await;

    assert!(matches!(result, Err(QueryError::NoLoader(_))));
    assert!(record.state().is_error());
    assert!(!record.state().is_fetching());
}

#[tokio::test]
async fn test_panicking_loader_becomes_error() {
    let record = record(
        QueryOptions::new("panics")
            .with_loader(loader(|_: QueryContext| async {
                if true {
                    panic!("loader exploded");
                }
                Ok::<u32, io::Error>(0)
            }))
            .with_retry(false),
    );

    let result = record.fetch().await;

    assert!(matches!(result, Err(QueryError::Loader(_))));
    assert!(record.state().is_error());
}

#[tokio::test]
async fn test_reset_abandons_in_flight_fetch() {
    let record = record(QueryOptions::new("slow").with_loader(loader(
        |ctx: QueryContext| async move {
            ctx.signal.cancelled().await;
            Err::<u32, _>(io::Error::new(io::ErrorKind::Interrupted, "aborted"))
        },
    )));

    let fetch = record.fetch();
    assert!(record.state().is_loading());
    tokio::task::yield_now().await;

    record.reset();

    assert!(matches!(fetch.await, Err(QueryError::Cancelled)));
    let state = record.state();
    assert_eq!(state.status, QueryStatus::Idle);
    assert!(!state.is_fetching());
    assert!(state.error.is_none());
}

#[tokio::test]
async fn test_reset_restores_initial_data() {
    let record = record(QueryOptions::new("seeded").with_initial_data(3));
    record.set_data(10);
    assert_eq!(record.data(), Some(10));

    record.reset();

    assert_eq!(record.data(), Some(3));
    assert!(record.state().is_success());
}

#[tokio::test]
async fn test_staleness_follows_clock() {
    let clock = Arc::new(ManualClock::new(1_000));
    let record = QueryRecord::new(
        QueryOptions::new("timed")
            .with_loader(loader(|_| async { Ok::<u32, io::Error>(1) }))
            .with_stale_time(Duration::from_millis(500)),
        &QueryDefaults::default(),
        clock.clone(),
    );

    assert!(record.is_stale());
    record.fetch().await.unwrap();
    assert!(!record.is_stale());

    clock.advance(Duration::from_millis(500));
    assert!(!record.is_stale());
    clock.advance(Duration::from_millis(1));
    assert!(record.is_stale());
}

#[tokio::test]
async fn test_zero_stale_time_is_stale_immediately() {
    let record = record(
        QueryOptions::new("zero")
            .with_loader(loader(|_| async { Ok::<u32, io::Error>(1) }))
            .with_stale_time(Duration::ZERO),
    );

    record.fetch().await.unwrap();

    assert!(record.is_stale());
}

#[tokio::test]
async fn test_invalidate_overrides_never_stale() {
    let record = record(
        QueryOptions::new("pinned")
            .with_loader(loader(|_| async { Ok::<u32, io::Error>(1) }))
            .with_stale_time(NEVER),
    );

    record.fetch().await.unwrap();
    assert!(!record.is_stale());

    record.invalidate();
    assert!(record.is_stale());

    record.fetch().await.unwrap();
    assert!(!record.is_stale());
    assert!(!record.state().is_invalidated);
}

#[tokio::test]
async fn test_update_data_sees_previous_value() {
    let record = record(QueryOptions::new("counter"));

    record.update_data(|previous| previous.copied().unwrap_or(0) + 1);
    record.update_data(|previous| previous.copied().unwrap_or(0) + 1);

    assert_eq!(record.data(), Some(2));
    assert!(record.state().is_success());
}

#[tokio::test]
async fn test_subscribers_receive_state_changes() {
    let record = record(
        QueryOptions::new("watched").with_loader(loader(|_| async { Ok::<u32, io::Error>(4) })),
    );
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = record.subscribe(move |state| sink.lock().push(state.fetch_status));

    assert!(record.is_active());
    assert_eq!(record.observer_count(), 1);
    record.fetch().await.unwrap();

    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0] == forge_query_core::FetchStatus::Fetching);
        assert!(seen[1] == forge_query_core::FetchStatus::Idle);
    }

    subscription.unsubscribe();
    assert!(!record.is_active());
    record.set_data(1);
    assert_eq!(seen.lock().len(), 2);
}

#[tokio::test]
async fn test_panicking_subscriber_does_not_block_others() {
    let record = record(QueryOptions::new("noisy"));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let _bad = record.subscribe(|_| panic!("listener exploded"));
    let _good = record.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    record.set_data(1);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_callbacks_run_once_per_settle() {
    let successes = Arc::new(AtomicUsize::new(0));
    let settled = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&successes);
    let t = Arc::clone(&settled);

    let record = record(
        QueryOptions::new("callbacks")
            .with_loader(loader(|_| async { Ok::<u32, io::Error>(8) }))
            .on_success(move |data: &u32| {
                assert_eq!(*data, 8);
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_settled(move |data: Option<&u32>, error: Option<&QueryError>| {
                assert!(data.is_some() && error.is_none());
                t.fetch_add(1, Ordering::SeqCst);
            }),
    );

    let _ = join_all((0..3).map(|_| record.fetch())).await;

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(settled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_error_callback_and_panicking_callback() {
    let errors = Arc::new(AtomicUsize::new(0));
    let e = Arc::clone(&errors);
    let calls = Arc::new(AtomicUsize::new(0));

    let record = record(
        QueryOptions::new("error-callback")
            .with_loader(failing(&calls))
            .with_retry(false)
            .on_error(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            })
            .on_settled(|_, _| panic!("settled callback exploded")),
    );

    assert!(record.fetch().await.is_err());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(record.state().is_error());
}

#[tokio::test]
async fn test_set_options_attaches_loader() {
    let record = record(QueryOptions::new("late"));
    assert!(!record.has_loader());

    record.set_options(
        QueryOptions::new("late").with_loader(loader(|_| async { Ok::<u32, io::Error>(2) })),
    );

    assert!(record.has_loader());
    assert_eq!(record.fetch().await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribing_last_observer_schedules_eviction() {
    let record = record(QueryOptions::new("gc").with_gc_time(Duration::from_millis(100)));
    assert!(record.has_pending_eviction());

    let subscription = record.subscribe(|_| {});
    assert!(!record.has_pending_eviction());

    subscription.unsubscribe();
    assert!(record.has_pending_eviction());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!record.has_pending_eviction());
}

#[tokio::test(start_paused = true)]
async fn test_eviction_waits_for_in_flight_fetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let record = record(
        QueryOptions::new("busy")
            .with_gc_time(Duration::from_millis(100))
            .with_loader(counting(&calls, 6, Duration::from_millis(250))),
    );

    let fetch = record.fetch();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(record.state().is_fetching());
    assert!(record.has_pending_eviction());

    assert_eq!(fetch.await.unwrap(), 6);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!record.has_pending_eviction());
    assert_eq!(record.data(), Some(6));
}

#[tokio::test(start_paused = true)]
async fn test_refetch_interval_runs_while_observed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let record = record(
        QueryOptions::new("polled")
            .with_loader(counting(&calls, 1, Duration::ZERO))
            .with_refetch_interval(Duration::from_millis(50)),
    );

    let subscription = record.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(175)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    subscription.unsubscribe();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
