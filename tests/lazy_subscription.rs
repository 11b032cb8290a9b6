// ============================================================================
// spark-query - Lazy Subscription Tests
// Observation-driven attach/detach with a debounced release window
// ============================================================================

use std::cell::Cell;
use std::rc::Rc;

use spark_query::{
    advance_clock, query_key, FetchError, Query, QueryClient, QueryConfig, Watcher,
};

#[test]
fn lazy_query_subscribes_on_first_observation() {
    let client = QueryClient::new();
    let key = query_key!["lazy"];
    let calls = Rc::new(Cell::new(0));

    let c = calls.clone();
    let query = Query::new(
        QueryConfig::new(client.clone(), key.clone(), move |_key| {
            c.set(c.get() + 1);
            Ok::<_, FetchError>(9)
        })
        .lazy(100),
    );

    // Dormant: no engine subscription, no fetch.
    assert_eq!(client.observer_count(&key), 0);
    assert_eq!(calls.get(), 0);

    // A reactive consumer attaches the subscription and mounts the fetch.
    let q = query.clone();
    let watch = Watcher::new(move || {
        let _ = q.result();
    });
    assert_eq!(client.observer_count(&key), 1);
    assert_eq!(calls.get(), 1);
    assert_eq!(query.peek().data, Some(9));

    drop(watch);
}

#[test]
fn lazy_query_detaches_after_the_debounce_window() {
    let client = QueryClient::new();
    let key = query_key!["lazy-end"];

    let query = Query::new(
        QueryConfig::new(client.clone(), key.clone(), |_key| Ok::<_, FetchError>(1)).lazy(100),
    );

    let q = query.clone();
    let watch = Watcher::new(move || {
        let _ = q.result();
    });
    assert_eq!(client.observer_count(&key), 1);

    drop(watch);
    // Still attached inside the window.
    assert_eq!(client.observer_count(&key), 1);

    advance_clock(100);
    assert_eq!(client.observer_count(&key), 0);
}

#[test]
fn reobservation_within_the_window_cancels_the_release() {
    let client = QueryClient::new();
    let key = query_key!["lazy-flap"];
    let calls = Rc::new(Cell::new(0));

    let c = calls.clone();
    let query = Query::new(
        QueryConfig::new(client.clone(), key.clone(), move |_key| {
            c.set(c.get() + 1);
            Ok::<_, FetchError>(1)
        })
        .lazy(100),
    );

    let q = query.clone();
    let first = Watcher::new(move || {
        let _ = q.result();
    });
    assert_eq!(calls.get(), 1);

    // Brief drop-and-reacquire inside the window.
    drop(first);
    advance_clock(50);
    let q = query.clone();
    let second = Watcher::new(move || {
        let _ = q.result();
    });

    // The scheduled release was cancelled and nothing re-mounted: still one
    // subscription, still one fetch.
    advance_clock(300);
    assert_eq!(client.observer_count(&key), 1);
    assert_eq!(calls.get(), 1);

    drop(second);
    advance_clock(100);
    assert_eq!(client.observer_count(&key), 0);
}

#[test]
fn destroy_while_dormant_skips_the_bridge_end() {
    let client = QueryClient::new();
    let key = query_key!["lazy-destroy"];

    let query = Query::new(
        QueryConfig::new(client.clone(), key.clone(), |_key| Ok::<_, FetchError>(1)).lazy(100),
    );
    query.destroy();

    assert!(query.is_destroyed());
    assert_eq!(client.observer_count(&key), 0);
}

#[test]
fn destroy_while_observed_detaches_immediately() {
    let client = QueryClient::new();
    let key = query_key!["lazy-live"];

    let query = Query::new(
        QueryConfig::new(client.clone(), key.clone(), |_key| Ok::<_, FetchError>(1)).lazy(100),
    );

    let q = query.clone();
    let _watch = Watcher::new(move || {
        let _ = q.result();
    });
    assert_eq!(client.observer_count(&key), 1);

    query.destroy();
    assert_eq!(client.observer_count(&key), 0);
}
