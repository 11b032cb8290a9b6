// ============================================================================
// spark-query - Query Controller Lifecycle Tests
// ============================================================================

use std::cell::Cell;
use std::rc::Rc;

use spark_query::{
    query_key, ClientConfig, Enabled, FetchError, FetchMode, FetchStatus, ObservableCell, Query,
    QueryClient, QueryConfig, QueryError, QueryOptions, QueryStatus, ThrowOnError,
};

#[test]
fn settled_query_exposes_data_and_status() {
    let client = QueryClient::new();
    let query = Query::new(QueryConfig::new(client, query_key!["test"], |_key| {
        Ok::<_, FetchError>(vec![1, 2, 3])
    }));

    let snap = query.peek();
    assert_eq!(snap.data, Some(vec![1, 2, 3]));
    assert_eq!(snap.status, QueryStatus::Success);
    assert!(snap.is_fetched());
    assert_eq!(snap.fetch_status, FetchStatus::Idle);
}

#[test]
fn on_demand_defers_fetch_until_first_read() {
    let calls = Rc::new(Cell::new(0));
    let client = QueryClient::new();

    let c = calls.clone();
    let query = Query::new(
        QueryConfig::new(client, query_key!["deferred"], move |_key| {
            c.set(c.get() + 1);
            Ok::<_, FetchError>(1)
        })
        .on_demand(),
    );

    // Construction alone must not fetch.
    assert_eq!(calls.get(), 0);
    assert!(query.peek().is_pending());
    assert_eq!(calls.get(), 0);

    // First read ungates; exactly one fetch.
    let _ = query.result();
    assert_eq!(calls.get(), 1);

    let _ = query.result();
    assert_eq!(calls.get(), 1);
    assert_eq!(query.peek().data, Some(1));
}

#[test]
fn destroy_runs_teardown_exactly_once() {
    let client = QueryClient::new();
    let key = query_key!["once"];
    let teardowns = Rc::new(Cell::new(0));

    let t = teardowns.clone();
    let query = Query::new(
        QueryConfig::new(client.clone(), key.clone(), |_key| Ok::<_, FetchError>(5))
            .reset_on_destroy()
            .on_destroy(move || t.set(t.get() + 1)),
    );
    assert_eq!(client.get_query_data::<i32>(&key), Some(5));

    query.destroy();
    query.destroy();
    assert!(query.is_destroyed());
    assert_eq!(teardowns.get(), 1);

    // The reset side effect ran (once): entry is back to never-fetched.
    assert_eq!(client.get_query_data::<i32>(&key), None);
}

#[test]
fn destroy_then_parent_abort_tears_down_once() {
    let client = QueryClient::new();
    let parent = spark_query::CancellationScope::new();
    let teardowns = Rc::new(Cell::new(0));

    let t = teardowns.clone();
    let query = Query::new(
        QueryConfig::new(client, query_key!["linked"], |_key| Ok::<_, FetchError>(1))
            .parent_signal(parent.signal())
            .on_destroy(move || t.set(t.get() + 1)),
    );

    query.destroy();
    parent.abort(spark_query::AbortReason::Destroyed);
    assert_eq!(teardowns.get(), 1);
}

#[test]
fn parent_abort_destroys_child_controller() {
    let client = QueryClient::new();
    let parent = spark_query::CancellationScope::new();

    let query = Query::new(
        QueryConfig::new(client, query_key!["child"], |_key| Ok::<_, FetchError>(1))
            .parent_signal(parent.signal()),
    );
    assert!(!query.is_destroyed());

    parent.abort(spark_query::AbortReason::Destroyed);
    assert!(query.is_destroyed());
}

#[test]
fn on_done_fires_once_per_settle() {
    let client = QueryClient::new();
    let query = Query::new(QueryConfig::new(client, query_key!["done"], |_key| {
        Ok::<_, FetchError>(7)
    }));

    let hits = Rc::new(Cell::new(0));
    let h = hits.clone();
    query.on_done(move |_| h.set(h.get() + 1));

    // Never fired at registration, even with settled data present.
    assert_eq!(hits.get(), 0);

    // A refetch pushes a fetching snapshot carrying the old data stamp and
    // then the success snapshot with the new one: one done event.
    let settled = query.refetch(None);
    assert!(settled.is_ok());
    assert_eq!(hits.get(), 1);

    let _ = query.refetch(None);
    assert_eq!(hits.get(), 2);
}

#[test]
fn refetch_accepts_a_throw_override() {
    let client = QueryClient::new();
    let fail = Rc::new(Cell::new(false));

    let f = fail.clone();
    let query = Query::new(QueryConfig::new(
        client,
        query_key!["throwing"],
        move |_key| {
            if f.get() {
                Err(FetchError::new("boom"))
            } else {
                Ok(1)
            }
        },
    ));

    fail.set(true);
    // The default policy keeps the error in the snapshot.
    let settled = query.refetch(None).unwrap();
    assert_eq!(settled.error, Some(FetchError::new("boom")));

    // A per-call override surfaces it instead.
    let thrown = query.refetch(Some(ThrowOnError::Fixed(true)));
    assert!(matches!(thrown, Err(QueryError::Fetch(ref e)) if e.message == "boom"));
}

#[test]
fn key_swap_does_not_replay_prior_settles() {
    let client = QueryClient::new();

    // Seed the "left" entry with a success and a later failure, so it
    // carries both settle stamps before anyone else attaches.
    let fail = Rc::new(Cell::new(false));
    let f = fail.clone();
    let seeder = Query::new(QueryConfig::new(
        client.clone(),
        query_key!["left"],
        move |_key| {
            if f.get() {
                Err(FetchError::new("old"))
            } else {
                Ok(1)
            }
        },
    ));
    fail.set(true);
    let _ = seeder.refetch(None);
    assert!(seeder.peek().error.is_some());

    // A second controller swaps onto the seeded entry via its dynamic key.
    let sel = ObservableCell::new(false);
    let s = sel.clone();
    let query = Query::new(
        QueryConfig::new(client, query_key!["right"], |_key| Ok::<_, FetchError>(2))
            .dynamic_key(move || {
                if s.get() {
                    query_key!["left"]
                } else {
                    query_key!["right"]
                }
            }),
    );

    let done_hits = Rc::new(Cell::new(0));
    let error_hits = Rc::new(Cell::new(0));
    let d = done_hits.clone();
    query.on_done(move |_| d.set(d.get() + 1));
    let e = error_hits.clone();
    query.on_error(move |_| e.set(e.get() + 1));

    // Attaching to the swapped entry must not fire the settles it already
    // carried, neither at the swap push nor on any later push.
    sel.set(true);
    assert_eq!((done_hits.get(), error_hits.get()), (0, 0));

    // A settle that happens after the swap still fires.
    query.refetch(None).unwrap();
    assert_eq!((done_hits.get(), error_hits.get()), (1, 0));
}

#[test]
fn callbacks_can_update_options_reentrantly() {
    let client = QueryClient::new();
    let query = Query::new(QueryConfig::new(client, query_key!["reentrant"], |_key| {
        Ok::<_, FetchError>(1)
    }));

    let fired = Rc::new(Cell::new(0));
    let fr = fired.clone();
    let q = query.clone();
    query.on_done(move |_| {
        fr.set(fr.get() + 1);
        let mut patch = QueryOptions::default();
        patch.enabled = Some(Enabled::Fixed(false));
        q.update(patch);
    });

    query.refetch(None).unwrap();
    assert_eq!(fired.get(), 1);

    // The patch issued from inside the callback landed: the query is
    // disabled now, so invalidation no longer refetches.
    let before = query.peek().data_stamp;
    query.invalidate();
    assert_eq!(query.peek().data_stamp, before);

    query.destroy();
}

#[test]
fn aborted_controller_never_observes_competitors() {
    let client = QueryClient::with_config(ClientConfig {
        fetch_mode: FetchMode::Manual,
        ..Default::default()
    });

    let first = Query::new(QueryConfig::new(
        client.clone(),
        query_key!["test"],
        |_key| Ok::<_, FetchError>("first"),
    ));
    assert_eq!(first.peek().fetch_status, FetchStatus::Fetching);

    // Abort mid-flight, before the queued job runs.
    first.destroy();

    let second = Query::new(QueryConfig::new(
        client.clone(),
        query_key!["test"],
        |_key| Ok::<_, FetchError>("second"),
    ));
    client.flush();

    assert_eq!(second.peek().data, Some("second"));
    assert_eq!(second.peek().status, QueryStatus::Success);

    // The first controller's snapshot froze at its last pre-abort state.
    assert_eq!(first.peek().fetch_status, FetchStatus::Fetching);
    assert!(first.peek().data.is_none());
}

#[test]
fn gated_dynamic_enabled_fetches_once_on_flip() {
    let client = QueryClient::new();
    let flag = ObservableCell::new(false);
    let calls = Rc::new(Cell::new(0));

    let c = calls.clone();
    let f = flag.clone();
    let query = Query::new(
        QueryConfig::new(client, query_key!["gated"], move |_key| {
            c.set(c.get() + 1);
            Ok::<_, FetchError>(1)
        })
        .on_demand()
        .dynamic_options(move || {
            let mut options = QueryOptions::default();
            options.enabled = Some(Enabled::Fixed(f.get()));
            options
        }),
    );

    // First read ungates but the effective condition is still false.
    assert!(query.result().data.is_none());
    assert_eq!(calls.get(), 0);

    // Flipping the backing source triggers exactly one fetch.
    flag.set(true);
    assert_eq!(calls.get(), 1);
    assert_eq!(query.peek().data, Some(1));
}

#[test]
fn identical_queries_share_the_cache_entry() {
    let client = QueryClient::new();
    let calls = Rc::new(Cell::new(0));

    let c = calls.clone();
    let first = Query::new(QueryConfig::new(
        client.clone(),
        query_key!["shared"],
        move |_key| {
            c.set(c.get() + 1);
            Ok::<_, FetchError>(42)
        },
    ));
    assert_eq!(calls.get(), 1);

    // Same key: the second controller mounts onto fresh data and skips the
    // fetch entirely.
    let second = Query::new(QueryConfig::new(
        client,
        query_key!["shared"],
        |_key| Ok::<_, FetchError>(0),
    ));
    assert_eq!(second.peek().data, Some(42));
    assert_eq!(calls.get(), 1);

    drop(first);
}

#[test]
fn invalidate_refetches_subscribed_query() {
    let client = QueryClient::new();
    let calls = Rc::new(Cell::new(0));

    let c = calls.clone();
    let query = Query::new(QueryConfig::new(
        client,
        query_key!["stale"],
        move |_key| {
            c.set(c.get() + 1);
            Ok::<_, FetchError>(c.get())
        },
    ));
    assert_eq!(calls.get(), 1);

    query.invalidate();
    assert_eq!(calls.get(), 2);
    assert_eq!(query.peek().data, Some(2));
}

#[test]
fn set_data_bypasses_fetch() {
    let client = QueryClient::new();
    let query = Query::new(QueryConfig::new(client, query_key!["manual"], |_key| {
        Ok::<_, FetchError>(vec![1])
    }));

    query.set_data(|prev| {
        let mut v = prev.unwrap_or_default();
        v.push(2);
        v
    });
    assert_eq!(query.peek().data, Some(vec![1, 2]));
}

#[test]
fn update_patch_reconfigures_live_query() {
    let client = QueryClient::new();
    let query = Query::new(QueryConfig::new(client, query_key!["patched"], |_key| {
        Ok::<_, FetchError>(1)
    }));

    let mut patch = QueryOptions::default();
    patch.enabled = Some(Enabled::Fixed(false));
    query.update(patch);

    // Disabled now: invalidation no longer refetches.
    let before = query.peek().data_stamp;
    query.invalidate();
    assert_eq!(query.peek().data_stamp, before);
}
