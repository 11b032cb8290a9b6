// ============================================================================
// spark-query - Infinite Query Controller Tests
// ============================================================================

use spark_query::{
    query_key, FetchError, InfiniteData, InfiniteQuery, InfiniteQueryConfig, ObservableCell,
    QueryClient,
};

fn page_query(client: QueryClient, name: &str) -> InfiniteQuery<String, i32> {
    InfiniteQuery::new(
        InfiniteQueryConfig::new(client, query_key![name], 1, |_key, param: &i32| {
            Ok::<_, FetchError>(format!("page-{param}"))
        })
        .next_param(|data: &InfiniteData<String, i32>| data.page_params.last().map(|p| p + 1))
        .previous_param(|data: &InfiniteData<String, i32>| data.page_params.first().map(|p| p - 1))
        .on_demand(),
    )
}

#[test]
fn sequential_next_pages_accumulate_in_order() {
    let client = QueryClient::new();
    let query = page_query(client, "pages");

    for _ in 0..3 {
        let settled = query.fetch_next_page();
        assert!(settled.is_ok());
    }

    let data = query.peek().data.unwrap();
    assert_eq!(data.page_params, vec![1, 2, 3]);
    assert_eq!(data.pages, vec!["page-1", "page-2", "page-3"]);
}

#[test]
fn previous_page_prepends() {
    let client = QueryClient::new();
    let query = page_query(client, "prev");

    query.fetch_next_page().unwrap();
    query.fetch_previous_page().unwrap();

    let data = query.peek().data.unwrap();
    assert_eq!(data.page_params, vec![0, 1]);
    assert_eq!(data.pages, vec!["page-0", "page-1"]);
}

#[test]
fn exhausted_next_param_settles_as_noop() {
    let client = QueryClient::new();
    let query: InfiniteQuery<i32, i32> = InfiniteQuery::new(
        InfiniteQueryConfig::new(client, query_key!["end"], 1, |_key, param: &i32| {
            Ok::<_, FetchError>(*param)
        })
        .next_param(|_: &InfiniteData<i32, i32>| None)
        .on_demand(),
    );

    query.fetch_next_page().unwrap();
    query.fetch_next_page().unwrap();

    let data = query.peek().data.unwrap();
    assert_eq!(data.pages, vec![1]);
}

#[test]
fn refetch_replays_every_page_param() {
    let client = QueryClient::new();
    let query = page_query(client, "replay");

    query.fetch_next_page().unwrap();
    query.fetch_next_page().unwrap();
    query.refetch(None).unwrap();

    let data = query.peek().data.unwrap();
    assert_eq!(data.page_params, vec![1, 2]);
    assert_eq!(data.pages, vec!["page-1", "page-2"]);
}

#[test]
fn start_fetches_the_initial_page_when_idle() {
    let client = QueryClient::new();
    let query = page_query(client, "started");

    // On-demand, nothing in flight: start issues the base fetch.
    let snap = query.start(None).unwrap();
    let data = snap.data.unwrap();
    assert_eq!(data.page_params, vec![1]);
    assert_eq!(data.pages, vec!["page-1"]);
}

#[test]
fn set_data_bypasses_page_fetches() {
    let client = QueryClient::new();
    let query = page_query(client, "manual");

    query.set_data(|prev| {
        let mut data = prev.unwrap_or_default();
        data.pages.push("page-manual".to_string());
        data.page_params.push(99);
        data
    });

    let data = query.peek().data.unwrap();
    assert_eq!(data.page_params, vec![99]);
    assert_eq!(data.pages, vec!["page-manual"]);
}

#[test]
fn cumulative_operations_cover_every_prior_key() {
    let client = QueryClient::new();
    let sel = ObservableCell::new("a");

    let s = sel.clone();
    let query: InfiniteQuery<String, i32> = InfiniteQuery::new(
        InfiniteQueryConfig::new(
            client.clone(),
            query_key!["scroll"],
            1,
            |_key, param: &i32| Ok::<_, FetchError>(format!("page-{param}")),
        )
        .dynamic_key(move || {
            let section = s.get();
            query_key!["scroll", section]
        })
        .cumulative_hashes(),
    );

    let key_a = query_key!["scroll", "a"];
    let key_b = query_key!["scroll", "b"];
    assert!(client
        .get_query_data::<InfiniteData<String, i32>>(&key_a)
        .is_some());

    // Key change mounts the new entry and keeps the old one in the cache.
    sel.set("b");
    assert!(client
        .get_query_data::<InfiniteData<String, i32>>(&key_b)
        .is_some());
    assert!(client
        .get_query_data::<InfiniteData<String, i32>>(&key_a)
        .is_some());

    // Bulk removal covers the full hash history, not just the current key.
    query.remove();
    assert!(client
        .get_query_data::<InfiniteData<String, i32>>(&key_a)
        .is_none());
    assert!(client
        .get_query_data::<InfiniteData<String, i32>>(&key_b)
        .is_none());
}

#[test]
fn eager_mount_fetches_the_initial_page() {
    let client = QueryClient::new();
    let query: InfiniteQuery<String, i32> = InfiniteQuery::new(
        InfiniteQueryConfig::new(client, query_key!["eager"], 1, |_key, param: &i32| {
            Ok::<_, FetchError>(format!("page-{param}"))
        })
        .next_param(|data: &InfiniteData<String, i32>| data.page_params.last().map(|p| p + 1)),
    );

    let data = query.peek().data.unwrap();
    assert_eq!(data.page_params, vec![1]);
}

#[test]
fn destroyed_infinite_query_rejects_page_fetches() {
    let client = QueryClient::new();
    let query = page_query(client, "gone");

    query.destroy();
    assert!(query.fetch_next_page().is_err());
}
