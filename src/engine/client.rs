// ============================================================================
// spark-query - Query Client
// Shared entry point: defaults, cache bulk operations, fetch dispatcher
// ============================================================================
//
// One client is shared by every controller; controllers coordinate only
// through its cache (never through direct references to each other). The
// client also owns the stamp counter that gives every settle a monotonic
// identity, and the dispatcher that decides whether fetch jobs run
// immediately or queue for stepped execution.
// ============================================================================

use std::cell::Cell;
use std::rc::Rc;

use crate::core::key::{hash_key, KeyHashFn, QueryFilter, QueryHash, QueryKey};
use crate::core::options::DefaultOptions;
use crate::engine::cache::{QueryCache, QueryEntry};
use crate::engine::fetch::{Dispatcher, FetchMode};
use crate::reactive::runtime::now_ms;

// =============================================================================
// CONFIG
// =============================================================================

/// Client construction parameters. All optional; `ClientConfig::default()`
/// gives an auto-dispatching client with engine defaults and the structural
/// key hash.
pub struct ClientConfig {
    pub defaults: DefaultOptions,
    /// Overrides the default structural hash for every key on this client.
    pub hash_fn: Option<KeyHashFn>,
    pub fetch_mode: FetchMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultOptions::default(),
            hash_fn: None,
            fetch_mode: FetchMode::Auto,
        }
    }
}

// =============================================================================
// QUERY CLIENT
// =============================================================================

struct ClientInner {
    cache: QueryCache,
    defaults: DefaultOptions,
    hash_fn: Option<KeyHashFn>,
    dispatcher: Dispatcher,
    stamp: Cell<u64>,
}

/// Handle to the shared engine. Cheap to clone; all clones address the same
/// cache and dispatcher.
#[derive(Clone)]
pub struct QueryClient {
    inner: Rc<ClientInner>,
}

impl QueryClient {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            inner: Rc::new(ClientInner {
                cache: QueryCache::new(),
                defaults: config.defaults,
                hash_fn: config.hash_fn,
                dispatcher: Dispatcher::new(config.fetch_mode),
                stamp: Cell::new(0),
            }),
        }
    }

    /// Engine-level defaults, the bottom layer of every option merge.
    pub fn default_options(&self) -> DefaultOptions {
        self.inner.defaults.clone()
    }

    pub(crate) fn hash(&self, key: &QueryKey) -> QueryHash {
        match &self.inner.hash_fn {
            Some(f) => f(key),
            None => hash_key(key),
        }
    }

    pub(crate) fn next_stamp(&self) -> u64 {
        let stamp = self.inner.stamp.get() + 1;
        self.inner.stamp.set(stamp);
        stamp
    }

    /// Most recently issued stamp. Every settle that already happened has a
    /// stamp at or below this; every future settle gets a higher one.
    pub(crate) fn current_stamp(&self) -> u64 {
        self.inner.stamp.get()
    }

    pub(crate) fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub(crate) fn dispatch(&self, job: Box<dyn FnOnce()>) {
        self.inner.dispatcher.dispatch(job);
    }

    // -- stepped execution ------------------------------------------------------

    /// Run one queued fetch job (manual mode). Returns false when the queue
    /// is empty.
    pub fn flush_one(&self) -> bool {
        self.inner.dispatcher.flush_one()
    }

    /// Run queued fetch jobs until none remain.
    pub fn flush(&self) {
        self.inner.dispatcher.flush();
    }

    pub fn pending_fetches(&self) -> usize {
        self.inner.dispatcher.pending_jobs()
    }

    // -- cache operations -------------------------------------------------------

    /// Write data for a key directly, bypassing fetch. The updater receives
    /// the current cached value, if any. Creates the entry if absent.
    pub fn set_query_data<T: Clone + 'static>(
        &self,
        key: &QueryKey,
        updater: impl FnOnce(Option<T>) -> T,
    ) {
        let hash = self.hash(key);
        let entry = self.inner.cache.get_or_create(key, &hash);
        let current = entry
            .state
            .borrow()
            .data
            .as_ref()
            .and_then(|d| d.downcast_ref::<T>())
            .cloned();
        let next = updater(current);
        entry.write_data(Rc::new(next), self.next_stamp(), now_ms());
    }

    /// Read cached data for a key, if present and of the expected type.
    pub fn get_query_data<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
        let hash = self.hash(key);
        let entry = self.inner.cache.get(&hash)?;
        let state = entry.state.borrow();
        state.data.as_ref().and_then(|d| d.downcast_ref::<T>()).cloned()
    }

    /// Mark matching entries stale; observed entries refetch.
    pub fn invalidate_queries(&self, filter: &QueryFilter) {
        self.invalidate_where(filter, None);
    }

    /// Reset matching entries to the never-fetched state.
    pub fn reset_queries(&self, filter: &QueryFilter) {
        self.reset_where(filter, None);
    }

    /// Evict matching entries from the cache, cancelling in-flight fetches.
    pub fn remove_queries(&self, filter: &QueryFilter) {
        self.remove_where(filter, None);
    }

    /// Listener count on the entry for a key; 0 when the entry is absent.
    pub fn observer_count(&self, key: &QueryKey) -> usize {
        let hash = self.hash(key);
        self.inner
            .cache
            .get(&hash)
            .map_or(0, |entry| entry.listener_count())
    }

    // Bulk operations scoped to entries with at most `max_listeners`
    // listeners; controllers use this for cumulative-hash cleanup that must
    // not disturb entries other observers still need.

    pub(crate) fn invalidate_where(&self, filter: &QueryFilter, max_listeners: Option<usize>) {
        for entry in self.matching(filter, max_listeners) {
            tracing::debug!(hash = %entry.hash, "invalidating entry");
            entry.invalidate();
        }
    }

    pub(crate) fn reset_where(&self, filter: &QueryFilter, max_listeners: Option<usize>) {
        for entry in self.matching(filter, max_listeners) {
            tracing::debug!(hash = %entry.hash, "resetting entry");
            entry.reset();
        }
    }

    pub(crate) fn remove_where(&self, filter: &QueryFilter, max_listeners: Option<usize>) {
        for entry in self.matching(filter, max_listeners) {
            self.inner.cache.remove(&entry.hash);
        }
    }

    fn matching(&self, filter: &QueryFilter, max_listeners: Option<usize>) -> Vec<Rc<QueryEntry>> {
        self.inner.cache.find(filter, max_listeners)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(name: &str) -> QueryKey {
        QueryKey::from_values(vec![json!(name)])
    }

    #[test]
    fn set_and_get_query_data() {
        let client = QueryClient::new();
        let k = key("todos");

        assert_eq!(client.get_query_data::<Vec<i32>>(&k), None);

        client.set_query_data(&k, |_: Option<Vec<i32>>| vec![1, 2, 3]);
        assert_eq!(client.get_query_data::<Vec<i32>>(&k), Some(vec![1, 2, 3]));

        // Updater sees the current value.
        client.set_query_data(&k, |prev: Option<Vec<i32>>| {
            let mut v = prev.unwrap_or_default();
            v.push(4);
            v
        });
        assert_eq!(client.get_query_data::<Vec<i32>>(&k), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn stamps_are_monotonic() {
        let client = QueryClient::new();
        let a = client.next_stamp();
        let b = client.next_stamp();
        assert!(b > a);
    }

    #[test]
    fn remove_evicts_by_prefix() {
        let client = QueryClient::new();
        client.set_query_data(&key("a"), |_: Option<i32>| 1);
        client.set_query_data(&key("b"), |_: Option<i32>| 2);

        client.remove_queries(&QueryFilter {
            key: Some(key("a")),
            exact: false,
            hashes: None,
        });

        assert_eq!(client.get_query_data::<i32>(&key("a")), None);
        assert_eq!(client.get_query_data::<i32>(&key("b")), Some(2));
    }

    #[test]
    fn reset_clears_data_in_place() {
        let client = QueryClient::new();
        let k = key("r");
        client.set_query_data(&k, |_: Option<i32>| 9);

        client.reset_queries(&QueryFilter::exact(k.clone()));
        assert_eq!(client.get_query_data::<i32>(&k), None);
        // Entry still exists (reset, not removed).
        assert_eq!(client.cache().len(), 1);
    }

    #[test]
    fn custom_hash_fn_is_used() {
        let config = ClientConfig {
            hash_fn: Some(Rc::new(|_key| hash_key(&key("fixed")))),
            ..Default::default()
        };
        let client = QueryClient::with_config(config);

        // Both keys collapse onto the same entry under the custom hash.
        client.set_query_data(&key("x"), |_: Option<i32>| 1);
        assert_eq!(client.get_query_data::<i32>(&key("y")), Some(1));
    }
}
