// ============================================================================
// spark-query - Ergonomic Macros
// ============================================================================

/// Helper macro to clone variables into a move closure.
///
/// This reduces the boilerplate of manually cloning `Rc`-backed handles
/// (clients, queries, cells) before moving them into a closure.
///
/// # Usage
///
/// ```rust
/// use spark_query::{cloned, ObservableCell, Watcher};
///
/// let count = ObservableCell::new(0);
/// let _watch = Watcher::new(cloned!(count => move || {
///     let _ = count.get();
/// }));
/// ```
#[macro_export]
macro_rules! cloned {
    ($($n:ident),+ => $e:expr) => {
        {
            $( let $n = $n.clone(); )+
            $e
        }
    };
}

/// Build a [`QueryKey`](crate::QueryKey) from JSON-serializable parts.
///
/// Each part goes through `serde_json`'s value construction, so literals,
/// variables, and inline objects all work:
///
/// ```rust
/// use spark_query::query_key;
///
/// let user_id = 42;
/// let key = query_key!["todos", user_id, {"archived": false}];
/// assert_eq!(key.values().len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    [] => {
        $crate::QueryKey::new()
    };
    [$($part:tt),+ $(,)?] => {
        $crate::QueryKey::from_values(vec![$($crate::__json!($part)),+])
    };
}
