// ============================================================================
// spark-query - Query Keys and Hashes
// Cache identity: an ordered sequence of serializable values and its digest
// ============================================================================

use std::rc::Rc;

use serde_json::Value;

// =============================================================================
// QUERY KEY
// =============================================================================

/// Identity of a cache entry: an ordered sequence of JSON-serializable
/// values, e.g. `["todos", 42, {"archived": false}]`.
///
/// Keys compare structurally; their [`QueryHash`] is what the cache is
/// addressed by.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prefix match, used by non-exact filters: `["todos"]` matches
    /// `["todos", 42]` but not the reverse.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }
}

impl<V: Into<Value>> FromIterator<V> for QueryKey {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// QUERY HASH
// =============================================================================

/// Deterministic digest of a [`QueryKey`], used for cache addressing and
/// identity comparison.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryHash(String);

impl QueryHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied hash function, overriding [`hash_key`].
pub type KeyHashFn = Rc<dyn Fn(&QueryKey) -> QueryHash>;

/// Default structural hash: the canonical JSON encoding of the key sequence.
/// `serde_json` maps are ordered, so two structurally equal keys always
/// produce the same hash regardless of how their objects were built.
pub fn hash_key(key: &QueryKey) -> QueryHash {
    QueryHash(Value::Array(key.values().to_vec()).to_string())
}

// =============================================================================
// QUERY FILTER
// =============================================================================

/// Selects cache entries for bulk operations (invalidate / reset / remove).
#[derive(Clone, Debug, Default)]
pub struct QueryFilter {
    /// Match entries by key: prefix match by default, exact when `exact`.
    pub key: Option<QueryKey>,
    pub exact: bool,
    /// Match entries by explicit hash set (cumulative-hash cleanup).
    pub hashes: Option<Vec<QueryHash>>,
}

impl QueryFilter {
    /// Filter matching a key and everything under it.
    pub fn prefix(key: QueryKey) -> Self {
        Self {
            key: Some(key),
            exact: false,
            hashes: None,
        }
    }

    /// Filter matching exactly one key.
    pub fn exact(key: QueryKey) -> Self {
        Self {
            key: Some(key),
            exact: true,
            hashes: None,
        }
    }

    /// Filter matching a set of hashes.
    pub fn hashes(hashes: Vec<QueryHash>) -> Self {
        Self {
            key: None,
            exact: false,
            hashes: Some(hashes),
        }
    }

    /// Filter matching every entry.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, key: &QueryKey, hash: &QueryHash) -> bool {
        if let Some(hashes) = &self.hashes {
            if !hashes.contains(hash) {
                return false;
            }
        }
        if let Some(filter_key) = &self.key {
            if self.exact {
                if filter_key != key {
                    return false;
                }
            } else if !filter_key.is_prefix_of(key) {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// TESTS
// =============================================================================
