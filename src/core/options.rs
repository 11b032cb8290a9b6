// ============================================================================
// spark-query - Options
// Layered partial options and their fully-resolved form
// ============================================================================
//
// Options arrive in layers: client defaults, then the controller's base
// options, then dynamic options recomputed inside the tracked merge, then an
// imperative patch applied last. Each layer is partial; later layers win
// field-wise. The merged result plus the evaluated enabled flag and the
// current key/hash form a ResolvedOptions value, which is what the
// reconciler memoizes on.
// ============================================================================

use std::rc::Rc;

use crate::core::error::FetchError;
use crate::core::key::{QueryHash, QueryKey};

// =============================================================================
// ENABLED
// =============================================================================

/// Whether a query may fetch. `When` carries a predicate evaluated inside
/// the reconciler's tracked merge, so reactive reads in the predicate
/// re-trigger reconciliation.
#[derive(Clone)]
pub enum Enabled {
    Fixed(bool),
    When(Rc<dyn Fn() -> bool>),
}

impl Enabled {
    pub fn evaluate(&self) -> bool {
        match self {
            Self::Fixed(v) => *v,
            Self::When(f) => f(),
        }
    }
}

impl std::fmt::Debug for Enabled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(v) => f.debug_tuple("Fixed").field(v).finish(),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

// =============================================================================
// THROW POLICY
// =============================================================================

/// Whether a settled error is surfaced to the awaiting caller as `Err`, or
/// only recorded in the snapshot.
#[derive(Clone)]
pub enum ThrowOnError {
    Fixed(bool),
    When(Rc<dyn Fn(&FetchError) -> bool>),
}

impl ThrowOnError {
    pub fn should_throw(&self, error: &FetchError) -> bool {
        match self {
            Self::Fixed(v) => *v,
            Self::When(f) => f(error),
        }
    }
}

impl PartialEq for ThrowOnError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Fixed(a), Self::Fixed(b)) => a == b,
            (Self::When(a), Self::When(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for ThrowOnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(v) => f.debug_tuple("Fixed").field(v).finish(),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

// =============================================================================
// NOTIFY SCOPE / RETRY
// =============================================================================

/// Which snapshot changes reach the result slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyScope {
    /// Every state transition is pushed.
    #[default]
    All,
    /// Only transitions that change `data`, `error`, or `status`;
    /// fetch-status-only churn is suppressed.
    Data,
}

/// Retry configuration. `max_attempts` counts the initial attempt, so 1
/// means no retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_attempts: 1 }
    }

    pub fn times(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

// =============================================================================
// OPTION LAYERS
// =============================================================================

/// One partial layer of options. `None` means "defer to the layer below".
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub enabled: Option<Enabled>,
    pub stale_time_ms: Option<u64>,
    pub retry: Option<RetryPolicy>,
    pub notify: Option<NotifyScope>,
    pub throw_on_error: Option<ThrowOnError>,
}

/// Imperative patch applied on top of all other layers.
pub type OptionsPatch = QueryOptions;

/// Concrete fallback values carried by the client. The bottom layer of
/// every merge.
#[derive(Debug, Clone)]
pub struct DefaultOptions {
    pub enabled: Enabled,
    pub stale_time_ms: u64,
    pub retry: RetryPolicy,
    pub notify: NotifyScope,
    pub throw_on_error: ThrowOnError,
}

impl Default for DefaultOptions {
    fn default() -> Self {
        Self {
            enabled: Enabled::Fixed(true),
            stale_time_ms: 0,
            retry: RetryPolicy::none(),
            notify: NotifyScope::All,
            throw_on_error: ThrowOnError::Fixed(false),
        }
    }
}

// =============================================================================
// MERGE AND RESOLVE
// =============================================================================

/// Field-wise merge of option layers over the defaults, before the enabled
/// predicate has been evaluated. The reconciler decides whether evaluation
/// happens at all (a gated query never runs its predicate).
#[derive(Clone)]
pub struct MergedOptions {
    pub enabled: Enabled,
    pub stale_time_ms: u64,
    pub retry: RetryPolicy,
    pub notify: NotifyScope,
    pub throw_on_error: ThrowOnError,
}

impl MergedOptions {
    /// Merge `layers` over `defaults`, later layers winning per field.
    pub fn merge(defaults: &DefaultOptions, layers: &[&QueryOptions]) -> Self {
        let mut merged = Self {
            enabled: defaults.enabled.clone(),
            stale_time_ms: defaults.stale_time_ms,
            retry: defaults.retry,
            notify: defaults.notify,
            throw_on_error: defaults.throw_on_error.clone(),
        };
        for layer in layers {
            if let Some(enabled) = &layer.enabled {
                merged.enabled = enabled.clone();
            }
            if let Some(stale) = layer.stale_time_ms {
                merged.stale_time_ms = stale;
            }
            if let Some(retry) = layer.retry {
                merged.retry = retry;
            }
            if let Some(notify) = layer.notify {
                merged.notify = notify;
            }
            if let Some(throw) = &layer.throw_on_error {
                merged.throw_on_error = throw.clone();
            }
        }
        merged
    }

    /// Finalize into the value the reconciler memoizes on, with the enabled
    /// decision already made.
    pub fn into_resolved(self, key: QueryKey, hash: QueryHash, enabled: bool) -> ResolvedOptions {
        ResolvedOptions {
            key,
            hash,
            enabled,
            stale_time_ms: self.stale_time_ms,
            retry: self.retry,
            notify: self.notify,
            throw_on_error: self.throw_on_error,
        }
    }
}

/// Fully resolved options for one reconciliation pass.
///
/// Equality is structural (with function-valued throw policies compared by
/// identity), so an unchanged resolution produces no observer churn.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub key: QueryKey,
    pub hash: QueryHash,
    pub enabled: bool,
    pub stale_time_ms: u64,
    pub retry: RetryPolicy,
    pub notify: NotifyScope,
    pub throw_on_error: ThrowOnError,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::hash_key;
    use serde_json::json;

    fn key() -> QueryKey {
        QueryKey::from_values(vec![json!("k")])
    }

    #[test]
    fn later_layers_win() {
        let defaults = DefaultOptions::default();
        let base = QueryOptions {
            stale_time_ms: Some(100),
            notify: Some(NotifyScope::Data),
            ..Default::default()
        };
        let patch = QueryOptions {
            stale_time_ms: Some(200),
            ..Default::default()
        };

        let merged = MergedOptions::merge(&defaults, &[&base, &patch]);
        assert_eq!(merged.stale_time_ms, 200);
        assert_eq!(merged.notify, NotifyScope::Data);
        assert_eq!(merged.retry, RetryPolicy::none());
    }

    #[test]
    fn empty_layers_yield_defaults() {
        let defaults = DefaultOptions {
            stale_time_ms: 42,
            ..Default::default()
        };
        let merged = MergedOptions::merge(&defaults, &[]);
        assert_eq!(merged.stale_time_ms, 42);
        assert!(merged.enabled.evaluate());
    }

    #[test]
    fn resolved_equality_ignores_nothing_structural() {
        let defaults = DefaultOptions::default();
        let merged = MergedOptions::merge(&defaults, &[]);
        let k = key();
        let h = hash_key(&k);

        let a = merged.clone().into_resolved(k.clone(), h.clone(), true);
        let b = merged.clone().into_resolved(k.clone(), h.clone(), true);
        let c = merged.into_resolved(k, h, false);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn throw_policy_when_compares_by_identity() {
        let f: Rc<dyn Fn(&FetchError) -> bool> = Rc::new(|_| true);
        let a = ThrowOnError::When(f.clone());
        let b = ThrowOnError::When(f);
        let c = ThrowOnError::When(Rc::new(|_| true));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn retry_policy_counts_attempts() {
        assert_eq!(RetryPolicy::none().max_attempts, 1);
        assert_eq!(RetryPolicy::times(2).max_attempts, 3);
    }

    #[test]
    fn enabled_predicate_evaluates() {
        let e = Enabled::When(Rc::new(|| false));
        assert!(!e.evaluate());
        assert!(Enabled::Fixed(true).evaluate());
    }
}
