// ============================================================================
// spark-query - Reactive Substrate
// ============================================================================
//
// The minimal slice of a fine-grained reactive runtime the bindings consume:
// observable cells, watchers, batching/untrack, observed/unobserved hooks,
// and a virtual clock for deterministic debounce timers. The rest of the
// crate treats this module as a capability interface; nothing outside it
// touches dependency-tracking internals.
// ============================================================================

pub mod cell;
pub mod runtime;
pub mod watcher;

pub use cell::{default_equals, never_equals, EqualsFn, ObservableCell, ObservedHooks};
pub use runtime::{advance_clock, batch, cancel_timer, is_batching, now_ms, set_timeout, untrack, TimerId};
pub use watcher::{watch_memo, Watcher};
