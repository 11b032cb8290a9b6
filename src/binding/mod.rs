// ============================================================================
// spark-query - Binding Layer
// Subscription, lifecycle, and option-reconciliation machinery shared by
// every controller
// ============================================================================

pub mod lazy;
pub mod reconcile;
pub mod result_slot;
pub mod scope;

pub use lazy::{LazyObservationBridge, Rearm};
pub use reconcile::{
    ApplyFn, DynamicKeyFn, DynamicOptionsFn, EnabledGate, Reconciler, ReconcilerConfig,
};
pub use result_slot::ResultSlot;
pub use scope::{AbortSignal, CancellationScope};
