//! Reactive state: signals, computeds and dependency tracking.
//!
//! Three lifetimes exist. Component-local signals live in a component
//! instance's hook slots and are disposed when it unmounts. Shared signals
//! live in the [`Com`](crate::com::Com) under a key for the whole execution.
//! Computeds derive from either and are pull-based: writes only invalidate.

mod computed;
mod signal;
mod tracking;

pub use computed::Computed;
pub(crate) use signal::Disposable;
pub use signal::Signal;
pub use tracking::untracked;

/// Bound for anything stored in a signal.
pub trait StateValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> StateValue for T {}
