//! Stop predicates polled once per loop iteration

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Zero-argument probe deciding whether training should stop
///
/// Must be cheap and non-blocking: it is evaluated before every step.
pub trait StopPredicate: Send + Sync {
    fn should_stop(&self) -> bool;
}

impl<F> StopPredicate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn should_stop(&self) -> bool {
        self()
    }
}

/// Default predicate: training runs until the strategy finishes
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl StopPredicate for NeverStop {
    fn should_stop(&self) -> bool {
        false
    }
}

/// Externally settable stop flag (signal handlers, supervisors)
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop at the next iteration
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl StopPredicate for StopFlag {
    fn should_stop(&self) -> bool {
        self.is_set()
    }
}
