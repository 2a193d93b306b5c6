//! Cross-request state with process lifetime

use apitally_core::ConsumerRegistry;
use std::sync::atomic::{AtomicBool, Ordering};

/// State shared by every request an interceptor sees.
///
/// Usually one per process, but it is an ordinary value: tests create a
/// fresh one, and several layers may share one through
/// [`ApitallyLayerBuilder::state`](crate::ApitallyLayerBuilder::state).
#[derive(Debug, Default)]
pub struct ProcessState {
    startup_sent: AtomicBool,
    consumers: ConsumerRegistry,
}

impl ProcessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once, for the caller that should send startup
    /// metadata.
    pub fn claim_startup(&self) -> bool {
        self.startup_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether startup metadata was already claimed
    pub fn startup_sent(&self) -> bool {
        self.startup_sent.load(Ordering::Acquire)
    }

    /// Consumers whose metadata was already emitted
    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    /// Forget everything, as if the process had just started
    pub fn reset(&self) {
        self.startup_sent.store(false, Ordering::Release);
        self.consumers.clear();
    }
}
