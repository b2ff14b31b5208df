//! Single-use latch guarding outcome delivery.

use std::sync::atomic::{AtomicBool, Ordering};

/// Opens exactly once. The first caller of `try_fire` wins; every later
/// caller, from any task, gets `false`.
#[derive(Debug, Default)]
pub struct OutcomeLatch {
    fired: AtomicBool,
}

impl OutcomeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_fire(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
