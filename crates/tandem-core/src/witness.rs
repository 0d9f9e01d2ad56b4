//! After-the-fact proof of a happens-before relationship.
//!
//! One side calls [`OrderWitness::mark_ran_first`] once it has done the work
//! that should unblock the peer. The peer calls
//! [`OrderWitness::mark_potential_block_point`] right after the call it
//! expects to have blocked. If the block really happened, the snapshot sees
//! the raised flag.

use std::sync::atomic::{AtomicBool, Ordering};

/// Atomic flag pair proving that one point ran before another.
#[derive(Debug, Default)]
pub struct OrderWitness {
    raised: AtomicBool,
    captured_before: AtomicBool,
}

impl OrderWitness {
    /// Create a witness with nothing raised or captured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current flag. Call where the peer should already have
    /// run.
    pub fn mark_potential_block_point(&self) {
        let raised = self.raised.load(Ordering::SeqCst);
        self.captured_before.store(raised, Ordering::SeqCst);
        tracing::debug!(raised, "Block point reached");
    }

    /// Raise the flag. One-shot; later calls are no-ops.
    pub fn mark_ran_first(&self) {
        let first = self.raised.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);
        if first.is_ok() {
            tracing::debug!("Ran-first point reached");
        }
    }

    /// True only if `mark_ran_first` happened before the last
    /// `mark_potential_block_point`.
    #[must_use]
    pub fn was_correct_order(&self) -> bool {
        self.captured_before.load(Ordering::SeqCst)
    }

    /// Whether `mark_ran_first` has been called.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}
