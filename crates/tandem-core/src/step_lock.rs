//! Binary two-token handoff between exactly two execution contexts.
//!
//! Each side owns one permit. A side proceeds only after consuming its
//! own permit, and passes the turn by signalling the peer's permit. Both
//! permits start held, so neither side runs until granted.
//!
//! ```text
//!        A                         B
//!   ─────────────              ─────────────
//!   run a1                     take(B)  ····· blocked
//!   handoff(A) ──signal(B)──>  run b1
//!     take(A) ···· blocked     handoff(B)
//!   run a2     <──signal(A)──    take(B) ···· blocked
//! ```
//!
//! # Invariants
//!
//! - At most one outstanding permit per side: signalling an available permit
//!   is a no-op, never a second token.
//! - A take consumes exactly one token.
//! - [`StepLock::terminate`] signals both permits. It wakes any blocked
//!   waiter once; the lock stays usable afterwards.
//!
//! Waits cannot be cancelled. Spurious condvar wakeups are absorbed and the
//! wait retried.

#![allow(clippy::disallowed_types, reason = "Blocking handoff between OS threads")]

use std::{
    io,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use crate::party::Party;

/// Token state of one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitState {
    /// Not granted. A take blocks.
    Held,
    /// Granted once. The next take consumes it.
    Available,
}

/// Binary "allowed to proceed" token for one side.
#[derive(Debug)]
struct Permit {
    state: Mutex<PermitState>,
    cv: Condvar,
}

impl Permit {
    fn held() -> Self {
        Self { state: Mutex::new(PermitState::Held), cv: Condvar::new() }
    }

    /// Lock state with poison recovery.
    ///
    /// A party that panicked while touching its permit must not wedge the
    /// peer, so the poisoned state is recovered and used as-is.
    fn lock_or_recover(&self) -> MutexGuard<'_, PermitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self) {
        let mut state = self.lock_or_recover();
        if *state == PermitState::Held {
            *state = PermitState::Available;
            self.cv.notify_one();
        }
    }

    fn take(&self) {
        let mut state = self.lock_or_recover();
        while *state == PermitState::Held {
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        *state = PermitState::Held;
    }

    fn is_available(&self) -> bool {
        *self.lock_or_recover() == PermitState::Available
    }
}

#[derive(Debug)]
struct Permits {
    a: Permit,
    b: Permit,
}

impl Permits {
    fn of(&self, party: Party) -> &Permit {
        match party {
            Party::A => &self.a,
            Party::B => &self.b,
        }
    }
}

/// Strict blocking handoff so two contexts interleave in an exact order.
///
/// Cheap to clone; clones share the same pair of permits.
#[derive(Debug, Clone)]
pub struct StepLock {
    permits: Arc<Permits>,
}

impl Default for StepLock {
    fn default() -> Self {
        Self::new()
    }
}

impl StepLock {
    /// Create a lock with both permits held.
    pub fn new() -> Self {
        Self { permits: Arc::new(Permits { a: Permit::held(), b: Permit::held() }) }
    }

    /// Make `party`'s permit available. Never blocks.
    pub fn signal(&self, party: Party) {
        tracing::debug!(party = %party, "Signal");
        self.permits.of(party).signal();
    }

    /// Block until `party`'s permit is available, then consume it.
    pub fn take(&self, party: Party) {
        tracing::debug!(party = %party, "Waiting for turn");
        self.permits.of(party).take();
        tracing::debug!(party = %party, "Turn granted");
    }

    /// Yield to the peer, then wait to be handed back.
    pub fn handoff(&self, party: Party) {
        self.signal(party.other());
        self.take(party);
    }

    /// Signal A's permit.
    pub fn signal_a(&self) {
        self.signal(Party::A);
    }

    /// Signal B's permit.
    pub fn signal_b(&self) {
        self.signal(Party::B);
    }

    /// Wait for A's turn.
    pub fn take_a(&self) {
        self.take(Party::A);
    }

    /// Wait for B's turn.
    pub fn take_b(&self) {
        self.take(Party::B);
    }

    /// `signal_b` then `take_a`.
    pub fn handoff_a(&self) {
        self.handoff(Party::A);
    }

    /// `signal_a` then `take_b`.
    pub fn handoff_b(&self) {
        self.handoff(Party::B);
    }

    /// Signal both permits, releasing any blocked waiter.
    ///
    /// Safe to call repeatedly: each permit still holds at most one token.
    pub fn terminate(&self) {
        tracing::debug!("Terminating step lock");
        self.permits.a.signal();
        self.permits.b.signal();
    }

    /// Whether a take on `party` would return without blocking.
    pub fn is_available(&self, party: Party) -> bool {
        self.permits.of(party).is_available()
    }

    /// Call [`Self::terminate`] from a background timer after `delay`.
    ///
    /// Fire-and-forget: the timer cannot be cancelled and keeps the permits
    /// alive until it fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer thread cannot be spawned.
    pub fn deferred_terminate(&self, delay: Duration) -> io::Result<()> {
        let lock = self.clone();
        spawn_timer("tandem-terminate", delay, move || lock.terminate())
    }

    /// Call [`Self::signal`] for `party` from a background timer after
    /// `delay`.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer thread cannot be spawned.
    pub fn deferred_signal(&self, party: Party, delay: Duration) -> io::Result<()> {
        let lock = self.clone();
        spawn_timer("tandem-probe", delay, move || {
            tracing::warn!(party = %party, delay_ms = delay.as_millis(), "Probe fired");
            lock.signal(party);
        })
    }
}

#[allow(clippy::disallowed_methods, reason = "Timer runs on its own thread")]
fn spawn_timer<F>(name: &str, delay: Duration, fire: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(move || {
        thread::sleep(delay);
        fire();
    })?;
    Ok(())
}
