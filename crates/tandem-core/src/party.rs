//! Party identity and per-party lifecycle.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐  start   ┌─────────┐   finish   ┌───────────┐
//! │ NotStarted │─────────>│ Running │───────────>│ Completed │
//! └────────────┘          └─────────┘            └───────────┘
//!                          │      ↑
//!                    wait  │      │ granted
//!                          ↓      │
//!                     ┌────────────────┐
//!                     │ WaitingForPeer │
//!                     └────────────────┘
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
};

use crate::step_lock::StepLock;

/// One of the two concurrent logical transactions being scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Party {
    /// Opening party. Always declares the first step.
    A,
    /// Second party. Waits for its first turn before running anything.
    B,
}

impl Party {
    /// The peer of this party.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

/// Lifecycle of one party's execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PartyState {
    /// Context not spawned yet
    NotStarted = 0,
    /// Executing user code or markers
    Running = 1,
    /// Blocked on its own permit
    WaitingForPeer = 2,
    /// Context finished (normally or not). Terminal.
    Completed = 3,
}

impl PartyState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted | Self::WaitingForPeer, Self::Running)
                | (Self::Running, Self::WaitingForPeer | Self::Completed)
        )
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotStarted,
            1 => Self::Running,
            2 => Self::WaitingForPeer,
            _ => Self::Completed,
        }
    }
}

/// Stamp meaning "has not failed".
const NO_FAILURE: usize = usize::MAX;

const fn slot(party: Party) -> usize {
    match party {
        Party::A => 0,
        Party::B => 1,
    }
}

/// State both lanes of one execution share.
#[derive(Debug)]
struct Session {
    lock: StepLock,
    /// Set once a party has left the protocol for good
    departed: [AtomicBool; 2],
    /// Order in which each party failed, `NO_FAILURE` if it did not
    failed_at: [AtomicUsize; 2],
    /// Source of failure stamps
    clock: AtomicUsize,
}

/// Per-party execution lane.
///
/// Shared between a party's steps and the executor that reports on them.
/// Only the owning party's context writes its counters; the executor reads
/// them after joining.
#[derive(Debug)]
pub(crate) struct Lane {
    party: Party,
    session: Arc<Session>,
    state: AtomicU8,
    operations: AtomicUsize,
    handoffs: AtomicUsize,
    probes: AtomicUsize,
}

impl Lane {
    /// Lanes for A and B over a fresh step lock.
    pub(crate) fn pair() -> [Arc<Self>; 2] {
        let session = Arc::new(Session {
            lock: StepLock::new(),
            departed: [AtomicBool::new(false), AtomicBool::new(false)],
            failed_at: [AtomicUsize::new(NO_FAILURE), AtomicUsize::new(NO_FAILURE)],
            clock: AtomicUsize::new(0),
        });
        [Party::A, Party::B].map(|party| Arc::new(Self::new(party, Arc::clone(&session))))
    }

    fn new(party: Party, session: Arc<Session>) -> Self {
        Self {
            party,
            session,
            state: AtomicU8::new(PartyState::NotStarted as u8),
            operations: AtomicUsize::new(0),
            handoffs: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn party(&self) -> Party {
        self.party
    }

    pub(crate) fn lock(&self) -> &StepLock {
        &self.session.lock
    }

    pub(crate) fn state(&self) -> PartyState {
        PartyState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`. Illegal transitions are ignored and logged; the
    /// terminal state is never left.
    pub(crate) fn transition(&self, next: PartyState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            tracing::warn!(party = %self.party, ?current, ?next, "Ignoring illegal party transition");
            return;
        }

        self.state.store(next as u8, Ordering::Release);
        tracing::trace!(party = %self.party, from = ?current, to = ?next, "Party transition");
    }

    /// Yield to the peer and block until handed back.
    ///
    /// Once the peer has departed there is nobody to hand back, so this
    /// returns at once and is not counted.
    pub(crate) fn handoff(&self) {
        if self.peer_departed() {
            tracing::trace!(party = %self.party, "Peer departed, handoff skipped");
            return;
        }

        self.transition(PartyState::WaitingForPeer);
        self.session.lock.handoff(self.party);
        self.handoffs.fetch_add(1, Ordering::Relaxed);
        self.transition(PartyState::Running);
    }

    /// Block until the first turn is granted, unless the peer already left.
    pub(crate) fn await_turn(&self) {
        if self.peer_departed() {
            return;
        }

        self.transition(PartyState::WaitingForPeer);
        self.session.lock.take(self.party);
        self.transition(PartyState::Running);
    }

    /// Leave the protocol and wake the peer if it waits on this party.
    ///
    /// The flag is raised before the signal, so a peer either sees it or
    /// consumes the signal.
    pub(crate) fn depart(&self) {
        self.session.departed[slot(self.party)].store(true, Ordering::SeqCst);
        self.session.lock.terminate();
    }

    pub(crate) fn peer_departed(&self) -> bool {
        self.session.departed[slot(self.party.other())].load(Ordering::SeqCst)
    }

    /// Stamp this party's failure. Only the first stamp sticks.
    pub(crate) fn record_failure(&self) {
        let stamp = self.session.clock.fetch_add(1, Ordering::SeqCst);
        let _ = self.session.failed_at[slot(self.party)].compare_exchange(
            NO_FAILURE,
            stamp,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Position of this party's failure among all failures, if it failed.
    pub(crate) fn failure_order(&self) -> Option<usize> {
        let stamp = self.session.failed_at[slot(self.party)].load(Ordering::SeqCst);
        (stamp != NO_FAILURE).then_some(stamp)
    }

    pub(crate) fn record_operation(&self) -> usize {
        self.operations.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn operations(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    pub(crate) fn handoffs(&self) -> usize {
        self.handoffs.load(Ordering::Relaxed)
    }

    pub(crate) fn probes(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_is_involution() {
        assert_eq!(Party::A.other(), Party::B);
        assert_eq!(Party::B.other(), Party::A);
        assert_eq!(Party::A.other().other(), Party::A);
    }

    #[test]
    fn legal_transitions() {
        use PartyState::{Completed, NotStarted, Running, WaitingForPeer};

        assert!(NotStarted.can_transition_to(Running));
        assert!(Running.can_transition_to(WaitingForPeer));
        assert!(WaitingForPeer.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
    }

    #[test]
    fn completed_is_terminal() {
        use PartyState::{Completed, NotStarted, Running, WaitingForPeer};

        for next in [NotStarted, Running, WaitingForPeer, Completed] {
            assert!(!Completed.can_transition_to(next));
        }
    }

    #[test]
    fn no_shortcuts() {
        use PartyState::{Completed, NotStarted, Running, WaitingForPeer};

        assert!(!NotStarted.can_transition_to(WaitingForPeer));
        assert!(!NotStarted.can_transition_to(Completed));
        assert!(!WaitingForPeer.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn lane_starts_not_started() {
        let [lane, _] = Lane::pair();
        assert_eq!(lane.state(), PartyState::NotStarted);
        assert_eq!(lane.operations(), 0);
        assert_eq!(lane.failure_order(), None);
    }

    #[test]
    fn handoff_after_peer_departs_is_not_counted() {
        let [a, b] = Lane::pair();
        a.transition(PartyState::Running);
        b.depart();

        a.handoff();
        a.handoff();

        assert!(a.peer_departed());
        assert!(!b.peer_departed());
        assert_eq!(a.handoffs(), 0);
        assert_eq!(a.state(), PartyState::Running);
    }

    #[test]
    fn first_failure_keeps_lowest_stamp() {
        let [a, b] = Lane::pair();
        b.record_failure();
        a.record_failure();
        a.record_failure();

        assert_eq!(b.failure_order(), Some(0));
        assert_eq!(a.failure_order(), Some(1));
    }
}
