//! Finalized per-party step lists handed to executors.
//!
//! An executor (the `run` function given to
//! [`SequencedActionList::execute`](crate::SequencedActionList::execute))
//! receives one [`Steps`] list and a [`PartyContext`]. It must run every
//! step, in order, on the calling thread, inside whatever transactional
//! context that party represents. [`Steps::run_all`] is the plain loop.

use std::{sync::Arc, time::Duration};

use crate::party::{Lane, Party, PartyState};

/// Error returned by a scripted operation or an executor.
pub type StepError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) type Operation<'a> = Box<dyn FnOnce() -> Result<(), StepError> + Send + 'a>;

pub(crate) type HandleOperation<'a> =
    Box<dyn FnOnce(&TurnHandle<'_>) -> Result<(), StepError> + Send + 'a>;

/// What a step does when run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// User operation
    Operation,
    /// Yield to the peer and wait to be handed back
    Handoff,
    /// Wait for the first turn (party B only, always first)
    AwaitTurn,
    /// Schedule a deferred signal to the peer
    Probe,
}

pub(crate) enum Action<'a> {
    Operation(Operation<'a>),
    WithHandle(HandleOperation<'a>),
    Handoff,
    AwaitTurn,
    Probe { delay: Duration },
}

impl Action<'_> {
    fn kind(&self) -> StepKind {
        match self {
            Self::Operation(_) | Self::WithHandle(_) => StepKind::Operation,
            Self::Handoff => StepKind::Handoff,
            Self::AwaitTurn => StepKind::AwaitTurn,
            Self::Probe { .. } => StepKind::Probe,
        }
    }
}

/// One entry of a party's finalized list.
pub struct Step<'a> {
    action: Action<'a>,
    lane: Arc<Lane>,
}

impl std::fmt::Debug for Step<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("party", &self.lane.party()).field("kind", &self.kind()).finish()
    }
}

impl<'a> Step<'a> {
    pub(crate) fn new(action: Action<'a>, lane: Arc<Lane>) -> Self {
        Self { action, lane }
    }

    /// Party this step belongs to.
    pub fn party(&self) -> Party {
        self.lane.party()
    }

    /// What this step does.
    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }

    /// Run the step synchronously on the calling thread.
    ///
    /// Markers block as the handoff protocol requires; operations run the
    /// user callable and return its result.
    pub fn run(self) -> Result<(), StepError> {
        let lane = &self.lane;
        match self.action {
            Action::Operation(op) => {
                let index = lane.record_operation();
                tracing::debug!(party = %lane.party(), step = index, "Running operation");
                op()
            },
            Action::WithHandle(op) => {
                let index = lane.record_operation();
                tracing::debug!(party = %lane.party(), step = index, "Running operation with handle");
                op(&TurnHandle { lane: lane.as_ref() })
            },
            Action::Handoff => {
                lane.handoff();
                Ok(())
            },
            Action::AwaitTurn => {
                lane.await_turn();
                Ok(())
            },
            Action::Probe { delay } => {
                lane.record_probe();
                tracing::debug!(
                    party = %lane.party(),
                    delay_ms = delay.as_millis(),
                    "Scheduling blocking probe"
                );
                lane.lock().deferred_signal(lane.party().other(), delay)?;
                Ok(())
            },
        }
    }
}

/// Handle given to handle-based operations.
///
/// Lets the operation yield to the peer mid-step and resume when handed back.
#[derive(Debug)]
pub struct TurnHandle<'l> {
    lane: &'l Lane,
}

impl TurnHandle<'_> {
    /// Signal the peer, then block until it hands the turn back.
    pub fn next(&self) {
        tracing::debug!(party = %self.lane.party(), "Early handoff");
        self.lane.handoff();
    }

    /// Party running this operation.
    pub fn party(&self) -> Party {
        self.lane.party()
    }
}

/// Finalized, ordered list of one party's steps.
#[derive(Debug)]
pub struct Steps<'a> {
    party: Party,
    steps: Vec<Step<'a>>,
}

impl<'a> Steps<'a> {
    pub(crate) fn new(party: Party, steps: Vec<Step<'a>>) -> Self {
        Self { party, steps }
    }

    /// Party owning this list.
    pub fn party(&self) -> Party {
        self.party
    }

    /// Number of entries, markers included.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of user operations in the list.
    pub fn operation_count(&self) -> usize {
        self.steps.iter().filter(|s| s.kind() == StepKind::Operation).count()
    }

    /// Kinds of every entry, in order.
    pub fn kinds(&self) -> Vec<StepKind> {
        self.steps.iter().map(Step::kind).collect()
    }

    /// Run every step in order, stopping at the first failure.
    pub fn run_all(self) -> Result<(), StepError> {
        for step in self {
            step.run()?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for Steps<'a> {
    type Item = Step<'a>;
    type IntoIter = std::vec::IntoIter<Step<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.into_iter()
    }
}

/// Context injected into each party's executor.
#[derive(Debug)]
pub struct PartyContext {
    lane: Arc<Lane>,
    span: tracing::Span,
}

impl PartyContext {
    pub(crate) fn new(lane: Arc<Lane>) -> Self {
        let span = tracing::info_span!("party", party = %lane.party());
        Self { lane, span }
    }

    /// Party this context drives.
    pub fn party(&self) -> Party {
        self.lane.party()
    }

    /// Current lifecycle state of the party.
    pub fn state(&self) -> PartyState {
        self.lane.state()
    }

    /// Span covering the party's execution. Enter it from helper threads to
    /// keep their logs attributed.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}
