//! Alternating two-party script builder and its executor.
//!
//! A script is declared as a strictly alternating chain of operations, A
//! first. Each declared step is followed by a handoff marker, so after a
//! step the turn passes to the peer. [`SequencedActionList::execute`] splits
//! the chain into one list per party, runs both lists on their own threads
//! and joins them.
//!
//! # Freezing
//!
//! ```text
//! declared:   A:a1   B:b1   A:a2
//!
//! party A:    a1  handoff  a2  [handoff dropped]
//! party B:    await-turn  b1  [handoff dropped]
//! ```
//!
//! When either party's context finishes, it departs: the step lock is
//! terminated so the peer is never left waiting on a turn nobody will grant,
//! and the peer's later handoffs return at once.
//!
//! # Limitations
//!
//! An operation that blocks forever on something only the peer can release,
//! while the peer waits for its turn, deadlocks the scenario. The only
//! mitigation is a blocking probe (see
//! [`SequencedActionList::add_blocking_probe_for_b`]).

use std::{any::Any, sync::Arc, thread};

use crate::{
    config::HarnessConfig,
    error::{HarnessError, SequenceViolation},
    party::{Lane, Party, PartyState},
    steps::{Action, HandleOperation, Operation, PartyContext, Step, StepError, Steps, TurnHandle},
};

/// How a declared step is run.
enum Body<'a> {
    Plain(Operation<'a>),
    WithHandle(HandleOperation<'a>),
}

/// One declared step.
struct Command<'a> {
    party: Party,
    body: Body<'a>,
    probe: bool,
}

/// Summary of a finished execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Operations run by each party, indexed A then B
    pub operations_run: [usize; 2],
    /// Handoffs that waited on the peer, early handoffs included. Handoffs
    /// skipped because the peer had already departed are not counted.
    pub handoffs: [usize; 2],
    /// Blocking probes scheduled by each party
    pub probes_scheduled: [usize; 2],
    /// Final state of each party
    pub final_states: [PartyState; 2],
}

impl ExecutionReport {
    /// Operations run by `party`.
    pub fn operations_for(&self, party: Party) -> usize {
        self.operations_run[index(party)]
    }

    /// Total operations run by both parties.
    pub fn total_operations(&self) -> usize {
        self.operations_run.iter().sum()
    }
}

const fn index(party: Party) -> usize {
    match party {
        Party::A => 0,
        Party::B => 1,
    }
}

/// Builder for an alternating two-party script.
///
/// Consumed by [`Self::execute`], so a script runs at most once and cannot
/// be extended after it ran.
pub struct SequencedActionList<'a> {
    commands: Vec<Command<'a>>,
    turn: Option<Party>,
    config: HarnessConfig,
}

impl Default for SequencedActionList<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SequencedActionList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencedActionList")
            .field("steps", &self.commands.len())
            .field("turn", &self.turn)
            .field("config", &self.config)
            .finish()
    }
}

impl<'a> SequencedActionList<'a> {
    /// Create an empty script with default configuration.
    pub fn new() -> Self {
        Self::with_config(HarnessConfig::default())
    }

    /// Create an empty script.
    pub fn with_config(config: HarnessConfig) -> Self {
        Self { commands: Vec::new(), turn: None, config }
    }

    /// Number of declared steps.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True if no step has been declared.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Party that declared the last step, if any.
    pub fn current_turn(&self) -> Option<Party> {
        self.turn
    }

    /// Append an operation for A.
    pub fn add_for_a<F, E>(self, op: F) -> Result<Self, SequenceViolation>
    where
        F: FnOnce() -> Result<(), E> + Send + 'a,
        E: Into<StepError>,
    {
        self.push(Party::A, plain(op), false)
    }

    /// Append an operation for B.
    pub fn add_for_b<F, E>(self, op: F) -> Result<Self, SequenceViolation>
    where
        F: FnOnce() -> Result<(), E> + Send + 'a,
        E: Into<StepError>,
    {
        self.push(Party::B, plain(op), false)
    }

    /// Append an operation for A that may yield mid-step through
    /// [`TurnHandle::next`].
    pub fn add_for_a_with_handle<F, E>(self, op: F) -> Result<Self, SequenceViolation>
    where
        F: FnOnce(&TurnHandle<'_>) -> Result<(), E> + Send + 'a,
        E: Into<StepError>,
    {
        self.push(Party::A, with_handle(op), false)
    }

    /// Append an operation for B that may yield mid-step through
    /// [`TurnHandle::next`].
    pub fn add_for_b_with_handle<F, E>(self, op: F) -> Result<Self, SequenceViolation>
    where
        F: FnOnce(&TurnHandle<'_>) -> Result<(), E> + Send + 'a,
        E: Into<StepError>,
    {
        self.push(Party::B, with_handle(op), false)
    }

    /// Append an operation for A that is expected to block on a resource B
    /// holds.
    ///
    /// Before `op` runs, B is signalled from a background timer after the
    /// configured probe delay, so B can go on and release the resource even
    /// though A never reached its handoff.
    pub fn add_blocking_probe_for_a<F, E>(self, op: F) -> Result<Self, SequenceViolation>
    where
        F: FnOnce() -> Result<(), E> + Send + 'a,
        E: Into<StepError>,
    {
        self.push(Party::A, plain(op), true)
    }

    /// Append an operation for B that is expected to block on a resource A
    /// holds.
    ///
    /// Before `op` runs, A is signalled from a background timer after the
    /// configured probe delay.
    pub fn add_blocking_probe_for_b<F, E>(self, op: F) -> Result<Self, SequenceViolation>
    where
        F: FnOnce() -> Result<(), E> + Send + 'a,
        E: Into<StepError>,
    {
        self.push(Party::B, plain(op), true)
    }

    /// Append a step for `party`.
    pub fn add<F, E>(self, party: Party, op: F) -> Result<Self, SequenceViolation>
    where
        F: FnOnce() -> Result<(), E> + Send + 'a,
        E: Into<StepError>,
    {
        self.push(party, plain(op), false)
    }

    fn push(mut self, party: Party, body: Body<'a>, probe: bool) -> Result<Self, SequenceViolation> {
        let position = self.commands.len();
        match self.turn {
            None if party != Party::A => return Err(SequenceViolation::OpeningParty { party }),
            Some(last) if last == party => {
                return Err(SequenceViolation::ConsecutiveSteps { party, position });
            },
            _ => {},
        }

        self.turn = Some(party);
        self.commands.push(Command { party, body, probe });
        Ok(self)
    }

    /// Split the script into each party's finalized list.
    fn freeze(self, lanes: &[Arc<Lane>; 2]) -> (Steps<'a>, Steps<'a>, HarnessConfig) {
        let [lane_a, lane_b] = lanes;
        let mut list_a = Vec::new();
        let mut list_b = vec![Step::new(Action::AwaitTurn, Arc::clone(lane_b))];

        for command in self.commands {
            let (list, lane) = match command.party {
                Party::A => (&mut list_a, lane_a),
                Party::B => (&mut list_b, lane_b),
            };

            if command.probe {
                list.push(Step::new(Action::Probe { delay: self.config.probe_delay }, Arc::clone(lane)));
            }

            let action = match command.body {
                Body::Plain(op) => Action::Operation(op),
                Body::WithHandle(op) => Action::WithHandle(op),
            };
            list.push(Step::new(action, Arc::clone(lane)));
            list.push(Step::new(Action::Handoff, Arc::clone(lane)));
        }

        for list in [&mut list_a, &mut list_b] {
            if list.last().is_some_and(|s| s.kind() == crate::StepKind::Handoff) {
                list.pop();
            }
        }

        (Steps::new(Party::A, list_a), Steps::new(Party::B, list_b), self.config)
    }

    /// Run both parties concurrently and wait for both to finish.
    ///
    /// `run_a` and `run_b` each receive their party's finalized list and
    /// must run it in order on the calling thread. Both contexts are always
    /// joined before returning. If both fail, the failure that happened first
    /// is reported; A's wins only if the order cannot be told apart.
    ///
    /// If A's thread cannot be started, B is never started either.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Execution` if an operation or executor returned an
    ///   error
    /// - `HarnessError::Panicked` if a party's context panicked
    /// - `HarnessError::Spawn` if a context thread could not be started
    ///
    /// `HarnessError::Sequence` is never returned from here: the builder
    /// rejects a script before it can be executed.
    pub fn execute<RA, RB, EA, EB>(self, run_a: RA, run_b: RB) -> Result<ExecutionReport, HarnessError>
    where
        RA: FnOnce(Steps<'a>, &PartyContext) -> Result<(), EA> + Send,
        RB: FnOnce(Steps<'a>, &PartyContext) -> Result<(), EB> + Send,
        EA: Into<StepError>,
        EB: Into<StepError>,
    {
        let lanes = Lane::pair();
        let declared = self.commands.len();
        let (steps_a, steps_b, config) = self.freeze(&lanes);

        tracing::info!(
            declared,
            steps_a = steps_a.len(),
            steps_b = steps_b.len(),
            probe_delay_ms = config.probe_delay.as_millis(),
            "Executing script"
        );

        let [lane_a, lane_b] = &lanes;
        let (outcome_a, outcome_b) = thread::scope(|scope| {
            let handle_a = match spawn(scope, lane_a, || run_party(steps_a, Arc::clone(lane_a), run_a)) {
                Ok(handle) => handle,
                // B would run its steps with nobody to alternate with.
                Err(err) => return (Err(err), Ok(())),
            };
            let handle_b = spawn(scope, lane_b, || run_party(steps_b, Arc::clone(lane_b), run_b));
            if handle_b.is_err() {
                lane_b.depart();
            }

            (join(Party::A, handle_a), handle_b.and_then(|handle| join(Party::B, handle)))
        });

        let report = ExecutionReport {
            operations_run: [lane_a.operations(), lane_b.operations()],
            handoffs: [lane_a.handoffs(), lane_b.handoffs()],
            probes_scheduled: [lane_a.probes(), lane_b.probes()],
            final_states: [lane_a.state(), lane_b.state()],
        };

        let err = match (outcome_a, outcome_b) {
            (Ok(()), Ok(())) => {
                tracing::info!(operations = report.total_operations(), "Script finished");
                return Ok(report);
            },
            (Err(err), Ok(())) | (Ok(()), Err(err)) => err,
            (Err(err_a), Err(err_b)) => {
                if failed_before(lane_b, lane_a) {
                    tracing::debug!(hidden = %err_a, "B failed first");
                    err_b
                } else {
                    tracing::debug!(hidden = %err_b, "A failed first");
                    err_a
                }
            },
        };

        tracing::error!(party = ?err.party(), error = %err, "Script failed");
        Err(err)
    }
}

fn plain<'a, F, E>(op: F) -> Body<'a>
where
    F: FnOnce() -> Result<(), E> + Send + 'a,
    E: Into<StepError>,
{
    Body::Plain(Box::new(move || op().map_err(Into::into)))
}

fn with_handle<'a, F, E>(op: F) -> Body<'a>
where
    F: FnOnce(&TurnHandle<'_>) -> Result<(), E> + Send + 'a,
    E: Into<StepError>,
{
    Body::WithHandle(Box::new(move |handle: &TurnHandle<'_>| op(handle).map_err(Into::into)))
}

/// True if `first` has a failure stamp strictly older than `second`'s.
fn failed_before(first: &Lane, second: &Lane) -> bool {
    matches!((first.failure_order(), second.failure_order()), (Some(f), Some(s)) if f < s)
}

/// Marks the party completed and releases the peer, even on panic.
///
/// A panic is stamped as a failure before the peer is released.
struct CompleteOnExit<'l> {
    lane: &'l Lane,
}

impl Drop for CompleteOnExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.lane.record_failure();
        }
        self.lane.transition(PartyState::Completed);
        self.lane.depart();
    }
}

fn run_party<'a, R, E>(steps: Steps<'a>, lane: Arc<Lane>, run: R) -> Result<(), StepError>
where
    R: FnOnce(Steps<'a>, &PartyContext) -> Result<(), E>,
    E: Into<StepError>,
{
    let _complete = CompleteOnExit { lane: &lane };
    let ctx = PartyContext::new(Arc::clone(&lane));
    let _entered = ctx.span().enter();

    lane.transition(PartyState::Running);
    tracing::debug!(steps = steps.len(), "Party started");

    let result = run(steps, &ctx).map_err(Into::into);
    match &result {
        Ok(()) => tracing::debug!(operations = lane.operations(), "Party finished"),
        Err(e) => {
            lane.record_failure();
            tracing::error!(error = %e, "Party failed");
        },
    }
    result
}

type PartyHandle<'scope> = thread::ScopedJoinHandle<'scope, Result<(), StepError>>;

fn spawn<'scope, 'env, F>(
    scope: &'scope thread::Scope<'scope, 'env>,
    lane: &Lane,
    body: F,
) -> Result<PartyHandle<'scope>, HarnessError>
where
    F: FnOnce() -> Result<(), StepError> + Send + 'scope,
{
    let party = lane.party();
    let name = match party {
        Party::A => "tandem-party-a",
        Party::B => "tandem-party-b",
    };
    thread::Builder::new().name(name.to_string()).spawn_scoped(scope, body).map_err(|source| {
        lane.record_failure();
        HarnessError::Spawn { party, source }
    })
}

fn join(party: Party, handle: PartyHandle<'_>) -> Result<(), HarnessError> {
    match handle.join() {
        Ok(result) => result.map_err(|source| HarnessError::Execution { party, source }),
        Err(payload) => Err(HarnessError::Panicked { party, message: panic_message(payload.as_ref()) }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
