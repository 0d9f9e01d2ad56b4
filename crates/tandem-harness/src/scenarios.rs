//! Catalogue of two-transaction race scenarios.
//!
//! Each scenario seeds a fresh [`RowStore`], scripts the exact interleaving
//! of two transactions and records what each side observed. The outcome
//! lists named expectations, each with the value actually observed, so a
//! failed scenario explains itself.
//!
//! Scenarios that expect one transaction to block on the other use a
//! blocking probe for the blocked side and an [`OrderWitness`] to prove,
//! after the fact, that the block really happened.

#![allow(clippy::disallowed_types, reason = "Journal shared between party threads")]

use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

use tandem_core::{ExecutionReport, HarnessConfig, OrderWitness, SequencedActionList, StepError};

use crate::{
    error::{ScenarioError, StoreError},
    runner::{TransactionalRunner, TxSlot, expect_failure, is_duplicate_key},
    store::{Isolation, Row, RowId, RowStore},
};

/// Rounds run by [`Scenario::PingPong`] when started from the catalogue.
pub const DEFAULT_PING_PONG_ROUNDS: usize = 5;

/// Row every scenario contends on.
const ROW: RowId = 1;

/// Headcount seeded for the locking scenarios.
const HEADCOUNT: i64 = 4;

/// Salary seeded for the parallel update scenario.
const SALARY: i64 = 5000;

/// Scenarios known to the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    /// Strict alternation without any store
    PingPong,
    /// Uncommitted insert visible to a read-uncommitted count
    DirtyRead,
    /// Read-committed re-read sees a committed update
    NonRepeatableRead,
    /// Repeatable-read re-read keeps its snapshot
    RepeatableRead,
    /// Concurrent increments serialize on the row lock
    ParallelUpdate,
    /// Shared lock blocks a later exclusive lock
    ShareThenUpdate,
    /// Exclusive lock blocks a later shared lock
    UpdateThenShare,
    /// Second insert of a key blocks, then fails
    DuplicateInsert,
    /// Inserts of different keys never block
    DisjointInserts,
}

impl Scenario {
    /// Every scenario, in catalogue order.
    pub const ALL: [Self; 9] = [
        Self::PingPong,
        Self::DirtyRead,
        Self::NonRepeatableRead,
        Self::RepeatableRead,
        Self::ParallelUpdate,
        Self::ShareThenUpdate,
        Self::UpdateThenShare,
        Self::DuplicateInsert,
        Self::DisjointInserts,
    ];

    /// Command-line name.
    pub fn name(self) -> &'static str {
        match self {
            Self::PingPong => "ping-pong",
            Self::DirtyRead => "dirty-read",
            Self::NonRepeatableRead => "non-repeatable-read",
            Self::RepeatableRead => "repeatable-read",
            Self::ParallelUpdate => "parallel-update",
            Self::ShareThenUpdate => "share-then-update",
            Self::UpdateThenShare => "update-then-share",
            Self::DuplicateInsert => "duplicate-insert",
            Self::DisjointInserts => "disjoint-inserts",
        }
    }

    /// One-line summary of what the scenario demonstrates.
    pub fn description(self) -> &'static str {
        match self {
            Self::PingPong => "two parties alternate strictly for a number of rounds",
            Self::DirtyRead => "a read-uncommitted count sees a row the peer has not committed",
            Self::NonRepeatableRead => "a read-committed re-read sees the peer's committed rename",
            Self::RepeatableRead => "a repeatable-read re-read keeps the first value",
            Self::ParallelUpdate => "the second increment waits for the first and no update is lost",
            Self::ShareThenUpdate => "a shared lock holds off an exclusive lock until commit",
            Self::UpdateThenShare => "an exclusive lock holds off a shared lock until commit",
            Self::DuplicateInsert => "a second insert of the same key waits, then fails",
            Self::DisjointInserts => "inserts of different keys proceed without waiting",
        }
    }

    /// Run the scenario.
    pub fn run(self, config: &HarnessConfig) -> Result<ScenarioOutcome, ScenarioError> {
        let _span = tracing::info_span!("scenario", name = self.name()).entered();
        tracing::info!(description = self.description(), "Running scenario");

        let outcome = match self {
            Self::PingPong => ping_pong(DEFAULT_PING_PONG_ROUNDS, config),
            Self::DirtyRead => dirty_read(config),
            Self::NonRepeatableRead => non_repeatable_read(config),
            Self::RepeatableRead => repeatable_read(config),
            Self::ParallelUpdate => parallel_update(config),
            Self::ShareThenUpdate => share_then_update(config),
            Self::UpdateThenShare => update_then_share(config),
            Self::DuplicateInsert => duplicate_insert(config),
            Self::DisjointInserts => disjoint_inserts(config),
        }?;

        if outcome.passed() {
            tracing::info!(operations = outcome.report.total_operations(), "Scenario passed");
        } else {
            for expectation in outcome.unmet() {
                tracing::warn!(%expectation, "Expectation not met");
            }
        }
        Ok(outcome)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A named expectation and what was actually observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    /// What should hold
    pub name: &'static str,
    /// Whether it held
    pub held: bool,
    /// Observed value, rendered for reporting
    pub observed: String,
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.held { "ok" } else { "FAILED" };
        write!(f, "[{mark}] {} (observed {})", self.name, self.observed)
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    /// Scenario that ran
    pub scenario: Scenario,
    /// Execution summary from the harness
    pub report: ExecutionReport,
    /// Expectations, in the order they were checked
    pub expectations: Vec<Expectation>,
}

impl ScenarioOutcome {
    fn new(scenario: Scenario, report: ExecutionReport) -> Self {
        Self { scenario, report, expectations: Vec::new() }
    }

    fn check(mut self, name: &'static str, held: bool, observed: impl fmt::Debug) -> Self {
        self.expectations.push(Expectation { name, held, observed: format!("{observed:?}") });
        self
    }

    /// True if every expectation held.
    pub fn passed(&self) -> bool {
        self.expectations.iter().all(|e| e.held)
    }

    /// Expectations that did not hold.
    pub fn unmet(&self) -> impl Iterator<Item = &Expectation> {
        self.expectations.iter().filter(|e| !e.held)
    }
}

impl fmt::Display for ScenarioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed() { "passed" } else { "FAILED" };
        writeln!(
            f,
            "{}: {verdict} ({} operations, {} probes)",
            self.scenario,
            self.report.total_operations(),
            self.report.probes_scheduled.iter().sum::<usize>()
        )?;
        for expectation in &self.expectations {
            writeln!(f, "  {expectation}")?;
        }
        Ok(())
    }
}

/// Append-only record shared by both parties.
#[derive(Debug)]
struct Journal<T> {
    entries: Mutex<Vec<T>>,
}

impl<T> Journal<T> {
    fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }

    fn record(&self, entry: T) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
    }

    fn into_entries(self) -> Vec<T> {
        self.entries.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

fn noop() -> Result<(), StepError> {
    Ok(())
}

/// Both parties append to a shared log, `rounds` times each.
pub fn ping_pong(rounds: usize, config: &HarnessConfig) -> Result<ScenarioOutcome, ScenarioError> {
    let log = Journal::new();
    let mut list = SequencedActionList::with_config(config.clone());
    for round in 0..rounds {
        let log = &log;
        list = list
            .add_for_a(move || {
                log.record(format!("ping {round}"));
                noop()
            })?
            .add_for_b(move || {
                log.record(format!("pong {round}"));
                noop()
            })?;
    }

    let report = list.execute(|steps, _| steps.run_all(), |steps, _| steps.run_all())?;

    let log = log.into_entries();
    let expected: Vec<String> =
        (0..rounds).flat_map(|round| [format!("ping {round}"), format!("pong {round}")]).collect();
    let operations = report.total_operations();

    Ok(ScenarioOutcome::new(Scenario::PingPong, report)
        .check("log alternates ping and pong", log == expected, &log)
        .check("every declared step ran once", operations == 2 * rounds, operations))
}

/// Count rows twice around a peer's insert that stays uncommitted until A is
/// done. Returns the two counts A saw.
pub fn count_while_inserting(
    isolation: Isolation,
    config: &HarnessConfig,
) -> Result<(Vec<usize>, ExecutionReport), ScenarioError> {
    let store = RowStore::new();
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());
    let counts = Journal::new();

    let count = || {
        slot_a.with(|tx| {
            counts.record(tx.count());
            Ok(())
        })
    };

    let runner_a = TransactionalRunner::new(store.clone(), isolation, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    let report = SequencedActionList::with_config(config.clone())
        .add_for_a(count)?
        .add_for_b(|| slot_b.with(|tx| tx.insert(ROW, Row::new("COMPANY 1", 0))))?
        .add_for_a(count)?
        // Keeps B's transaction open while A counts again
        .add_for_b(noop)?
        .execute(|steps, ctx| runner_a.run(steps, ctx), |steps, ctx| runner_b.run(steps, ctx))?;

    Ok((counts.into_entries(), report))
}

/// A read-uncommitted transaction counts a row its peer has not committed.
pub fn dirty_read(config: &HarnessConfig) -> Result<ScenarioOutcome, ScenarioError> {
    let (counts, report) = count_while_inserting(Isolation::ReadUncommitted, config)?;

    Ok(ScenarioOutcome::new(Scenario::DirtyRead, report)
        .check("first count sees an empty table", counts.first() == Some(&0), counts.first())
        .check("second count sees the uncommitted insert", counts.get(1) == Some(&1), counts.get(1)))
}

/// Read a row, let the peer rename and commit it, read it again. Returns
/// both names A saw.
pub fn read_twice(
    isolation: Isolation,
    config: &HarnessConfig,
) -> Result<(Vec<String>, ExecutionReport), ScenarioError> {
    let store = RowStore::new();
    store.seed(ROW, Row::new("COMPANY 1", HEADCOUNT));
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());
    let names = Journal::new();

    let read = || {
        slot_a.with(|tx| {
            let row = tx.select(ROW).ok_or(StoreError::RowNotFound { id: ROW })?;
            names.record(row.name);
            Ok(())
        })
    };

    let runner_a = TransactionalRunner::new(store.clone(), isolation, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    let report = SequencedActionList::with_config(config.clone())
        .add_for_a(read)?
        .add_for_b(|| slot_b.with(|tx| tx.update(ROW, |row| row.name = "ENTERPRISE".into())).map(drop))?
        .add_for_a(read)?
        .execute(|steps, ctx| runner_a.run(steps, ctx), |steps, ctx| runner_b.run(steps, ctx))?;

    Ok((names.into_entries(), report))
}

/// A read-committed re-read observes the peer's committed rename.
pub fn non_repeatable_read(config: &HarnessConfig) -> Result<ScenarioOutcome, ScenarioError> {
    let (names, report) = read_twice(Isolation::ReadCommitted, config)?;

    Ok(ScenarioOutcome::new(Scenario::NonRepeatableRead, report).check(
        "second read sees the committed rename",
        names == ["COMPANY 1", "ENTERPRISE"],
        &names,
    ))
}

/// A repeatable-read re-read keeps returning the first value.
pub fn repeatable_read(config: &HarnessConfig) -> Result<ScenarioOutcome, ScenarioError> {
    let (names, report) = read_twice(Isolation::RepeatableRead, config)?;

    Ok(ScenarioOutcome::new(Scenario::RepeatableRead, report).check(
        "second read keeps the original name",
        names == ["COMPANY 1", "COMPANY 1"],
        &names,
    ))
}

/// Two increments of the same row. The second blocks on the first's lock
/// and applies on top of its committed value.
pub fn parallel_update(config: &HarnessConfig) -> Result<ScenarioOutcome, ScenarioError> {
    let store = RowStore::new();
    store.seed(ROW, Row::new("EMPLOYEE 1", SALARY));
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());
    let witness = OrderWitness::new();

    let runner_a = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    let report = SequencedActionList::with_config(config.clone())
        .add_for_a(|| slot_a.with(|tx| tx.update(ROW, |row| row.value += 100)).map(drop))?
        .add_blocking_probe_for_b(|| {
            slot_b.with(|tx| tx.update(ROW, |row| row.value += 300))?;
            witness.mark_potential_block_point();
            Ok::<_, StoreError>(())
        })?
        .add_for_a(|| {
            witness.mark_ran_first();
            noop()
        })?
        .execute(|steps, ctx| runner_a.run(steps, ctx), |steps, ctx| runner_b.run(steps, ctx))?;

    let salary = store.get(ROW).map(|row| row.value);
    let ordered = witness.was_correct_order();
    Ok(ScenarioOutcome::new(Scenario::ParallelUpdate, report)
        .check("both increments applied", salary == Some(SALARY + 400), salary)
        .check("second update waited for the first commit", ordered, ordered))
}

/// A holds a shared lock while B asks for an exclusive one.
pub fn share_then_update(config: &HarnessConfig) -> Result<ScenarioOutcome, ScenarioError> {
    let store = RowStore::new();
    store.seed(ROW, Row::new("COMPANY 1", HEADCOUNT));
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());
    let witness = OrderWitness::new();
    let (counted, fired) = (Journal::new(), Journal::new());

    let runner_a = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    let report = SequencedActionList::with_config(config.clone())
        .add_for_a(|| {
            slot_a.with(|tx| {
                let row = tx.select_for_share(ROW)?.ok_or(StoreError::RowNotFound { id: ROW })?;
                counted.record(row.value);
                Ok(())
            })
        })?
        .add_blocking_probe_for_b(|| {
            slot_b.with(|tx| {
                let row = tx.select_for_update(ROW)?.ok_or(StoreError::RowNotFound { id: ROW })?;
                witness.mark_potential_block_point();
                tx.update(ROW, |row| row.value = 0)?;
                fired.record(row.value);
                Ok(())
            })
        })?
        .add_for_a(|| {
            witness.mark_ran_first();
            noop()
        })?
        .execute(|steps, ctx| runner_a.run(steps, ctx), |steps, ctx| runner_b.run(steps, ctx))?;

    let (counted, fired) = (counted.into_entries(), fired.into_entries());
    let remaining = store.get(ROW).map(|row| row.value);
    let ordered = witness.was_correct_order();
    Ok(ScenarioOutcome::new(Scenario::ShareThenUpdate, report)
        .check("shared reader saw the full headcount", counted == [HEADCOUNT], &counted)
        .check("exclusive writer removed the full headcount", fired == [HEADCOUNT], &fired)
        .check("headcount is zero afterwards", remaining == Some(0), remaining)
        .check("exclusive lock waited for the shared lock", ordered, ordered))
}

/// A holds an exclusive lock and writes while B asks for a shared one.
pub fn update_then_share(config: &HarnessConfig) -> Result<ScenarioOutcome, ScenarioError> {
    let store = RowStore::new();
    store.seed(ROW, Row::new("COMPANY 1", HEADCOUNT));
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());
    let witness = OrderWitness::new();
    let (fired, counted) = (Journal::new(), Journal::new());

    let runner_a = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    let report = SequencedActionList::with_config(config.clone())
        .add_for_a(|| {
            slot_a.with(|tx| {
                let row = tx.select_for_update(ROW)?.ok_or(StoreError::RowNotFound { id: ROW })?;
                tx.update(ROW, |row| row.value = 0)?;
                fired.record(row.value);
                Ok(())
            })
        })?
        .add_blocking_probe_for_b(|| {
            slot_b.with(|tx| {
                let row = tx.select_for_share(ROW)?.ok_or(StoreError::RowNotFound { id: ROW })?;
                witness.mark_potential_block_point();
                counted.record(row.value);
                Ok(())
            })
        })?
        .add_for_a(|| {
            witness.mark_ran_first();
            noop()
        })?
        .execute(|steps, ctx| runner_a.run(steps, ctx), |steps, ctx| runner_b.run(steps, ctx))?;

    let (fired, counted) = (fired.into_entries(), counted.into_entries());
    let ordered = witness.was_correct_order();
    Ok(ScenarioOutcome::new(Scenario::UpdateThenShare, report)
        .check("exclusive writer removed the full headcount", fired == [HEADCOUNT], &fired)
        .check("shared reader saw the committed write", counted == [0], &counted)
        .check("shared lock waited for the exclusive lock", ordered, ordered))
}

/// Both parties insert the same key. B waits for A to commit, then fails
/// with a duplicate key, which its runner expects.
pub fn duplicate_insert(config: &HarnessConfig) -> Result<ScenarioOutcome, ScenarioError> {
    let store = RowStore::new();
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());
    let witness = OrderWitness::new();

    let runner_a = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    let report = SequencedActionList::with_config(config.clone())
        .add_for_a(|| slot_a.with(|tx| tx.insert(ROW, Row::new("COMPANY 1", 0))))?
        .add_blocking_probe_for_b(|| {
            let inserted = slot_b.with(|tx| tx.insert(ROW, Row::new("COMPANY 2", 0)));
            witness.mark_potential_block_point();
            inserted
        })?
        .add_for_a(|| {
            witness.mark_ran_first();
            noop()
        })?
        .execute(
            |steps, ctx| runner_a.run(steps, ctx),
            expect_failure(|steps, ctx| runner_b.run(steps, ctx), is_duplicate_key),
        )?;

    let name = store.get(ROW).map(|row| row.name);
    let rows = store.len();
    let ordered = witness.was_correct_order();
    Ok(ScenarioOutcome::new(Scenario::DuplicateInsert, report)
        .check("only the first insert committed", rows == 1, rows)
        .check("committed row is A's", name.as_deref() == Some("COMPANY 1"), &name)
        .check("second insert waited for the first commit", ordered, ordered))
}

/// Both parties insert different keys. Nothing blocks and both commit.
pub fn disjoint_inserts(config: &HarnessConfig) -> Result<ScenarioOutcome, ScenarioError> {
    let store = RowStore::new();
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());

    let runner_a = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    let report = SequencedActionList::with_config(config.clone())
        .add_for_a(|| slot_a.with(|tx| tx.insert(ROW, Row::new("COMPANY 1", 0))))?
        .add_for_b(|| slot_b.with(|tx| tx.insert(ROW + 1, Row::new("COMPANY 2", 0))))?
        .add_for_a(noop)?
        .execute(|steps, ctx| runner_a.run(steps, ctx), |steps, ctx| runner_b.run(steps, ctx))?;

    let rows = store.len();
    let names: Vec<_> = [ROW, ROW + 1].into_iter().filter_map(|id| store.get(id)).map(|row| row.name).collect();
    Ok(ScenarioOutcome::new(Scenario::DisjointInserts, report)
        .check("both inserts committed", rows == 2, rows)
        .check("each party's row kept its name", names == ["COMPANY 1", "COMPANY 2"], &names))
}
