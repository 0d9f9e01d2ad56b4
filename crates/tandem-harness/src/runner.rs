//! Party runners that wrap a step list in a store transaction.
//!
//! Scripted operations are built before any transaction exists, so they
//! reach their party's transaction through a [`TxSlot`] they capture by
//! reference. [`TransactionalRunner`] opens the transaction, installs it in
//! the slot, runs the steps and then commits or rolls back.
//!
//! ```text
//!   slot_a ◄── ops of A            slot_b ◄── ops of B
//!     ▲                              ▲
//!   runner A: begin ─ run ─ commit   runner B: begin ─ run ─ commit
//! ```

#![allow(clippy::disallowed_types, reason = "Slot handed between a runner and its own operations")]

use std::sync::{Mutex, MutexGuard, PoisonError};

use tandem_core::{PartyContext, StepError, Steps};

use crate::{
    error::{RunnerError, StoreError},
    store::{Isolation, RowStore, Transaction},
};

/// Holder for the active transaction of one party.
///
/// Empty until a runner installs a transaction, and again after it ends.
#[derive(Debug, Default)]
pub struct TxSlot {
    tx: Mutex<Option<Transaction>>,
}

impl TxSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the active transaction.
    ///
    /// Fails with `TransactionClosed` if no transaction is installed.
    pub fn with<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Transaction) -> Result<T, StoreError>,
    {
        let mut guard = self.lock();
        let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        f(tx)
    }

    /// Returns true if a transaction is installed.
    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    fn install(&self, tx: Transaction) {
        *self.lock() = Some(tx);
    }

    fn take(&self) -> Option<Transaction> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Transaction>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs one party's steps inside a store transaction.
///
/// Commits if every step succeeds, rolls back otherwise. Pass it to
/// `execute` as `|steps, ctx| runner.run(steps, ctx)`.
#[derive(Debug, Clone)]
pub struct TransactionalRunner<'s> {
    store: RowStore,
    isolation: Isolation,
    slot: &'s TxSlot,
}

impl<'s> TransactionalRunner<'s> {
    /// Create a runner that installs its transaction in `slot`.
    pub fn new(store: RowStore, isolation: Isolation, slot: &'s TxSlot) -> Self {
        Self { store, isolation, slot }
    }

    /// Isolation level of the transactions this runner opens.
    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Open a transaction, run every step, then commit or roll back.
    pub fn run(self, steps: Steps<'_>, ctx: &PartyContext) -> Result<(), StepError> {
        let tx = self.store.begin(self.isolation);
        let tx_id = tx.id();
        self.slot.install(tx);
        tracing::debug!(party = %ctx.party(), tx = tx_id, isolation = ?self.isolation, "Transaction bound");

        let result = steps.run_all();

        if let Some(tx) = self.slot.take() {
            match &result {
                Ok(()) => tx.commit(),
                Err(e) => {
                    tracing::debug!(party = %ctx.party(), tx = tx_id, error = %e, "Rolling back");
                    tx.rollback();
                },
            }
        }
        result
    }
}

/// Wrap a runner so a failure matching `expected` counts as success.
///
/// A failure that does not match is returned unchanged. Running to
/// completion is itself a failure: `RunnerError::UnexpectedSuccess`.
pub fn expect_failure<'a, R, P>(
    run: R,
    expected: P,
) -> impl FnOnce(Steps<'a>, &PartyContext) -> Result<(), StepError> + Send
where
    R: FnOnce(Steps<'a>, &PartyContext) -> Result<(), StepError> + Send,
    P: FnOnce(&StepError) -> bool + Send,
{
    move |steps: Steps<'a>, ctx: &PartyContext| {
        let Err(e) = run(steps, ctx) else {
            return Err(RunnerError::UnexpectedSuccess { party: ctx.party() }.into());
        };

        if expected(&e) {
            tracing::info!(party = %ctx.party(), error = %e, "Expected failure observed");
            Ok(())
        } else {
            Err(e)
        }
    }
}

/// Predicate for [`expect_failure`] matching a store duplicate key error.
pub fn is_duplicate_key(err: &StepError) -> bool {
    err.downcast_ref::<StoreError>().is_some_and(StoreError::is_duplicate_key)
}
