//! Error types for the row store and the scenario catalogue.

use std::time::Duration;

use tandem_core::{HarnessError, Party, SequenceViolation};
use thiserror::Error;

use crate::store::RowId;

/// Errors returned by [`RowStore`](crate::RowStore) transactions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Row id already committed, or pending in this transaction
    #[error("duplicate key: row {id} already exists")]
    DuplicateKey {
        /// Conflicting row id
        id: RowId,
    },

    /// Row does not exist for this transaction
    #[error("row {id} not found")]
    RowNotFound {
        /// Missing row id
        id: RowId,
    },

    /// No open transaction behind the handle
    #[error("transaction is closed")]
    TransactionClosed,

    /// A row lock could not be acquired in time
    #[error("timed out after {waited:?} waiting for lock on row {id}")]
    LockTimeout {
        /// Contended row id
        id: RowId,
        /// How long the request waited
        waited: Duration,
    },
}

impl StoreError {
    /// Returns true if the error is a duplicate key violation.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

/// Errors produced by harness runners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    /// A party expected to fail ran to completion
    #[error("party {party} was expected to fail but succeeded")]
    UnexpectedSuccess {
        /// Party that succeeded
        party: Party,
    },
}

/// Errors returned when running a scenario.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// Scenario script was malformed
    #[error(transparent)]
    Sequence(#[from] SequenceViolation),

    /// Script execution failed
    #[error(transparent)]
    Harness(#[from] HarnessError),

    /// Store setup or final verification failed
    #[error(transparent)]
    Store(#[from] StoreError),
}
