//! Transactional race scenarios for the tandem interleaving harness.
//!
//! Wraps [`tandem_core`]'s two-party scripts around an in-memory row store so
//! classic isolation and locking races can be replayed in an exact order.
//!
//! # Components
//!
//! - [`RowStore`]: keyed rows with isolation levels and blocking row locks
//! - [`TransactionalRunner`]: runs one party's steps inside a transaction
//! - [`expect_failure`]: turns an expected party failure into success
//! - [`Scenario`]: catalogue of scripted races with checked outcomes
//!
//! # Example
//!
//! ```no_run
//! use tandem_core::HarnessConfig;
//! use tandem_harness::Scenario;
//!
//! let outcome = Scenario::ParallelUpdate.run(&HarnessConfig::default())?;
//! assert!(outcome.passed());
//! # Ok::<(), tandem_harness::ScenarioError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod runner;
pub mod scenarios;
mod store;

pub use error::{RunnerError, ScenarioError, StoreError};
pub use runner::{TransactionalRunner, TxSlot, expect_failure, is_duplicate_key};
pub use scenarios::{DEFAULT_PING_PONG_ROUNDS, Expectation, Scenario, ScenarioOutcome};
pub use store::{DEFAULT_LOCK_TIMEOUT, Isolation, Row, RowId, RowStore, StoreConfig, Transaction, TxId};
