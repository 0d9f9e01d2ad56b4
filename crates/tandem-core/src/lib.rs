//! Deterministic two-party interleaving harness.
//!
//! Scripts an exact execution order between two concurrent logical
//! transactions, so race-dependent behavior (dirty reads, lock blocking, lost
//! updates) can be asserted deterministically instead of by timing luck.
//!
//! # Components
//!
//! - [`StepLock`]: binary two-token handoff between exactly two contexts
//! - [`OrderWitness`]: after-the-fact proof that one point ran before another
//! - [`SequencedActionList`]: alternating script builder and its executor
//!
//! # Usage
//!
//! ```no_run
//! use tandem_core::{SequencedActionList, StepError};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! SequencedActionList::new()
//!     .add_for_a(|| -> Result<(), StepError> { Ok(()) })?
//!     .add_for_b(|| -> Result<(), StepError> { Ok(()) })?
//!     .add_for_a(|| -> Result<(), StepError> { Ok(()) })?
//!     .execute(|steps, _| steps.run_all(), |steps, _| steps.run_all())?;
//! # Ok(())
//! # }
//! ```
//!
//! Each executor receives its party's finalized [`Steps`] and runs them in
//! order on its own thread, inside whatever transactional context the party
//! stands for. That seam is the only contact with the code under test.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
mod party;
mod script;
mod step_lock;
mod steps;
mod witness;

pub use config::{DEFAULT_PROBE_DELAY, HarnessConfig};
pub use error::{HarnessError, SequenceViolation};
pub use party::{Party, PartyState};
pub use script::{ExecutionReport, SequencedActionList};
pub use step_lock::StepLock;
pub use steps::{PartyContext, Step, StepError, StepKind, Steps, TurnHandle};
pub use witness::OrderWitness;
