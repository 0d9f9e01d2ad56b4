//! Error types for the interleaving harness.
//!
//! Build-time sequencing errors are kept apart from run-time failures: a
//! [`SequenceViolation`] is raised before any thread is spawned, so nothing
//! has executed when it is returned.

use std::io;

use thiserror::Error;

use crate::{party::Party, steps::StepError};

/// Alternation broken while declaring a script.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceViolation {
    /// Script opened by a party other than A
    #[error("party {party} cannot open the script: party A declares the first step")]
    OpeningParty {
        /// Party that tried to open
        party: Party,
    },

    /// Two consecutive steps declared for the same party
    #[error("step {position} repeats party {party}: steps must alternate")]
    ConsecutiveSteps {
        /// Party declared twice in a row
        party: Party,
        /// Zero-based position the rejected step would have taken
        position: usize,
    },
}

/// Errors returned by [`SequencedActionList::execute`](crate::SequencedActionList::execute).
///
/// `Sequence` is only produced by conversion: the builder itself returns
/// [`SequenceViolation`], and `?` lifts it here so a caller can declare and
/// execute a script under one error type.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Script rejected while it was declared. Never returned by `execute`.
    #[error(transparent)]
    Sequence(#[from] SequenceViolation),

    /// An operation or executor returned an error
    #[error("party {party} failed: {source}")]
    Execution {
        /// Failing party
        party: Party,
        /// Error raised by the operation or executor
        source: StepError,
    },

    /// A party's context panicked
    #[error("party {party} panicked: {message}")]
    Panicked {
        /// Panicking party
        party: Party,
        /// Panic payload, if it was a string
        message: String,
    },

    /// A party's context could not be spawned
    #[error("failed to spawn context for party {party}: {source}")]
    Spawn {
        /// Party whose thread failed to start
        party: Party,
        /// Underlying OS error
        source: io::Error,
    },
}

impl HarnessError {
    /// Party that failed, if the error happened at run time.
    pub fn party(&self) -> Option<Party> {
        match self {
            Self::Sequence(_) => None,
            Self::Execution { party, .. } | Self::Panicked { party, .. } | Self::Spawn { party, .. } => {
                Some(*party)
            },
        }
    }

    /// Returns true if the script was rejected before anything ran.
    pub fn is_sequence_violation(&self) -> bool {
        matches!(self, Self::Sequence(_))
    }
}
