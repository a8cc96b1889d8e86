//! Error and transition types for the rank kernel.

use crate::types::Rank;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    InvariantViolation(&'static str),
    Overflow,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvariantViolation(id) => write!(f, "Invariant violated: {id}"),
            Error::Overflow => write!(f, "Arithmetic overflow"),
        }
    }
}

impl std::error::Error for Error {}

/// Observable outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transition {
    Promoted {
        from: Rank,
        to: Rank,
    },
    Demoted {
        from: Rank,
        to: Rank,
    },
    /// Demotion absorbed by a protection period; `used` is the counter after the step.
    Protected {
        rank: Rank,
        used: u32,
    },
    /// Qualified above the current rank while advancement is restricted.
    PromotionDeferred {
        current: Rank,
        qualified: Rank,
    },
    #[default]
    Unchanged,
}
