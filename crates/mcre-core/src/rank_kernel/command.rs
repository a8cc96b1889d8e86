//! Commands for the rank kernel.

use crate::types::Rank;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Apply one period's qualification result.
    Evaluate {
        qualified: Rank,
        /// Year of the evaluated period.
        year: i32,
        /// False while the participant's cooling-off window is active.
        advancement_allowed: bool,
    },
}
