//! State struct for the rank kernel.

use crate::types::{Participant, Rank};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub rank: Rank,
    pub protection_periods_used: u32,
    /// Year the protection counter belongs to.
    pub protection_year: i32,
}

impl State {
    pub fn of(participant: &Participant) -> Self {
        Self {
            rank: participant.rank,
            protection_periods_used: participant.protection_periods_used,
            protection_year: participant.protection_year,
        }
    }
}
