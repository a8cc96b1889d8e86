//! Invariant checker for the rank kernel.

use super::{state::State, types::*};
use crate::types::ProtectionPolicy;

/// Check all invariants. Returns Err if any violated.
pub fn check_invariants(state: &State, policy: &ProtectionPolicy) -> Result<(), Error> {
    // ProtectionWithinLimit
    if state.protection_periods_used > policy.limit(state.rank) {
        return Err(Error::InvariantViolation("ProtectionWithinLimit"));
    }

    Ok(())
}
