//! Step function for the rank kernel.
//! This is the single chokepoint for rank transitions.

use super::{command::Command, invariants::check_invariants, state::State, types::*};
use crate::types::ProtectionPolicy;
use std::cmp::Ordering;

/// Effects produced by a transition (data, not side effects).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Effects {
    pub transition: Transition,
}

/// Execute a transition: (state, command) -> Result<(new_state, effects), Error>
///
/// Invariants are checked pre and post. The protection counter is reset first when the
/// evaluated year is later than the counter's year.
pub fn step(
    state: &State,
    cmd: Command,
    policy: &ProtectionPolicy,
) -> Result<(State, Effects), Error> {
    let (post, effects) = match cmd {
        Command::Evaluate {
            qualified,
            year,
            advancement_allowed,
        } => {
            let mut pre = *state;
            if year > pre.protection_year {
                pre.protection_periods_used = 0;
                pre.protection_year = year;
            }
            check_invariants(&pre, policy)?;

            match qualified.cmp(&pre.rank) {
                Ordering::Greater if advancement_allowed => {
                    let post = State {
                        rank: qualified,
                        protection_periods_used: 0,
                        protection_year: pre.protection_year,
                    };
                    let transition = Transition::Promoted {
                        from: pre.rank,
                        to: qualified,
                    };
                    (post, Effects { transition })
                }
                Ordering::Greater => {
                    let transition = Transition::PromotionDeferred {
                        current: pre.rank,
                        qualified,
                    };
                    (pre, Effects { transition })
                }
                Ordering::Less if pre.protection_periods_used < policy.limit(pre.rank) => {
                    let used = pre
                        .protection_periods_used
                        .checked_add(1)
                        .ok_or(Error::Overflow)?;
                    let post = State {
                        protection_periods_used: used,
                        ..pre
                    };
                    let transition = Transition::Protected {
                        rank: pre.rank,
                        used,
                    };
                    (post, Effects { transition })
                }
                Ordering::Less => {
                    let post = State {
                        rank: qualified,
                        protection_periods_used: 0,
                        protection_year: pre.protection_year,
                    };
                    let transition = Transition::Demoted {
                        from: pre.rank,
                        to: qualified,
                    };
                    (post, Effects { transition })
                }
                Ordering::Equal => (pre, Effects::default()),
            }
        }
    };

    check_invariants(&post, policy)?;
    Ok((post, effects))
}
