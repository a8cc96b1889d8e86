//! Plan earnings ceiling.
//!
//! Reaching the cap is a normal outcome: the amount is clamped to the remaining headroom
//! and the entry is still recorded.

use crate::types::{EarningsUpdate, Participant, ParticipantId};
use rust_decimal::Decimal;
use tracing::info;

/// Earnings state of one participant against its plan cap.
#[derive(Clone, Debug, PartialEq)]
pub struct EarningsAccount {
    pub participant: ParticipantId,
    /// `None` when uncapped (no plan, or a plan without a ceiling).
    pub plan_cap: Option<Decimal>,
    pub current_plan_earnings: Decimal,
    pub earnings_cap_reached: bool,
    pub cap_warning_sent: bool,
}

impl EarningsAccount {
    pub fn of(participant: &Participant, plan_cap: Option<Decimal>) -> Self {
        Self {
            participant: participant.id,
            plan_cap,
            current_plan_earnings: participant.current_plan_earnings,
            earnings_cap_reached: participant.earnings_cap_reached,
            cap_warning_sent: participant.cap_warning_sent,
        }
    }

    pub fn headroom(&self) -> Option<Decimal> {
        self.plan_cap
            .map(|cap| (cap - self.current_plan_earnings).max(Decimal::ZERO))
    }

    pub fn to_update(&self) -> EarningsUpdate {
        EarningsUpdate {
            participant: self.participant,
            current_plan_earnings: self.current_plan_earnings,
            earnings_cap_reached: self.earnings_cap_reached,
            cap_warning_sent: self.cap_warning_sent,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapDecision {
    /// Amount to persist.
    pub amount: Decimal,
    pub requested: Decimal,
    pub clamped: bool,
    /// True only on the call that first flips `cap_warning_sent`.
    pub warning: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EarningsCapGuard;

impl EarningsCapGuard {
    /// Clamp `requested` against the account's headroom and book the result.
    pub fn apply(&self, account: &mut EarningsAccount, requested: Decimal) -> CapDecision {
        let Some(cap) = account.plan_cap else {
            account.current_plan_earnings += requested;
            return CapDecision {
                amount: requested,
                requested,
                clamped: false,
                warning: false,
            };
        };

        let headroom = (cap - account.current_plan_earnings).max(Decimal::ZERO);
        let amount = requested.min(headroom);
        let clamped = amount < requested;
        account.current_plan_earnings += amount;

        let mut warning = false;
        if account.current_plan_earnings >= cap {
            account.earnings_cap_reached = true;
            if !account.cap_warning_sent {
                account.cap_warning_sent = true;
                warning = true;
                info!(
                    participant = %account.participant,
                    cap = %cap,
                    "Plan earnings cap reached"
                );
            }
        }

        CapDecision {
            amount,
            requested,
            clamped,
            warning,
        }
    }

    /// Give back `amount` of booked earnings after a clawback.
    ///
    /// `earnings_cap_reached` follows the new balance; `cap_warning_sent` never resets.
    pub fn reverse(&self, account: &mut EarningsAccount, amount: Decimal) {
        account.current_plan_earnings =
            (account.current_plan_earnings - amount).max(Decimal::ZERO);
        account.earnings_cap_reached = account
            .plan_cap
            .is_some_and(|cap| account.current_plan_earnings >= cap);
    }
}
