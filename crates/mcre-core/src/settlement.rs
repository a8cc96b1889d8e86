//! Moving commission entries out of `Pending`.
//!
//! The engine never moves money; marking an entry `Paid` records that the host paid it out.

use crate::cap_guard::{EarningsAccount, EarningsCapGuard};
use crate::compliance::CompliancePolicy;
use crate::config::EngineConfig;
use crate::types::{CommissionSource, EntryId, EntryStatus, EventId, Participant, ParticipantId};
use crate::{CommissionLedger, MembershipPlans, ParticipantRepository, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub paid: Vec<EntryId>,
    pub amount: Decimal,
    /// True when nothing was released because payouts are restricted.
    pub blocked_by_cooling_off: bool,
}

/// Mark every pending, released entry of `participant` as paid.
pub fn release_due(
    ledger: &dyn CommissionLedger,
    participant: &Participant,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> Result<Release> {
    let status = CompliancePolicy::new(config).cooling_off_status(participant, now);
    if status.restrictions.payout_requests {
        debug!(participant = %participant.id, "Payout blocked during cooling-off");
        return Ok(Release {
            blocked_by_cooling_off: true,
            ..Release::default()
        });
    }

    let mut release = Release::default();
    for entry in ledger.entries_for(participant.id)? {
        if entry.status != EntryStatus::Pending || !entry.is_released(now) {
            continue;
        }
        let paid = ledger.update_status(entry.id, EntryStatus::Paid)?;
        release.amount += paid.amount;
        release.paid.push(paid.id);
    }

    if !release.paid.is_empty() {
        info!(
            participant = %participant.id,
            entries = release.paid.len(),
            amount = %release.amount,
            "Commissions released"
        );
    }
    Ok(release)
}

/// Outcome of cancelling a refunded sale's commissions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clawback {
    pub cancelled: Vec<EntryId>,
    /// Entries already paid out; left untouched.
    pub already_paid: Vec<EntryId>,
    /// Plan earnings given back per recipient.
    pub reversed: BTreeMap<ParticipantId, Decimal>,
}

/// Cancel the still-pending entries sourced from a refunded sale and give the cancelled
/// amounts back to each recipient's plan earnings.
pub fn cancel_entries_for_sale(
    ledger: &dyn CommissionLedger,
    participants: &dyn ParticipantRepository,
    plans: &dyn MembershipPlans,
    event: EventId,
) -> Result<Clawback> {
    let mut clawback = Clawback::default();
    for entry in ledger.entries_from(CommissionSource::Sale(event))? {
        match entry.status {
            EntryStatus::Pending => {
                ledger.update_status(entry.id, EntryStatus::Cancelled)?;
                clawback.cancelled.push(entry.id);
                *clawback.reversed.entry(entry.recipient).or_default() += entry.amount;
            }
            EntryStatus::Paid => clawback.already_paid.push(entry.id),
            EntryStatus::Cancelled => {}
        }
    }

    let guard = EarningsCapGuard;
    for (&recipient, &amount) in &clawback.reversed {
        let Some(participant) = participants.get(recipient)? else {
            warn!(participant = %recipient, "Clawback recipient not found");
            continue;
        };
        let cap = match &participant.plan {
            Some(plan) => plans.earnings_cap(plan)?,
            None => None,
        };
        let mut account = EarningsAccount::of(&participant, cap);
        guard.reverse(&mut account, amount);
        participants.save_earnings(&account.to_update())?;
    }

    info!(
        event = event.0,
        cancelled = clawback.cancelled.len(),
        already_paid = clawback.already_paid.len(),
        "Sale commissions cancelled"
    );
    Ok(clawback)
}
