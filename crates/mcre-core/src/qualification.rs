//! Rank qualification.
//!
//! Metrics are computed from the period snapshot first; the rank kernel then decides the
//! transition. Nothing here writes to a store.

use crate::config::EngineConfig;
use crate::rank_kernel::{self, Command, Transition};
use crate::types::{Participant, Rank, RankRequirement, RankUpdate};
use crate::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Period metrics a rank requirement is checked against.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankMetrics {
    pub direct_referrals: u32,
    pub personal_volume: Decimal,
    pub team_volume: Decimal,
}

impl RankMetrics {
    pub fn satisfies(&self, req: &RankRequirement) -> bool {
        self.direct_referrals >= req.min_direct_referrals
            && self.personal_volume >= req.min_personal_volume
            && self.team_volume >= req.min_team_volume
    }
}

/// Highest rank whose requirement is fully met. Starter always qualifies.
pub fn qualified_rank(metrics: &RankMetrics, requirements: &BTreeMap<Rank, RankRequirement>) -> Rank {
    Rank::ALL
        .iter()
        .rev()
        .copied()
        .find(|rank| {
            requirements
                .get(rank)
                .map(|req| metrics.satisfies(req))
                .unwrap_or(false)
        })
        .unwrap_or(Rank::Starter)
}

#[derive(Clone, Debug, PartialEq)]
pub struct RankOutcome {
    pub qualified: Rank,
    pub transition: Transition,
    pub update: RankUpdate,
}

/// Runs one participant's period metrics through the rank kernel.
pub fn evaluate(
    participant: &Participant,
    metrics: &RankMetrics,
    config: &EngineConfig,
    period_year: i32,
    now: DateTime<Utc>,
) -> Result<RankOutcome> {
    let qualified = qualified_rank(metrics, &config.ranks.requirements);
    let cooling_off = now < participant.cooling_off_end(config.compliance.cooling_off_days);
    let cmd = Command::Evaluate {
        qualified,
        year: period_year,
        advancement_allowed: !cooling_off,
    };
    let (state, effects) = rank_kernel::step(
        &rank_kernel::State::of(participant),
        cmd,
        &config.ranks.protection,
    )?;

    if effects.transition != Transition::Unchanged {
        debug!(
            participant = %participant.id,
            transition = ?effects.transition,
            "Rank transition"
        );
    }

    Ok(RankOutcome {
        qualified,
        transition: effects.transition,
        update: RankUpdate {
            participant: participant.id,
            rank: state.rank,
            highest_rank: participant.highest_rank.max(state.rank),
            protection_periods_used: state.protection_periods_used,
            protection_year: state.protection_year,
            personal_volume: metrics.personal_volume,
            team_volume: metrics.team_volume,
        },
    })
}
