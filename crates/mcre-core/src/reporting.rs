//! Read-only rank and commission summaries.

use crate::config::EngineConfig;
use crate::qualification::{qualified_rank, RankMetrics};
use crate::types::{CommissionEntry, CommissionType, EntryStatus, Participant, ParticipantId, Rank};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Shortfall against the next rank's requirement; zero where already met.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankGap {
    pub direct_referrals: u32,
    pub personal_volume: Decimal,
    pub team_volume: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankSummary {
    pub participant: ParticipantId,
    pub current: Rank,
    pub highest: Rank,
    pub qualified: Rank,
    pub next: Option<Rank>,
    pub gap_to_next: Option<RankGap>,
    pub protections_remaining: u32,
}

pub fn rank_summary(
    participant: &Participant,
    metrics: &RankMetrics,
    config: &EngineConfig,
) -> RankSummary {
    let next = participant.rank.next();
    let gap_to_next = next
        .and_then(|rank| config.ranks.requirements.get(&rank))
        .map(|req| RankGap {
            direct_referrals: req
                .min_direct_referrals
                .saturating_sub(metrics.direct_referrals),
            personal_volume: (req.min_personal_volume - metrics.personal_volume)
                .max(Decimal::ZERO),
            team_volume: (req.min_team_volume - metrics.team_volume).max(Decimal::ZERO),
        });

    RankSummary {
        participant: participant.id,
        current: participant.rank,
        highest: participant.highest_rank,
        qualified: qualified_rank(metrics, &config.ranks.requirements),
        next,
        gap_to_next,
        protections_remaining: config
            .ranks
            .protection
            .limit(participant.rank)
            .saturating_sub(participant.protection_periods_used),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSummary {
    pub entries: usize,
    /// Sum over pending and paid entries; cancelled entries are excluded.
    pub total_earned: Decimal,
    pub by_type: BTreeMap<CommissionType, Decimal>,
    pub by_status: BTreeMap<EntryStatus, Decimal>,
}

pub fn commission_summary(entries: &[CommissionEntry]) -> CommissionSummary {
    let mut summary = CommissionSummary {
        entries: entries.len(),
        ..Default::default()
    };
    for entry in entries {
        *summary.by_status.entry(entry.status).or_default() += entry.amount;
        if entry.status == EntryStatus::Cancelled {
            continue;
        }
        *summary.by_type.entry(entry.kind).or_default() += entry.amount;
        summary.total_earned += entry.amount;
    }
    summary
}
