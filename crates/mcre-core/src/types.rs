//! Data model shared by every engine component.

use crate::period::RunKey;
use crate::{McreError, Result};
use chrono::{DateTime, Datelike, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Participant rank, totally ordered.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    #[default]
    Starter,
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl Rank {
    /// All ranks in ascending order.
    pub const ALL: [Rank; 6] = [
        Rank::Starter,
        Rank::Bronze,
        Rank::Silver,
        Rank::Gold,
        Rank::Platinum,
        Rank::Diamond,
    ];

    pub fn next(self) -> Option<Rank> {
        let idx = Rank::ALL.iter().position(|r| *r == self)?;
        Rank::ALL.get(idx + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Rank::Starter => "starter",
            Rank::Bronze => "bronze",
            Rank::Silver => "silver",
            Rank::Gold => "gold",
            Rank::Platinum => "platinum",
            Rank::Diamond => "diamond",
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A member of the sponsorship forest.
///
/// `sponsor` is resolved at registration and never changes. Rank fields are written only by
/// the rank qualification engine; earnings fields only by the earnings cap guard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub sponsor: Option<ParticipantId>,
    pub referral_code: String,
    pub rank: Rank,
    /// Highest rank ever held; rank-advancement bonuses are paid only above it.
    pub highest_rank: Rank,
    pub personal_volume: Decimal,
    pub team_volume: Decimal,
    pub active: bool,
    pub joined_at: DateTime<Utc>,
    pub protection_periods_used: u32,
    /// Year the protection counter belongs to.
    pub protection_year: i32,
    pub plan: Option<PlanId>,
    pub current_plan_earnings: Decimal,
    pub earnings_cap_reached: bool,
    pub cap_warning_sent: bool,
}

impl Participant {
    /// A freshly registered, active Starter with no earnings.
    pub fn new(
        id: ParticipantId,
        sponsor: Option<ParticipantId>,
        referral_code: impl Into<String>,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sponsor,
            referral_code: referral_code.into(),
            rank: Rank::Starter,
            highest_rank: Rank::Starter,
            personal_volume: Decimal::ZERO,
            team_volume: Decimal::ZERO,
            active: true,
            joined_at,
            protection_periods_used: 0,
            protection_year: joined_at.year(),
            plan: None,
            current_plan_earnings: Decimal::ZERO,
            earnings_cap_reached: false,
            cap_warning_sent: false,
        }
    }

    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self.highest_rank = self.highest_rank.max(rank);
        self
    }

    pub fn with_plan(mut self, plan: PlanId) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn is_root(&self) -> bool {
        self.sponsor.is_none()
    }

    pub fn cooling_off_end(&self, cooling_off_days: i64) -> DateTime<Utc> {
        self.joined_at + Duration::days(cooling_off_days)
    }
}

/// A qualifying sale reported by the host's event feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaleEvent {
    pub id: EventId,
    pub actor: ParticipantId,
    pub amount: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionType {
    Direct,
    Override,
    Leadership,
    Matching,
    Bonus,
}

impl CommissionType {
    pub const ALL: [CommissionType; 5] = [
        CommissionType::Direct,
        CommissionType::Override,
        CommissionType::Leadership,
        CommissionType::Matching,
        CommissionType::Bonus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommissionType::Direct => "direct",
            CommissionType::Override => "override",
            CommissionType::Leadership => "leadership",
            CommissionType::Matching => "matching",
            CommissionType::Bonus => "bonus",
        }
    }
}

impl fmt::Display for CommissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a commission was earned from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionSource {
    Sale(EventId),
    Participant(ParticipantId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Paid,
    Cancelled,
}

impl EntryStatus {
    /// Status only ever advances out of `Pending`.
    pub fn can_transition_to(self, to: EntryStatus) -> bool {
        matches!(
            (self, to),
            (EntryStatus::Pending, EntryStatus::Paid) | (EntryStatus::Pending, EntryStatus::Cancelled)
        )
    }
}

/// A commission entry before the ledger assigns it an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewCommissionEntry {
    pub recipient: ParticipantId,
    pub source: CommissionSource,
    pub amount: Decimal,
    pub kind: CommissionType,
    pub level: u8,
    pub created_at: DateTime<Utc>,
    pub release_at: DateTime<Utc>,
    pub run_key: Option<RunKey>,
}

/// Immutable once created; only `status` moves, and only out of `Pending`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommissionEntry {
    pub id: EntryId,
    pub recipient: ParticipantId,
    pub source: CommissionSource,
    pub amount: Decimal,
    pub kind: CommissionType,
    pub level: u8,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub release_at: DateTime<Utc>,
    pub run_key: Option<RunKey>,
}

impl CommissionEntry {
    pub fn from_new(id: EntryId, new: NewCommissionEntry) -> Self {
        Self {
            id,
            recipient: new.recipient,
            source: new.source,
            amount: new.amount,
            kind: new.kind,
            level: new.level,
            status: EntryStatus::Pending,
            created_at: new.created_at,
            release_at: new.release_at,
            run_key: new.run_key,
        }
    }

    /// Applies a status transition (`Pending -> Paid | Cancelled` only).
    pub fn transition(&mut self, to: EntryStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(McreError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn is_released(&self, now: DateTime<Utc>) -> bool {
        self.release_at <= now
    }
}

/// Thresholds a participant must meet to qualify for a rank.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRequirement {
    pub min_direct_referrals: u32,
    pub min_personal_volume: Decimal,
    pub min_team_volume: Decimal,
}

/// Per-rank cap on demotion protections usable per protection window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtectionPolicy(pub BTreeMap<Rank, u32>);

impl ProtectionPolicy {
    /// Missing ranks have no protections.
    pub fn limit(&self, rank: Rank) -> u32 {
        self.0.get(&rank).copied().unwrap_or(0)
    }
}

impl Default for ProtectionPolicy {
    fn default() -> Self {
        Self(BTreeMap::from([
            (Rank::Starter, 0),
            (Rank::Bronze, 0),
            (Rank::Silver, 1),
            (Rank::Gold, 2),
            (Rank::Platinum, 3),
            (Rank::Diamond, 4),
        ]))
    }
}

/// Rank fields written back after a run evaluates a participant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankUpdate {
    pub participant: ParticipantId,
    pub rank: Rank,
    pub highest_rank: Rank,
    pub protection_periods_used: u32,
    pub protection_year: i32,
    pub personal_volume: Decimal,
    pub team_volume: Decimal,
}

/// Earnings fields written back by the earnings cap guard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EarningsUpdate {
    pub participant: ParticipantId,
    pub current_plan_earnings: Decimal,
    pub earnings_cap_reached: bool,
    pub cap_warning_sent: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ranks_are_totally_ordered() {
        for pair in Rank::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(Rank::Gold.next(), Some(Rank::Platinum));
        assert_eq!(Rank::Diamond.next(), None);
    }

    #[test]
    fn status_only_advances_from_pending() {
        let now = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();
        let mut entry = CommissionEntry::from_new(
            EntryId(1),
            NewCommissionEntry {
                recipient: ParticipantId(1),
                source: CommissionSource::Sale(EventId(9)),
                amount: Decimal::new(100, 0),
                kind: CommissionType::Direct,
                level: 0,
                created_at: now,
                release_at: now,
                run_key: None,
            },
        );
        entry.transition(EntryStatus::Paid).unwrap();
        let err = entry.transition(EntryStatus::Cancelled).unwrap_err();
        assert!(matches!(err, McreError::InvalidTransition { .. }));
        assert!(entry.transition(EntryStatus::Pending).is_err());
        assert_eq!(entry.status, EntryStatus::Paid);
    }

    #[test]
    fn protection_limits_default_by_rank() {
        let policy = ProtectionPolicy::default();
        assert_eq!(policy.limit(Rank::Starter), 0);
        assert_eq!(policy.limit(Rank::Silver), 1);
        assert_eq!(policy.limit(Rank::Diamond), 4);
    }

    #[test]
    fn rank_map_keys_round_trip_through_json() {
        let policy = ProtectionPolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"gold\":2"));
        let back: ProtectionPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
