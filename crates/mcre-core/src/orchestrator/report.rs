//! Commission run records.

use crate::period::RunKey;
use crate::rank_kernel::Transition;
use crate::types::{CommissionType, ParticipantId, Rank, RunId};
use crate::McreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    /// Error threshold exceeded; nothing was committed.
    Failed,
}

impl RunStatus {
    pub fn is_success(self) -> bool {
        !matches!(self, RunStatus::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    DeadlineExceeded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DataIntegrity,
    Validation,
    Storage,
    Kernel,
    /// Not attempted because the run was cancelled or hit its deadline.
    Aborted,
}

impl FailureKind {
    pub fn of(err: &McreError) -> FailureKind {
        match err {
            McreError::DataIntegrity { .. } => FailureKind::DataIntegrity,
            McreError::Storage(_) => FailureKind::Storage,
            McreError::Kernel(_) => FailureKind::Kernel,
            McreError::Validation(_)
            | McreError::IdempotencyConflict { .. }
            | McreError::InvalidTransition { .. }
            | McreError::ConfigError(_) => FailureKind::Validation,
        }
    }
}

/// A participant the run could not credit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantError {
    pub participant: ParticipantId,
    pub kind: FailureKind,
    pub message: String,
}

impl ParticipantError {
    pub fn from_error(participant: ParticipantId, err: &McreError) -> Self {
        Self {
            participant,
            kind: FailureKind::of(err),
            message: err.to_string(),
        }
    }

    pub fn aborted(participant: ParticipantId, reason: AbortReason) -> Self {
        let message = match reason {
            AbortReason::Cancelled => "run cancelled before participant was evaluated",
            AbortReason::DeadlineExceeded => "run deadline passed before participant was evaluated",
        };
        Self {
            participant,
            kind: FailureKind::Aborted,
            message: message.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankChangeKind {
    Promoted,
    Demoted,
    Protected,
    PromotionDeferred,
}

/// Audit record of a rank decision that was not a plain "unchanged".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankChange {
    pub participant: ParticipantId,
    pub kind: RankChangeKind,
    pub from: Rank,
    /// Rank held after the run (equal to `from` unless promoted or demoted).
    pub to: Rank,
    pub qualified: Rank,
    pub protection_periods_used: u32,
}

impl RankChange {
    pub fn from_transition(
        participant: ParticipantId,
        transition: Transition,
        qualified: Rank,
        protection_periods_used: u32,
    ) -> Option<Self> {
        let (kind, from, to) = match transition {
            Transition::Promoted { from, to } => (RankChangeKind::Promoted, from, to),
            Transition::Demoted { from, to } => (RankChangeKind::Demoted, from, to),
            Transition::Protected { rank, .. } => (RankChangeKind::Protected, rank, rank),
            Transition::PromotionDeferred { current, .. } => {
                (RankChangeKind::PromotionDeferred, current, current)
            }
            Transition::Unchanged => return None,
        };
        Some(Self {
            participant,
            kind,
            from,
            to,
            qualified,
            protection_periods_used,
        })
    }
}

/// Outcome of one execution of a period.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommissionRun {
    pub id: RunId,
    pub key: RunKey,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the run was a forced re-execution of an already completed period.
    pub forced: bool,
    pub participants_processed: usize,
    pub total_commissions: Decimal,
    pub breakdown: BTreeMap<CommissionType, Decimal>,
    pub errors: Vec<ParticipantError>,
    pub rank_changes: Vec<RankChange>,
    pub entries_created: usize,
    pub entries_clamped: usize,
    pub aborted: Option<AbortReason>,
}

impl CommissionRun {
    pub fn new(id: RunId, key: RunKey, started_at: DateTime<Utc>, forced: bool) -> Self {
        Self {
            id,
            key,
            status: RunStatus::Completed,
            started_at,
            finished_at: started_at,
            forced,
            participants_processed: 0,
            total_commissions: Decimal::ZERO,
            breakdown: BTreeMap::new(),
            errors: Vec::new(),
            rank_changes: Vec::new(),
            entries_created: 0,
            entries_clamped: 0,
            aborted: None,
        }
    }

    /// Errors that were not caused by cancellation or the deadline.
    pub fn failure_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.kind != FailureKind::Aborted)
            .count()
    }

    pub fn breakdown_total(&self) -> Decimal {
        self.breakdown.values().copied().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::RunType;
    use chrono::TimeZone;

    #[test]
    fn run_record_survives_json() {
        let key = RunKey::parse(RunType::Weekly, "2024-W42").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 10, 21, 0, 0, 0).unwrap();
        let mut run = CommissionRun::new(RunId(3), key, at, false);
        run.breakdown.insert(CommissionType::Direct, Decimal::new(10050, 2));
        run.errors.push(ParticipantError::aborted(
            ParticipantId(9),
            AbortReason::DeadlineExceeded,
        ));

        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains("\"direct\""));
        let back: CommissionRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
        assert_eq!(back.failure_count(), 0);
    }

    #[test]
    fn unchanged_rank_is_not_recorded() {
        assert!(RankChange::from_transition(
            ParticipantId(1),
            Transition::Unchanged,
            Rank::Gold,
            0
        )
        .is_none());
        let change = RankChange::from_transition(
            ParticipantId(1),
            Transition::Protected {
                rank: Rank::Gold,
                used: 1,
            },
            Rank::Silver,
            1,
        )
        .unwrap();
        assert_eq!(change.kind, RankChangeKind::Protected);
        assert_eq!(change.to, Rank::Gold);
    }
}
