//! MCRE: multi-level compensation and rank engine.
//!
//! Computes referral commissions across a sponsorship tree, qualifies participant rank with
//! demotion protection, enforces plan earnings caps, and drives all of it as idempotent
//! weekly/monthly commission runs. Cooling-off and refund decisions are served independently.
//!
//! The engine never moves money: it determines amounts owed and entry status. Persistence is
//! the host's concern and is reached only through the traits defined here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use thiserror::Error;

pub mod cap_guard;
pub mod commission;
pub mod compliance;
pub mod components;
pub mod config;
pub mod genealogy;
pub mod metrics;
pub mod money;
pub mod observability;
pub mod orchestrator;
pub mod period;
pub mod qualification;
pub mod rank_kernel;
pub mod reporting;
pub mod run_log;
pub mod settlement;
pub mod types;
pub mod volume;

pub use config::EngineConfig;
pub use money::Rate;
pub use orchestrator::{CancellationToken, CommissionRunOrchestrator, EngineStores, RunRequest};
pub use period::{PeriodKey, PeriodWindow, RunKey, RunType};
pub use types::{
    CommissionEntry, CommissionSource, CommissionType, EarningsUpdate, EntryId, EntryStatus,
    EventId, NewCommissionEntry, Participant, ParticipantId, PlanId, ProtectionPolicy, Rank,
    RankRequirement, RankUpdate, RunId, SaleEvent,
};
pub use orchestrator::report::{
    AbortReason, CommissionRun, FailureKind, ParticipantError, RankChange, RunStatus,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum McreError {
    // Bad input; surfaced to the caller, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    // Corrupt tree or feed data; the affected participant is skipped by a run.
    #[error("Data integrity error for participant {participant}: {reason}")]
    DataIntegrity {
        participant: ParticipantId,
        reason: String,
    },

    #[error("Commission run already executed for {key}")]
    IdempotencyConflict { key: RunKey },

    #[error("Invalid commission status transition {from:?} -> {to:?}")]
    InvalidTransition { from: EntryStatus, to: EntryStatus },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Rank kernel error: {0}")]
    Kernel(#[from] rank_kernel::Error),
}

impl McreError {
    pub(crate) fn integrity(participant: ParticipantId, reason: impl Into<String>) -> Self {
        McreError::DataIntegrity {
            participant,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, McreError>;

/// Participant store owned by the host.
pub trait ParticipantRepository: Send + Sync {
    fn get(&self, id: ParticipantId) -> Result<Option<Participant>>;

    /// Direct referrals of `sponsor`.
    fn children_of(&self, sponsor: ParticipantId) -> Result<Vec<Participant>>;

    /// Every participant, active or not.
    fn list(&self) -> Result<Vec<Participant>>;

    fn save_rank(&self, update: &RankUpdate) -> Result<()>;

    fn save_earnings(&self, update: &EarningsUpdate) -> Result<()>;
}

/// Qualifying sale events.
pub trait SaleFeed: Send + Sync {
    /// Postconditions:
    /// - May return events outside `window`; the volume snapshot filters them.
    fn sales_in(&self, window: &PeriodWindow) -> Result<Vec<SaleEvent>>;
}

/// Membership plan lookup.
pub trait MembershipPlans: Send + Sync {
    /// `None` when the plan has no earnings ceiling.
    fn earnings_cap(&self, plan: &PlanId) -> Result<Option<Decimal>>;
}

/// Append-only commission entry store.
pub trait CommissionLedger: Send + Sync {
    /// Postconditions:
    /// - Either every entry is stored (ids assigned in input order) or none is.
    fn append_batch(&self, entries: Vec<NewCommissionEntry>) -> Result<Vec<CommissionEntry>>;

    /// Postconditions:
    /// - Fails with `InvalidTransition` unless the entry is `Pending`.
    fn update_status(&self, id: EntryId, status: EntryStatus) -> Result<CommissionEntry>;

    fn entries_for(&self, recipient: ParticipantId) -> Result<Vec<CommissionEntry>>;

    fn entries_from(&self, source: CommissionSource) -> Result<Vec<CommissionEntry>>;
}

/// Commission run records and per-period completion markers.
pub trait RunRegistry: Send + Sync {
    /// Latest run for `key` that did not fail.
    fn find_completed(&self, key: &RunKey) -> Result<Option<CommissionRun>>;

    /// Participants already credited for `key`.
    fn processed(&self, key: &RunKey) -> Result<BTreeSet<ParticipantId>>;

    fn mark_processed(&self, key: &RunKey, participant: ParticipantId) -> Result<()>;

    fn persist(&self, run: &CommissionRun) -> Result<()>;

    fn next_run_id(&self) -> Result<RunId>;
}

/// Time source; injected so runs and compliance checks are reproducible.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
