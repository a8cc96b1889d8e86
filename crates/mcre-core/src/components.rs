//! In-memory implementations of the host traits.
//!
//! Suitable for tests, simulations and embedding the engine in a process that keeps its own
//! state. Every store is thread-safe; a poisoned lock is reported as a storage error.

use crate::orchestrator::report::CommissionRun;
use crate::types::{
    CommissionEntry, CommissionSource, EarningsUpdate, EntryId, EntryStatus, NewCommissionEntry,
    Participant, ParticipantId, PlanId, RankUpdate, RunId, SaleEvent,
};
use crate::{
    money, Clock, CommissionLedger, McreError, MembershipPlans, ParticipantRepository,
    PeriodWindow, Result, RunKey, RunRegistry, SaleFeed,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

fn poisoned(what: &str) -> McreError {
    McreError::Storage(format!("{} lock poisoned", what))
}

// =============================================================================
// Participants
// =============================================================================

#[derive(Default)]
pub struct InMemoryParticipantRepository {
    participants: RwLock<BTreeMap<ParticipantId, Participant>>,
}

impl InMemoryParticipantRepository {
    pub fn new(participants: impl IntoIterator<Item = Participant>) -> Self {
        Self {
            participants: RwLock::new(participants.into_iter().map(|p| (p.id, p)).collect()),
        }
    }

    pub fn insert(&self, participant: Participant) -> Result<()> {
        self.participants
            .write()
            .map_err(|_| poisoned("Participant store"))?
            .insert(participant.id, participant);
        Ok(())
    }

    fn update(&self, id: ParticipantId, f: impl FnOnce(&mut Participant)) -> Result<()> {
        let mut map = self
            .participants
            .write()
            .map_err(|_| poisoned("Participant store"))?;
        let participant = map
            .get_mut(&id)
            .ok_or_else(|| McreError::Validation(format!("unknown participant {}", id)))?;
        f(participant);
        Ok(())
    }
}

impl ParticipantRepository for InMemoryParticipantRepository {
    fn get(&self, id: ParticipantId) -> Result<Option<Participant>> {
        let map = self
            .participants
            .read()
            .map_err(|_| poisoned("Participant store"))?;
        Ok(map.get(&id).cloned())
    }

    fn children_of(&self, sponsor: ParticipantId) -> Result<Vec<Participant>> {
        let map = self
            .participants
            .read()
            .map_err(|_| poisoned("Participant store"))?;
        Ok(map
            .values()
            .filter(|p| p.sponsor == Some(sponsor))
            .cloned()
            .collect())
    }

    fn list(&self) -> Result<Vec<Participant>> {
        let map = self
            .participants
            .read()
            .map_err(|_| poisoned("Participant store"))?;
        Ok(map.values().cloned().collect())
    }

    fn save_rank(&self, update: &RankUpdate) -> Result<()> {
        self.update(update.participant, |p| {
            p.rank = update.rank;
            p.highest_rank = update.highest_rank;
            p.protection_periods_used = update.protection_periods_used;
            p.protection_year = update.protection_year;
            p.personal_volume = update.personal_volume;
            p.team_volume = update.team_volume;
        })
    }

    fn save_earnings(&self, update: &EarningsUpdate) -> Result<()> {
        self.update(update.participant, |p| {
            p.current_plan_earnings = update.current_plan_earnings;
            p.earnings_cap_reached = update.earnings_cap_reached;
            p.cap_warning_sent = update.cap_warning_sent;
        })
    }
}

// =============================================================================
// Sales
// =============================================================================

#[derive(Default)]
pub struct InMemorySaleFeed {
    events: RwLock<Vec<SaleEvent>>,
}

impl InMemorySaleFeed {
    pub fn new(events: Vec<SaleEvent>) -> Self {
        Self {
            events: RwLock::new(events),
        }
    }

    pub fn push(&self, event: SaleEvent) -> Result<()> {
        self.events
            .write()
            .map_err(|_| poisoned("Sale feed"))?
            .push(event);
        Ok(())
    }
}

impl SaleFeed for InMemorySaleFeed {
    fn sales_in(&self, window: &PeriodWindow) -> Result<Vec<SaleEvent>> {
        let events = self.events.read().map_err(|_| poisoned("Sale feed"))?;
        Ok(events
            .iter()
            .filter(|e| window.contains(e.occurred_at))
            .cloned()
            .collect())
    }
}

// =============================================================================
// Membership plans
// =============================================================================

/// Fixed plan table. Plans missing from the table are treated as uncapped.
#[derive(Clone, Debug, Default)]
pub struct StaticMembershipPlans {
    caps: HashMap<PlanId, Option<Decimal>>,
}

impl StaticMembershipPlans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: PlanId, cap: Option<Decimal>) -> Self {
        self.caps.insert(plan, cap);
        self
    }
}

impl MembershipPlans for StaticMembershipPlans {
    fn earnings_cap(&self, plan: &PlanId) -> Result<Option<Decimal>> {
        Ok(self.caps.get(plan).copied().flatten())
    }
}

// =============================================================================
// Commission ledger
// =============================================================================

#[derive(Default)]
struct LedgerState {
    entries: Vec<CommissionEntry>,
    next_id: u64,
}

/// Append-only ledger; ids are assigned densely from 1.
#[derive(Default)]
pub struct InMemoryCommissionLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryCommissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Result<Vec<CommissionEntry>> {
        let state = self.state.read().map_err(|_| poisoned("Ledger"))?;
        Ok(state.entries.clone())
    }

    fn filtered(&self, pred: impl Fn(&CommissionEntry) -> bool) -> Result<Vec<CommissionEntry>> {
        let state = self.state.read().map_err(|_| poisoned("Ledger"))?;
        Ok(state.entries.iter().filter(|e| pred(e)).cloned().collect())
    }
}

impl CommissionLedger for InMemoryCommissionLedger {
    fn append_batch(&self, entries: Vec<NewCommissionEntry>) -> Result<Vec<CommissionEntry>> {
        for entry in &entries {
            money::ensure_non_negative("commission amount", entry.amount)?;
        }

        let mut state = self.state.write().map_err(|_| poisoned("Ledger"))?;
        let mut stored = Vec::with_capacity(entries.len());
        for new in entries {
            state.next_id += 1;
            let entry = CommissionEntry::from_new(EntryId(state.next_id), new);
            state.entries.push(entry.clone());
            stored.push(entry);
        }
        Ok(stored)
    }

    fn update_status(&self, id: EntryId, status: EntryStatus) -> Result<CommissionEntry> {
        let mut state = self.state.write().map_err(|_| poisoned("Ledger"))?;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| McreError::Validation(format!("unknown commission entry {}", id.0)))?;
        entry.transition(status)?;
        Ok(entry.clone())
    }

    fn entries_for(&self, recipient: ParticipantId) -> Result<Vec<CommissionEntry>> {
        self.filtered(|e| e.recipient == recipient)
    }

    fn entries_from(&self, source: CommissionSource) -> Result<Vec<CommissionEntry>> {
        self.filtered(|e| e.source == source)
    }
}

// =============================================================================
// Run registry
// =============================================================================

#[derive(Default)]
pub struct InMemoryRunRegistry {
    runs: RwLock<Vec<CommissionRun>>,
    processed: RwLock<HashMap<RunKey, BTreeSet<ParticipantId>>>,
    next_id: AtomicU64,
}

impl InMemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted run in persistence order, failed runs included.
    pub fn runs(&self) -> Result<Vec<CommissionRun>> {
        Ok(self.runs.read().map_err(|_| poisoned("Run registry"))?.clone())
    }
}

impl RunRegistry for InMemoryRunRegistry {
    fn find_completed(&self, key: &RunKey) -> Result<Option<CommissionRun>> {
        let runs = self.runs.read().map_err(|_| poisoned("Run registry"))?;
        Ok(runs
            .iter()
            .rev()
            .find(|r| r.key == *key && r.status.is_success())
            .cloned())
    }

    fn processed(&self, key: &RunKey) -> Result<BTreeSet<ParticipantId>> {
        let processed = self.processed.read().map_err(|_| poisoned("Run registry"))?;
        Ok(processed.get(key).cloned().unwrap_or_default())
    }

    fn mark_processed(&self, key: &RunKey, participant: ParticipantId) -> Result<()> {
        self.processed
            .write()
            .map_err(|_| poisoned("Run registry"))?
            .entry(*key)
            .or_default()
            .insert(participant);
        Ok(())
    }

    fn persist(&self, run: &CommissionRun) -> Result<()> {
        self.runs
            .write()
            .map_err(|_| poisoned("Run registry"))?
            .push(run.clone());
        Ok(())
    }

    fn next_run_id(&self) -> Result<RunId> {
        Ok(RunId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

// =============================================================================
// Clocks
// =============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for reproducible runs.
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        match self.now.write() {
            Ok(mut t) => *t = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn advance(&self, by: Duration) {
        let now = self.now();
        self.set(now + by);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(t) => *t,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
