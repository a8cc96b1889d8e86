//! Commission run orchestration.
//!
//! A run of one period proceeds in two phases:
//!
//! 1. Evaluate: every active participant is evaluated in parallel against immutable
//!    snapshots of the tree and the period's sales. Nothing is written.
//! 2. Commit: in ascending participant id, drafts pass the earnings cap guard and each
//!    participant's entries are appended as one atomic batch, followed by earnings, rank and
//!    the per-period completion marker.
//!
//! A participant that fails evaluation is listed in the run's errors and skipped; if failures
//! exceed the configured threshold the run is recorded as failed and nothing is committed.

pub mod report;

use crate::cap_guard::{EarningsAccount, EarningsCapGuard};
use crate::commission::{CommissionCalculator, CommissionDraft};
use crate::config::EngineConfig;
use crate::genealogy::GenealogySnapshot;
use crate::metrics::{RunMetrics, StageTimer};
use crate::period::RunKey;
use crate::qualification::{self, RankMetrics, RankOutcome};
use crate::rank_kernel::Transition;
use crate::types::{Participant, ParticipantId, PlanId};
use crate::volume::VolumeSnapshot;
use crate::{
    Clock, CommissionLedger, McreError, MembershipPlans, ParticipantRepository, Result,
    RunRegistry, RunType, SaleFeed,
};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use report::{AbortReason, CommissionRun, ParticipantError, RankChange, RunStatus};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Host stores a run reads from and writes to.
#[derive(Clone)]
pub struct EngineStores {
    pub participants: Arc<dyn ParticipantRepository>,
    pub sales: Arc<dyn SaleFeed>,
    pub plans: Arc<dyn MembershipPlans>,
    pub ledger: Arc<dyn CommissionLedger>,
    pub runs: Arc<dyn RunRegistry>,
    pub clock: Arc<dyn Clock>,
}

/// Cooperative cancellation flag shared with a running run.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub run_type: RunType,
    /// `"2024-10"` for monthly runs, `"2024-W42"` for weekly runs.
    pub period: String,
    /// Re-execute a period that already completed; credited participants are skipped.
    pub force_rerun: bool,
    pub cancel: Option<CancellationToken>,
}

impl RunRequest {
    pub fn new(run_type: RunType, period: impl Into<String>) -> Self {
        Self {
            run_type,
            period: period.into(),
            force_rerun: false,
            cancel: None,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force_rerun = true;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Everything phase 1 reads. Immutable for the duration of the run.
struct RunContext<'a> {
    key: RunKey,
    now: DateTime<Utc>,
    config: &'a EngineConfig,
    genealogy: GenealogySnapshot,
    volumes: VolumeSnapshot,
}

/// Result of evaluating one participant; committed in phase 2.
struct ParticipantPlan {
    participant: ParticipantId,
    drafts: Vec<CommissionDraft>,
    rank: RankOutcome,
}

enum Evaluated {
    Planned(ParticipantPlan),
    Failed(ParticipantError),
    Aborted(ParticipantId, AbortReason),
}

// Holds a run key for the lifetime of one run.
struct RunSlot<'a> {
    active: &'a Mutex<HashSet<RunKey>>,
    key: RunKey,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.key);
        }
    }
}

pub struct CommissionRunOrchestrator {
    config: EngineConfig,
    stores: EngineStores,
    pool: rayon::ThreadPool,
    guard: EarningsCapGuard,
    metrics: Arc<RunMetrics>,
    active: Mutex<HashSet<RunKey>>,
}

impl CommissionRunOrchestrator {
    pub fn new(config: EngineConfig, stores: EngineStores) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.run.worker_threads)
            .thread_name(|i| format!("mcre-run-{i}"))
            .build()
            .map_err(|e| McreError::ConfigError(format!("Failed to build worker pool: {}", e)))?;
        Ok(Self {
            config,
            stores,
            pool,
            guard: EarningsCapGuard,
            metrics: Arc::new(RunMetrics::new()),
            active: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<RunMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run one period with default options.
    pub fn run_period(&self, run_type: RunType, period: &str) -> Result<CommissionRun> {
        self.run_period_with(RunRequest::new(run_type, period))
    }

    /// Execute a commission run.
    ///
    /// Preconditions:
    /// - `request.period` parses as a period key of `request.run_type`.
    ///
    /// Postconditions:
    /// - `IdempotencyConflict` if the period already completed and `force_rerun` is false,
    ///   or if a run of the same period is in progress.
    /// - A participant already carrying the period's completion marker is never credited
    ///   again.
    /// - A run over the error threshold returns `Ok` with status `Failed` and commits nothing.
    #[instrument(
        skip(self, request),
        fields(run_type = %request.run_type, period = %request.period, forced = request.force_rerun)
    )]
    pub fn run_period_with(&self, request: RunRequest) -> Result<CommissionRun> {
        let key = RunKey::parse(request.run_type, &request.period)?;
        let _slot = self.claim(key)?;

        if let Some(previous) = self.stores.runs.find_completed(&key)? {
            if !request.force_rerun {
                self.metrics.idempotency_conflicts.inc();
                warn!(run = %key, previous_run = previous.id.0, "Period already executed");
                return Err(McreError::IdempotencyConflict { key });
            }
        }

        self.metrics.active_runs.inc();
        let result = self.execute(key, &request);
        self.metrics.active_runs.dec();
        result
    }

    fn claim(&self, key: RunKey) -> Result<RunSlot<'_>> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| McreError::Storage("Run slot lock poisoned".into()))?;
        if !active.insert(key) {
            self.metrics.idempotency_conflicts.inc();
            return Err(McreError::IdempotencyConflict { key });
        }
        Ok(RunSlot {
            active: &self.active,
            key,
        })
    }

    fn execute(&self, key: RunKey, request: &RunRequest) -> Result<CommissionRun> {
        let started = Instant::now();
        let deadline = self.config.run.deadline().map(|d| started + d);
        let cancel = request.cancel.as_ref();
        let now = self.stores.clock.now();

        let window = key.period.window()?;
        let processed = self.stores.runs.processed(&key)?;
        let genealogy = GenealogySnapshot::build(self.stores.participants.list()?);
        let volumes = VolumeSnapshot::build(window, self.stores.sales.sales_in(&window)?);
        let mut accounts = self.load_accounts(&genealogy)?;

        let mut run = CommissionRun::new(
            self.stores.runs.next_run_id()?,
            key,
            now,
            request.force_rerun,
        );
        let ctx = RunContext {
            key,
            now,
            config: &self.config,
            genealogy,
            volumes,
        };

        let candidates: Vec<&Participant> = ctx
            .genealogy
            .participants()
            .filter(|p| p.active && !processed.contains(&p.id))
            .collect();
        info!(
            run_id = run.id.0,
            participants = candidates.len(),
            already_processed = processed.len(),
            "Commission run started"
        );

        // Phase 1: evaluate against snapshots only.
        let outcomes: Vec<Evaluated> = self.pool.install(|| {
            candidates
                .par_iter()
                .map(|p| {
                    if let Some(reason) = abort_reason(cancel, deadline) {
                        return Evaluated::Aborted(p.id, reason);
                    }
                    let _timer = StageTimer::start(&self.metrics.participant_latency);
                    match plan_participant(&ctx, p) {
                        Ok(plan) => Evaluated::Planned(plan),
                        Err(e) => {
                            warn!(participant = %p.id, error = %e, "Participant skipped");
                            Evaluated::Failed(ParticipantError::from_error(p.id, &e))
                        }
                    }
                })
                .collect()
        });

        let mut plans = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Evaluated::Planned(plan) => plans.push(plan),
                Evaluated::Failed(err) => run.errors.push(err),
                Evaluated::Aborted(participant, reason) => {
                    run.aborted.get_or_insert(reason);
                    run.errors.push(ParticipantError::aborted(participant, reason));
                }
            }
        }

        let failures = run.failure_count();
        let attempted = plans.len() + failures;
        if exceeds_threshold(failures, attempted, self.config.run.max_error_bps) {
            run.status = RunStatus::Failed;
            run.finished_at = self.stores.clock.now();
            self.stores.runs.persist(&run)?;
            self.metrics.record_run(&run);
            warn!(
                run_id = run.id.0,
                failures,
                attempted,
                max_error_bps = self.config.run.max_error_bps,
                "Commission run failed: error threshold exceeded"
            );
            return Ok(run);
        }

        // Phase 2: single-threaded commit in ascending participant id.
        for plan in plans {
            if let Some(reason) = abort_reason(cancel, deadline) {
                run.aborted.get_or_insert(reason);
                run.errors
                    .push(ParticipantError::aborted(plan.participant, reason));
                continue;
            }
            let participant = plan.participant;
            match self.commit(&ctx, plan, &mut accounts, &mut run) {
                Ok(()) => run.participants_processed += 1,
                Err(e) => {
                    warn!(participant = %participant, error = %e, "Commit failed");
                    run.errors.push(ParticipantError::from_error(participant, &e));
                }
            }
        }
        run.errors.sort_by_key(|e| e.participant);

        run.status = if run.errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };
        run.finished_at = self.stores.clock.now();
        self.stores.runs.persist(&run)?;
        self.metrics.record_run(&run);

        info!(
            run_id = run.id.0,
            status = ?run.status,
            processed = run.participants_processed,
            errors = run.errors.len(),
            entries = run.entries_created,
            clamped = run.entries_clamped,
            total = %run.total_commissions,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Commission run finished"
        );
        Ok(run)
    }

    fn load_accounts(
        &self,
        genealogy: &GenealogySnapshot,
    ) -> Result<HashMap<ParticipantId, EarningsAccount>> {
        let mut caps: BTreeMap<PlanId, Option<Decimal>> = BTreeMap::new();
        let mut accounts = HashMap::with_capacity(genealogy.len());
        for p in genealogy.participants() {
            let cap = match &p.plan {
                Some(plan) => match caps.get(plan) {
                    Some(cap) => *cap,
                    None => {
                        let cap = self.stores.plans.earnings_cap(plan)?;
                        caps.insert(plan.clone(), cap);
                        cap
                    }
                },
                None => None,
            };
            accounts.insert(p.id, EarningsAccount::of(p, cap));
        }
        Ok(accounts)
    }

    /// Cap, persist and tally one participant's plan.
    ///
    /// The completion marker is written before the batch is appended: a storage failure
    /// between the two leaves the participant marked with nothing credited, never credited
    /// without a marker. Earnings are staged per recipient and only folded into `accounts`
    /// once the ledger accepted the batch.
    fn commit(
        &self,
        ctx: &RunContext<'_>,
        plan: ParticipantPlan,
        accounts: &mut HashMap<ParticipantId, EarningsAccount>,
        run: &mut CommissionRun,
    ) -> Result<()> {
        let mut staged: BTreeMap<ParticipantId, EarningsAccount> = BTreeMap::new();
        let mut entries = Vec::with_capacity(plan.drafts.len());
        let mut clamped = 0;

        for draft in plan.drafts {
            let account = staged.entry(draft.recipient).or_insert_with(|| {
                accounts.get(&draft.recipient).cloned().unwrap_or(EarningsAccount {
                    participant: draft.recipient,
                    plan_cap: None,
                    current_plan_earnings: Decimal::ZERO,
                    earnings_cap_reached: false,
                    cap_warning_sent: false,
                })
            });
            let decision = self.guard.apply(account, draft.amount);
            if decision.clamped {
                clamped += 1;
            }
            entries.push(draft.into_entry(decision.amount, ctx.now, Some(ctx.key)));
        }

        self.stores.runs.mark_processed(&ctx.key, plan.participant)?;
        let stored = if entries.is_empty() {
            Vec::new()
        } else {
            self.stores.ledger.append_batch(entries)?
        };

        for entry in &stored {
            *run.breakdown.entry(entry.kind).or_default() += entry.amount;
            run.total_commissions += entry.amount;
            self.metrics.record_entries(entry.kind.as_str(), 1);
        }
        run.entries_created += stored.len();
        run.entries_clamped += clamped;

        let updates: Vec<_> = staged.values().map(EarningsAccount::to_update).collect();
        accounts.extend(staged);

        for update in &updates {
            self.stores.participants.save_earnings(update)?;
        }
        self.stores.participants.save_rank(&plan.rank.update)?;

        if let Some(change) = RankChange::from_transition(
            plan.participant,
            plan.rank.transition,
            plan.rank.qualified,
            plan.rank.update.protection_periods_used,
        ) {
            run.rank_changes.push(change);
        }
        Ok(())
    }
}

fn plan_participant(ctx: &RunContext<'_>, p: &Participant) -> Result<ParticipantPlan> {
    if let Some(fault) = ctx.genealogy.integrity_fault(p.id) {
        return Err(McreError::integrity(p.id, fault.to_string()));
    }
    ctx.volumes.check(p.id)?;

    let personal_volume = ctx.volumes.personal_volume(p.id);
    let team_volume = ctx.volumes.team_volume(
        &ctx.genealogy,
        p.id,
        ctx.config.genealogy.max_descendant_depth,
    )?;
    let metrics = RankMetrics {
        direct_referrals: ctx.genealogy.direct_referral_count(p.id),
        personal_volume,
        team_volume,
    };
    let rank = qualification::evaluate(p, &metrics, ctx.config, ctx.key.period.year(), ctx.now)?;

    let calculator = CommissionCalculator::new(ctx.config, ctx.now);
    let mut drafts = Vec::new();
    for sale in ctx.volumes.sales_by(p.id) {
        drafts.extend(calculator.for_sale(&ctx.genealogy, sale)?);
    }
    drafts.extend(calculator.leadership(p, team_volume));
    if let Transition::Promoted { to, .. } = rank.transition {
        drafts.extend(calculator.rank_bonus(p, to));
    }

    Ok(ParticipantPlan {
        participant: p.id,
        drafts,
        rank,
    })
}

fn abort_reason(
    cancel: Option<&CancellationToken>,
    deadline: Option<Instant>,
) -> Option<AbortReason> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Some(AbortReason::Cancelled);
    }
    if deadline.is_some_and(|d| Instant::now() >= d) {
        return Some(AbortReason::DeadlineExceeded);
    }
    None
}

/// `failures / attempted > max_error_bps / 10_000`, in integer arithmetic.
fn exceeds_threshold(failures: usize, attempted: usize, max_error_bps: u16) -> bool {
    if attempted == 0 {
        return false;
    }
    (failures as u128) * 10_000 > (attempted as u128) * u128::from(max_error_bps)
}
