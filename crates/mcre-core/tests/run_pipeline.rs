//! End-to-end commission run tests.
//!
//! These tests drive the orchestrator over the in-memory host components and check what a
//! host would observe: ledger entries, participant write-backs and run records.

use chrono::{DateTime, TimeZone, Utc};
use mcre_core::components::{
    FixedClock, InMemoryCommissionLedger, InMemoryParticipantRepository, InMemoryRunRegistry,
    InMemorySaleFeed, StaticMembershipPlans,
};
use mcre_core::orchestrator::report::RankChangeKind;
use mcre_core::run_log::FileRunRegistry;
use mcre_core::{
    CancellationToken, CommissionLedger, CommissionRun, CommissionRunOrchestrator,
    CommissionType, EngineConfig, EngineStores, EntryStatus, EventId, FailureKind, McreError,
    Participant, ParticipantId, ParticipantRepository, PeriodWindow, PlanId, Rank, RunId,
    RunKey, RunRegistry, RunRequest, RunStatus, RunType, SaleEvent, SaleFeed,
};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

// =============================================================================
// Test Fixtures
// =============================================================================

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn veteran(id: u64, sponsor: Option<u64>) -> Participant {
    Participant::new(
        ParticipantId(id),
        sponsor.map(ParticipantId),
        format!("REF{id}"),
        at(2023, 1, 1),
    )
}

fn sale(id: u64, actor: u64, amount: i64, when: DateTime<Utc>) -> SaleEvent {
    SaleEvent {
        id: EventId(id),
        actor: ParticipantId(actor),
        amount: Decimal::from(amount),
        occurred_at: when,
    }
}

struct Harness {
    participants: Arc<InMemoryParticipantRepository>,
    sales: Arc<InMemorySaleFeed>,
    ledger: Arc<InMemoryCommissionLedger>,
    runs: Arc<InMemoryRunRegistry>,
    clock: Arc<FixedClock>,
    orchestrator: CommissionRunOrchestrator,
}

impl Harness {
    fn new(config: EngineConfig, participants: Vec<Participant>, sales: Vec<SaleEvent>) -> Self {
        Self::with_plans(config, participants, sales, StaticMembershipPlans::new())
    }

    fn with_plans(
        config: EngineConfig,
        participants: Vec<Participant>,
        sales: Vec<SaleEvent>,
        plans: StaticMembershipPlans,
    ) -> Self {
        let participants = Arc::new(InMemoryParticipantRepository::new(participants));
        let sales = Arc::new(InMemorySaleFeed::new(sales));
        let ledger = Arc::new(InMemoryCommissionLedger::new());
        let runs = Arc::new(InMemoryRunRegistry::new());
        let clock = Arc::new(FixedClock::new(at(2024, 11, 1)));
        let stores = EngineStores {
            participants: participants.clone(),
            sales: sales.clone(),
            plans: Arc::new(plans),
            ledger: ledger.clone(),
            runs: runs.clone(),
            clock: clock.clone(),
        };
        let orchestrator = CommissionRunOrchestrator::new(config, stores).unwrap();
        Self {
            participants,
            sales,
            ledger,
            runs,
            clock,
            orchestrator,
        }
    }

    fn earned_by(&self, id: u64) -> Decimal {
        self.ledger
            .entries_for(ParticipantId(id))
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .sum()
    }

    fn participant(&self, id: u64) -> Participant {
        self.participants.get(ParticipantId(id)).unwrap().unwrap()
    }
}

/// Root (Silver) <- 2 <- 3, with one 1000 sale by participant 3 in October 2024.
fn three_level_line() -> (Vec<Participant>, Vec<SaleEvent>) {
    let participants = vec![
        veteran(1, None).with_rank(Rank::Silver),
        veteran(2, Some(1)),
        veteran(3, Some(2)),
    ];
    let sales = vec![sale(1, 3, 1_000, at(2024, 10, 15))];
    (participants, sales)
}

/// One root with 96 healthy referrals and 3 participants whose sponsor does not exist.
fn hundred_with_three_dangling() -> (Vec<Participant>, Vec<SaleEvent>) {
    let mut participants = vec![veteran(1, None)];
    let mut sales = Vec::new();
    for id in 2..=97 {
        participants.push(veteran(id, Some(1)));
        sales.push(sale(id, id, 100, at(2024, 10, 10)));
    }
    for id in 98..=100 {
        participants.push(veteran(id, Some(9_999)));
        sales.push(sale(id, id, 100, at(2024, 10, 10)));
    }
    (participants, sales)
}

// =============================================================================
// Happy path
// =============================================================================

#[test]
fn monthly_run_credits_every_commission_type() {
    let (participants, sales) = three_level_line();
    let h = Harness::new(EngineConfig::default(), participants, sales);

    let run = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.participants_processed, 3);
    assert!(run.errors.is_empty());
    assert_eq!(run.breakdown[&CommissionType::Direct], Decimal::from(100));
    assert_eq!(run.breakdown[&CommissionType::Matching], Decimal::from(10));
    assert_eq!(run.breakdown[&CommissionType::Override], Decimal::from(80));
    assert_eq!(run.breakdown[&CommissionType::Leadership], Decimal::from(10));
    assert_eq!(run.total_commissions, Decimal::from(200));
    assert_eq!(run.total_commissions, run.breakdown_total());

    // Sponsor: direct 100 + level-1 override 50. Root: matching 10 + level-2 override 30
    // + Silver leadership on 1000 of team volume.
    assert_eq!(h.earned_by(2), Decimal::from(150));
    assert_eq!(h.earned_by(1), Decimal::from(50));
    assert_eq!(h.earned_by(3), Decimal::ZERO);

    let entries = h.ledger.all().unwrap();
    assert_eq!(entries.len(), run.entries_created);
    for entry in &entries {
        assert!(entry.amount > Decimal::ZERO);
        assert_eq!(entry.release_at, at(2024, 12, 1));
        assert_eq!(entry.run_key, Some(run.key));
    }
}

#[test]
fn failed_qualification_uses_demotion_protection() {
    let (participants, sales) = three_level_line();
    let h = Harness::new(EngineConfig::default(), participants, sales);

    let run = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();

    assert_eq!(run.rank_changes.len(), 1);
    let change = &run.rank_changes[0];
    assert_eq!(change.participant, ParticipantId(1));
    assert_eq!(change.kind, RankChangeKind::Protected);
    assert_eq!(change.to, Rank::Silver);
    assert_eq!(change.qualified, Rank::Starter);

    let root = h.participant(1);
    assert_eq!(root.rank, Rank::Silver);
    assert_eq!(root.protection_periods_used, 1);
    assert_eq!(root.protection_year, 2024);
    assert_eq!(root.team_volume, Decimal::from(1_000));
}

#[test]
fn promotion_pays_advancement_bonus_once() {
    let config = EngineConfig::builder()
        .rank_advancement_bonus(Rank::Bronze, Decimal::from(50))
        .build()
        .unwrap();
    let participants = vec![veteran(10, None), veteran(11, Some(10)), veteran(12, Some(10))];
    let sales = vec![
        sale(1, 10, 200, at(2024, 10, 3)),
        sale(2, 11, 300, at(2024, 10, 4)),
        sale(3, 12, 300, at(2024, 10, 5)),
    ];
    let h = Harness::new(config, participants, sales);

    let october = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();
    let promoted = october
        .rank_changes
        .iter()
        .find(|c| c.participant == ParticipantId(10))
        .unwrap();
    assert_eq!(promoted.kind, RankChangeKind::Promoted);
    assert_eq!(promoted.to, Rank::Bronze);
    assert_eq!(october.breakdown[&CommissionType::Bonus], Decimal::from(50));
    // Two directs of 30, two level-1 overrides of 15, and the bonus.
    assert_eq!(h.earned_by(10), Decimal::from(140));

    // No volume in November: Bronze carries no protection, so the rank drops.
    h.clock.set(at(2024, 12, 1));
    let november = h.orchestrator.run_period(RunType::Monthly, "2024-11").unwrap();
    assert!(november
        .rank_changes
        .iter()
        .any(|c| c.participant == ParticipantId(10) && c.kind == RankChangeKind::Demoted));
    let demoted = h.participant(10);
    assert_eq!(demoted.rank, Rank::Starter);
    assert_eq!(demoted.highest_rank, Rank::Bronze);

    // Requalifying for a rank already held earlier pays no second bonus.
    h.sales.push(sale(4, 10, 200, at(2024, 12, 3))).unwrap();
    h.sales.push(sale(5, 11, 300, at(2024, 12, 4))).unwrap();
    h.sales.push(sale(6, 12, 300, at(2024, 12, 5))).unwrap();
    h.clock.set(at(2025, 1, 1));
    let december = h.orchestrator.run_period(RunType::Monthly, "2024-12").unwrap();
    assert!(december
        .rank_changes
        .iter()
        .any(|c| c.participant == ParticipantId(10) && c.kind == RankChangeKind::Promoted));
    assert!(!december.breakdown.contains_key(&CommissionType::Bonus));
}

#[test]
fn cooling_off_defers_promotion_and_forfeits_earnings() {
    let joined = at(2024, 10, 28);
    let fresh = |id: u64, sponsor: Option<u64>| {
        Participant::new(ParticipantId(id), sponsor.map(ParticipantId), format!("NEW{id}"), joined)
    };
    let config = EngineConfig::builder().holding_period_days(0).build().unwrap();
    let participants = vec![
        veteran(1, None).with_rank(Rank::Silver),
        fresh(20, Some(1)),
        fresh(21, Some(20)),
        fresh(22, Some(20)),
    ];
    let sales = vec![
        sale(1, 20, 200, at(2024, 10, 29)),
        sale(2, 21, 300, at(2024, 10, 30)),
        sale(3, 22, 300, at(2024, 10, 30)),
    ];
    let h = Harness::new(config, participants, sales);

    let run = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();

    let deferred = run
        .rank_changes
        .iter()
        .find(|c| c.participant == ParticipantId(20))
        .unwrap();
    assert_eq!(deferred.kind, RankChangeKind::PromotionDeferred);
    assert_eq!(deferred.qualified, Rank::Bronze);
    assert_eq!(h.participant(20).rank, Rank::Starter);

    // Nothing is credited inside the cooling-off window, and nothing counts against the cap.
    assert!(h.ledger.entries_for(ParticipantId(20)).unwrap().is_empty());
    assert_eq!(h.participant(20).current_plan_earnings, Decimal::ZERO);

    // The veteran upline is still paid, on the normal holding schedule.
    let upline = h.ledger.entries_for(ParticipantId(1)).unwrap();
    assert!(!upline.is_empty());
    for entry in upline {
        assert_eq!(entry.release_at, at(2024, 11, 1));
    }
}

#[test]
fn weekly_run_only_sees_its_week() {
    let (participants, _) = three_level_line();
    let sales = vec![
        sale(1, 3, 1_000, at(2024, 10, 15)),
        sale(2, 3, 1_000, at(2024, 10, 22)),
    ];
    let h = Harness::new(EngineConfig::default(), participants, sales);

    let run = h
        .orchestrator
        .run_period(RunType::Weekly, "2024-W42")
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.breakdown[&CommissionType::Direct], Decimal::from(100));
}

// =============================================================================
// Idempotence and reruns
// =============================================================================

#[test]
fn completed_period_is_not_executed_twice() {
    let (participants, sales) = three_level_line();
    let h = Harness::new(EngineConfig::default(), participants, sales);

    h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();
    let before = h.ledger.all().unwrap().len();

    let err = h
        .orchestrator
        .run_period(RunType::Monthly, "2024-10")
        .unwrap_err();
    assert!(matches!(err, McreError::IdempotencyConflict { .. }));
    assert_eq!(h.ledger.all().unwrap().len(), before);
    assert_eq!(h.orchestrator.metrics().idempotency_conflicts.get(), 1);
}

#[test]
fn forced_rerun_never_credits_twice() {
    let (participants, sales) = three_level_line();
    let h = Harness::new(EngineConfig::default(), participants, sales);

    let first = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();
    let paid_to_sponsor = h.earned_by(2);

    let rerun = h
        .orchestrator
        .run_period_with(RunRequest::new(RunType::Monthly, "2024-10").forced())
        .unwrap();

    assert!(rerun.forced);
    assert_ne!(rerun.id, first.id);
    assert_eq!(rerun.status, RunStatus::Completed);
    assert_eq!(rerun.participants_processed, 0);
    assert_eq!(rerun.total_commissions, Decimal::ZERO);
    assert_eq!(h.earned_by(2), paid_to_sponsor);
    assert_eq!(h.runs.runs().unwrap().len(), 2);
}

#[test]
fn run_of_same_period_in_progress_conflicts() {
    // Blocks the first run inside its sale lookup until the test releases it.
    struct GatedSaleFeed {
        inner: InMemorySaleFeed,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl SaleFeed for GatedSaleFeed {
        fn sales_in(&self, window: &PeriodWindow) -> mcre_core::Result<Vec<SaleEvent>> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            self.inner.sales_in(window)
        }
    }

    let (participants, sales) = three_level_line();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let stores = EngineStores {
        participants: Arc::new(InMemoryParticipantRepository::new(participants)),
        sales: Arc::new(GatedSaleFeed {
            inner: InMemorySaleFeed::new(sales),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }),
        plans: Arc::new(StaticMembershipPlans::new()),
        ledger: Arc::new(InMemoryCommissionLedger::new()),
        runs: Arc::new(InMemoryRunRegistry::new()),
        clock: Arc::new(FixedClock::new(at(2024, 11, 1))),
    };
    let orchestrator =
        Arc::new(CommissionRunOrchestrator::new(EngineConfig::default(), stores).unwrap());

    let background = {
        let orchestrator = Arc::clone(&orchestrator);
        thread::spawn(move || orchestrator.run_period(RunType::Monthly, "2024-10"))
    };
    entered_rx.recv().unwrap();

    let err = orchestrator
        .run_period_with(RunRequest::new(RunType::Monthly, "2024-10").forced())
        .unwrap_err();
    assert!(matches!(err, McreError::IdempotencyConflict { .. }));

    release_tx.send(()).unwrap();
    let run = background.join().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[test]
fn completion_markers_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.jsonl");
    let (participants, sales) = three_level_line();

    let stores = |runs: Arc<dyn RunRegistry>, ledger: Arc<dyn CommissionLedger>| EngineStores {
        participants: Arc::new(InMemoryParticipantRepository::new(participants.clone())),
        sales: Arc::new(InMemorySaleFeed::new(sales.clone())),
        plans: Arc::new(StaticMembershipPlans::new()),
        ledger,
        runs,
        clock: Arc::new(FixedClock::new(at(2024, 11, 1))),
    };

    let first_ledger: Arc<dyn CommissionLedger> = Arc::new(InMemoryCommissionLedger::new());
    let registry: Arc<dyn RunRegistry> = Arc::new(FileRunRegistry::open(&path).unwrap());
    let orchestrator =
        CommissionRunOrchestrator::new(EngineConfig::default(), stores(registry, first_ledger))
            .unwrap();
    let first = orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();
    assert_eq!(first.participants_processed, 3);
    drop(orchestrator);

    let second_ledger = Arc::new(InMemoryCommissionLedger::new());
    let reopened: Arc<dyn RunRegistry> = Arc::new(FileRunRegistry::open(&path).unwrap());
    let orchestrator = CommissionRunOrchestrator::new(
        EngineConfig::default(),
        stores(reopened, second_ledger.clone() as Arc<dyn CommissionLedger>),
    )
    .unwrap();

    let err = orchestrator
        .run_period(RunType::Monthly, "2024-10")
        .unwrap_err();
    assert!(matches!(err, McreError::IdempotencyConflict { .. }));

    let rerun = orchestrator
        .run_period_with(RunRequest::new(RunType::Monthly, "2024-10").forced())
        .unwrap();
    assert_eq!(rerun.participants_processed, 0);
    assert!(second_ledger.all().unwrap().is_empty());
}

#[test]
fn lost_completion_marker_never_credits_twice() {
    /// Registry whose `fail_on`-th `mark_processed` call fails.
    struct FlakyMarkers {
        inner: InMemoryRunRegistry,
        calls: AtomicUsize,
        fail_on: usize,
    }

    impl RunRegistry for FlakyMarkers {
        fn find_completed(&self, key: &RunKey) -> mcre_core::Result<Option<CommissionRun>> {
            self.inner.find_completed(key)
        }

        fn processed(&self, key: &RunKey) -> mcre_core::Result<BTreeSet<ParticipantId>> {
            self.inner.processed(key)
        }

        fn mark_processed(
            &self,
            key: &RunKey,
            participant: ParticipantId,
        ) -> mcre_core::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(McreError::Storage("marker write failed".into()));
            }
            self.inner.mark_processed(key, participant)
        }

        fn persist(&self, run: &CommissionRun) -> mcre_core::Result<()> {
            self.inner.persist(run)
        }

        fn next_run_id(&self) -> mcre_core::Result<RunId> {
            self.inner.next_run_id()
        }
    }

    let participants = vec![veteran(1, None), veteran(2, Some(1))];
    let sales = vec![sale(1, 2, 1_000, at(2024, 10, 15))];
    let ledger = Arc::new(InMemoryCommissionLedger::new());
    let stores = EngineStores {
        participants: Arc::new(InMemoryParticipantRepository::new(participants)),
        sales: Arc::new(InMemorySaleFeed::new(sales)),
        plans: Arc::new(StaticMembershipPlans::new()),
        ledger: ledger.clone(),
        runs: Arc::new(FlakyMarkers {
            inner: InMemoryRunRegistry::new(),
            calls: AtomicUsize::new(0),
            fail_on: 2,
        }),
        clock: Arc::new(FixedClock::new(at(2024, 11, 1))),
    };
    let orchestrator = CommissionRunOrchestrator::new(EngineConfig::default(), stores).unwrap();
    let earned_by_root = || -> Decimal {
        ledger
            .entries_for(ParticipantId(1))
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .sum()
    };

    // Participant 2's marker write fails: its sale must not be credited.
    let first = orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();
    assert_eq!(first.status, RunStatus::CompletedWithErrors);
    assert_eq!(first.participants_processed, 1);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].participant, ParticipantId(2));
    assert_eq!(first.errors[0].kind, FailureKind::Storage);
    assert_eq!(first.total_commissions, Decimal::ZERO);
    assert!(ledger.all().unwrap().is_empty());

    let rerun = orchestrator
        .run_period_with(RunRequest::new(RunType::Monthly, "2024-10").forced())
        .unwrap();
    assert_eq!(rerun.status, RunStatus::Completed);
    assert_eq!(rerun.participants_processed, 1);
    assert_eq!(rerun.total_commissions, Decimal::from(150));
    assert_eq!(earned_by_root(), Decimal::from(150));
}

// =============================================================================
// Partial failure
// =============================================================================

#[test]
fn corrupt_participants_are_skipped_and_reported() {
    let (participants, sales) = hundred_with_three_dangling();
    let h = Harness::new(EngineConfig::default(), participants, sales);

    let run = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();

    assert_eq!(run.status, RunStatus::CompletedWithErrors);
    assert_eq!(run.participants_processed, 97);
    assert_eq!(run.errors.len(), 3);
    let failed: Vec<_> = run.errors.iter().map(|e| e.participant).collect();
    assert_eq!(
        failed,
        vec![ParticipantId(98), ParticipantId(99), ParticipantId(100)]
    );
    assert!(run
        .errors
        .iter()
        .all(|e| e.kind == FailureKind::DataIntegrity));

    // 96 sales of 100 credit the root with a 10 direct and a 5 override each.
    assert_eq!(h.earned_by(1), Decimal::from(96 * 15));
    for id in 98..=100 {
        assert!(h.ledger.entries_for(ParticipantId(id)).unwrap().is_empty());
    }
}

#[test]
fn too_many_failures_fail_the_run_without_writes() {
    let config = EngineConfig::builder().max_error_bps(100).build().unwrap();
    let (participants, sales) = hundred_with_three_dangling();
    let h = Harness::new(config, participants, sales);

    let run = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.participants_processed, 0);
    assert_eq!(run.errors.len(), 3);
    assert!(h.ledger.all().unwrap().is_empty());
    assert_eq!(h.participant(1).team_volume, Decimal::ZERO);

    // A failed run is recorded but does not count as completed.
    let runs = h.runs.runs().unwrap();
    assert_eq!(runs.len(), 1);
    assert!(h.runs.find_completed(&run.key).unwrap().is_none());
    assert_eq!(h.orchestrator.metrics().runs_failed.get(), 1);
}

#[test]
fn cancelled_run_can_be_resumed() {
    let (participants, sales) = three_level_line();
    let h = Harness::new(EngineConfig::default(), participants, sales);

    let token = CancellationToken::new();
    token.cancel();
    let cancelled = h
        .orchestrator
        .run_period_with(RunRequest::new(RunType::Monthly, "2024-10").with_cancel(token))
        .unwrap();

    assert_eq!(cancelled.status, RunStatus::CompletedWithErrors);
    assert_eq!(cancelled.aborted, Some(mcre_core::AbortReason::Cancelled));
    assert_eq!(cancelled.participants_processed, 0);
    assert!(cancelled
        .errors
        .iter()
        .all(|e| e.kind == FailureKind::Aborted));
    assert!(h.ledger.all().unwrap().is_empty());

    let resumed = h
        .orchestrator
        .run_period_with(RunRequest::new(RunType::Monthly, "2024-10").forced())
        .unwrap();
    assert_eq!(resumed.participants_processed, 3);
    assert_eq!(resumed.total_commissions, Decimal::from(200));
}

#[test]
fn expired_deadline_aborts_remaining_participants() {
    let (participants, sales) = three_level_line();
    let config = EngineConfig::builder()
        .run_deadline(std::time::Duration::ZERO)
        .build()
        .unwrap();
    let h = Harness::new(config, participants, sales);

    let run = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();

    assert_eq!(run.status, RunStatus::CompletedWithErrors);
    assert_eq!(run.aborted, Some(mcre_core::AbortReason::DeadlineExceeded));
    assert_eq!(run.participants_processed, 0);
    assert_eq!(run.errors.len(), 3);
    assert!(run.errors.iter().all(|e| e.kind == FailureKind::Aborted));
    assert!(h.ledger.all().unwrap().is_empty());
    assert!(h.runs.processed(&run.key).unwrap().is_empty());
}

// =============================================================================
// Earnings caps
// =============================================================================

#[test]
fn plan_cap_clamps_commission() {
    let basic = PlanId::new("basic");
    let (mut participants, sales) = three_level_line();
    participants[1] = veteran(2, Some(1)).with_plan(basic.clone());
    let plans = StaticMembershipPlans::new().with_plan(basic, Some(Decimal::from(120)));
    let h = Harness::with_plans(EngineConfig::default(), participants, sales, plans);

    let run = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();

    assert_eq!(run.entries_clamped, 1);
    assert_eq!(h.earned_by(2), Decimal::from(120));
    assert_eq!(run.total_commissions, Decimal::from(170));

    let sponsor = h.participant(2);
    assert_eq!(sponsor.current_plan_earnings, Decimal::from(120));
    assert!(sponsor.earnings_cap_reached);
    assert!(sponsor.cap_warning_sent);
}

#[test]
fn recipient_already_at_cap_gets_zero_entries() {
    let basic = PlanId::new("basic");
    let (mut participants, sales) = three_level_line();
    let mut capped = veteran(2, Some(1)).with_plan(basic.clone());
    capped.current_plan_earnings = Decimal::from(100);
    capped.earnings_cap_reached = true;
    capped.cap_warning_sent = true;
    participants[1] = capped;
    let plans = StaticMembershipPlans::new().with_plan(basic, Some(Decimal::from(100)));
    let h = Harness::with_plans(EngineConfig::default(), participants, sales, plans);

    let run = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();

    // Direct and override to participant 2 are both clamped to zero but still recorded.
    let entries = h.ledger.entries_for(ParticipantId(2)).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|e| e.amount == Decimal::ZERO && e.status == EntryStatus::Pending));
    assert_eq!(run.entries_clamped, 2);
    assert_eq!(run.total_commissions, Decimal::from(50));
    assert_eq!(h.participant(2).current_plan_earnings, Decimal::from(100));
}

#[test]
fn metrics_track_completed_runs() {
    let (participants, sales) = three_level_line();
    let h = Harness::new(EngineConfig::default(), participants, sales);

    let run = h.orchestrator.run_period(RunType::Monthly, "2024-10").unwrap();

    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.runs_total.get(), 1);
    assert_eq!(metrics.participants_processed.get(), 3);
    assert_eq!(metrics.entries_created.get(), run.entries_created as u64);
    assert_eq!(metrics.get_entries("override"), 2);
    assert_eq!(metrics.active_runs.get(), 0);
    assert!(metrics.render_prometheus().contains("mcre_runs_total 1"));
}
