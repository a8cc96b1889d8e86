//! Configuration management for the engine.
//!
//! Every rate table, rank requirement, protection limit and refund policy the engine uses is
//! configuration passed in explicitly; no component carries business literals of its own.
//!
//! # Configuration Sources
//!
//! - Environment variables (prefixed with `MCRE_`) for operational knobs
//! - JSON documents (`EngineConfig::from_json_str`)
//! - Programmatic defaults and the builder
//!
//! # Example
//!
//! ```rust,ignore
//! use mcre_core::config::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .worker_threads(8)
//!     .max_error_bps(2_500)
//!     .build()?;
//! ```

use crate::money::{Rate, MAX_CURRENCY_SCALE};
use crate::types::{ProtectionPolicy, Rank, RankRequirement};
use crate::{McreError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Upper bound on worker threads for a run.
pub const MAX_WORKER_THREADS: usize = 256;

/// Upper bound on how far up the tree any traversal may walk.
pub const MAX_ANCESTOR_DEPTH: usize = 32;

/// Complete engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Commission rate tables.
    pub commission: CommissionConfig,

    /// Tree traversal bounds.
    pub genealogy: GenealogyConfig,

    /// Rank requirements and protection policy.
    pub ranks: RankConfig,

    /// Commission run execution.
    pub run: RunConfig,

    /// Cooling-off and refund policy.
    pub compliance: ComplianceConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Create a new configuration builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load configuration from environment variables on top of the defaults.
    ///
    /// Looks for variables prefixed with `MCRE_`:
    /// - `MCRE_WORKER_THREADS` - Worker threads per run
    /// - `MCRE_RUN_DEADLINE_MS` - Overall run deadline in milliseconds
    /// - `MCRE_MAX_ERROR_BPS` - Failure ratio (bps) above which a run fails outright
    /// - `MCRE_MAX_ANCESTOR_DEPTH` - Ancestor chain bound
    /// - `MCRE_LOG_LEVEL` - Logging level (trace, debug, info, warn, error)
    /// - `MCRE_LOG_JSON` - `true` for JSON log lines
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("MCRE_WORKER_THREADS") {
            config.run.worker_threads = v.parse().map_err(|e| {
                McreError::ConfigError(format!("Invalid MCRE_WORKER_THREADS: {}", e))
            })?;
        }

        if let Ok(v) = std::env::var("MCRE_RUN_DEADLINE_MS") {
            config.run.deadline_ms = Some(v.parse().map_err(|e| {
                McreError::ConfigError(format!("Invalid MCRE_RUN_DEADLINE_MS: {}", e))
            })?);
        }

        if let Ok(v) = std::env::var("MCRE_MAX_ERROR_BPS") {
            config.run.max_error_bps = v.parse().map_err(|e| {
                McreError::ConfigError(format!("Invalid MCRE_MAX_ERROR_BPS: {}", e))
            })?;
        }

        if let Ok(v) = std::env::var("MCRE_MAX_ANCESTOR_DEPTH") {
            config.genealogy.max_ancestor_depth = v.parse().map_err(|e| {
                McreError::ConfigError(format!("Invalid MCRE_MAX_ANCESTOR_DEPTH: {}", e))
            })?;
        }

        if let Ok(level) = std::env::var("MCRE_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(v) = std::env::var("MCRE_LOG_JSON") {
            config.logging.json_output = v.parse().map_err(|e| {
                McreError::ConfigError(format!("Invalid MCRE_LOG_JSON: {}", e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document. Missing sections take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| McreError::ConfigError(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let c = &self.commission;

        if c.override_levels.len() > self.genealogy.max_ancestor_depth {
            return Err(McreError::ConfigError(format!(
                "override_levels ({}) deeper than max_ancestor_depth ({})",
                c.override_levels.len(),
                self.genealogy.max_ancestor_depth
            )));
        }
        if c.override_levels.len() > usize::from(u8::MAX) {
            return Err(McreError::ConfigError("too many override levels".into()));
        }
        if c.currency_scale > MAX_CURRENCY_SCALE {
            return Err(McreError::ConfigError(format!(
                "currency_scale must be at most {}",
                MAX_CURRENCY_SCALE
            )));
        }
        if c.holding_period_days < 0 {
            return Err(McreError::ConfigError(
                "holding_period_days must not be negative".into(),
            ));
        }
        for (rank, bonus) in &c.rank_advancement_bonus {
            if bonus.is_sign_negative() && !bonus.is_zero() {
                return Err(McreError::ConfigError(format!(
                    "rank_advancement_bonus for {} must not be negative",
                    rank
                )));
            }
        }

        // Validate genealogy bounds
        if self.genealogy.max_ancestor_depth == 0
            || self.genealogy.max_ancestor_depth > MAX_ANCESTOR_DEPTH
        {
            return Err(McreError::ConfigError(format!(
                "max_ancestor_depth must be between 1 and {}",
                MAX_ANCESTOR_DEPTH
            )));
        }
        if self.genealogy.max_descendant_depth == 0 {
            return Err(McreError::ConfigError(
                "max_descendant_depth must be greater than 0".into(),
            ));
        }

        self.ranks.validate()?;

        // Validate run
        if self.run.worker_threads == 0 || self.run.worker_threads > MAX_WORKER_THREADS {
            return Err(McreError::ConfigError(format!(
                "worker_threads must be between 1 and {}",
                MAX_WORKER_THREADS
            )));
        }
        if self.run.max_error_bps > 10_000 {
            return Err(McreError::ConfigError(
                "max_error_bps must be at most 10000".into(),
            ));
        }

        self.compliance.validate()?;

        Ok(())
    }
}

/// One override tier: rate paid at this level and the minimum rank to receive it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideLevel {
    pub rate: Rate,
    pub min_rank: Rank,
}

/// Commission rate tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionConfig {
    /// Paid to the immediate sponsor on every qualifying sale.
    pub direct_rate: Rate,

    /// Override tiers; index 0 is level 1 (the sponsor).
    pub override_levels: Vec<OverrideLevel>,

    /// Leadership rate by recipient rank; absent ranks earn nothing.
    pub leadership_rates: BTreeMap<Rank, Rate>,

    /// Fraction of a downline's direct commission paid to that downline's sponsor.
    pub matching_rate: Rate,

    /// One-time bonus paid on first promotion to a rank.
    pub rank_advancement_bonus: BTreeMap<Rank, Decimal>,

    /// Days between creation and release of an entry.
    pub holding_period_days: i64,

    /// Decimal places of the smallest currency unit.
    pub currency_scale: u32,
}

impl CommissionConfig {
    pub fn leadership_rate(&self, rank: Rank) -> Rate {
        self.leadership_rates.get(&rank).copied().unwrap_or(Rate::ZERO)
    }
}

fn bps(v: u32) -> Rate {
    Rate::from_bps(v).unwrap_or(Rate::ZERO)
}

impl Default for CommissionConfig {
    fn default() -> Self {
        let level = |b, min_rank| OverrideLevel {
            rate: bps(b),
            min_rank,
        };
        Self {
            direct_rate: bps(1_000),
            override_levels: vec![
                level(500, Rank::Starter),
                level(300, Rank::Bronze),
                level(200, Rank::Silver),
                level(100, Rank::Gold),
                level(100, Rank::Gold),
            ],
            leadership_rates: BTreeMap::from([
                (Rank::Silver, bps(100)),
                (Rank::Gold, bps(200)),
                (Rank::Platinum, bps(300)),
                (Rank::Diamond, bps(400)),
            ]),
            matching_rate: bps(1_000),
            rank_advancement_bonus: BTreeMap::new(),
            holding_period_days: 30,
            currency_scale: crate::money::DEFAULT_CURRENCY_SCALE,
        }
    }
}

/// Tree traversal bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GenealogyConfig {
    /// Longest ancestor chain read for one event.
    pub max_ancestor_depth: usize,

    /// Deepest level of the subtree summed into team volume.
    pub max_descendant_depth: usize,
}

impl Default for GenealogyConfig {
    fn default() -> Self {
        Self {
            max_ancestor_depth: 5,
            max_descendant_depth: 64,
        }
    }
}

/// Rank requirements and demotion protection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RankConfig {
    pub requirements: BTreeMap<Rank, RankRequirement>,
    pub protection: ProtectionPolicy,
}

impl RankConfig {
    fn validate(&self) -> Result<()> {
        let mut prev: Option<(Rank, &RankRequirement)> = None;
        for rank in Rank::ALL {
            let req = self.requirements.get(&rank).ok_or_else(|| {
                McreError::ConfigError(format!("missing rank requirement for {}", rank))
            })?;
            if req.min_personal_volume.is_sign_negative()
                || req.min_team_volume.is_sign_negative()
            {
                return Err(McreError::ConfigError(format!(
                    "rank requirement for {} has negative volume",
                    rank
                )));
            }
            if let Some((prev_rank, p)) = prev {
                if req.min_direct_referrals < p.min_direct_referrals
                    || req.min_personal_volume < p.min_personal_volume
                    || req.min_team_volume < p.min_team_volume
                {
                    return Err(McreError::ConfigError(format!(
                        "rank requirement for {} is weaker than {}",
                        rank, prev_rank
                    )));
                }
            }
            prev = Some((rank, req));
        }
        if self.protection.limit(Rank::Starter) != 0 {
            return Err(McreError::ConfigError(
                "starter rank cannot carry demotion protections".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RankConfig {
    fn default() -> Self {
        let req = |directs, pv: i64, tv: i64| RankRequirement {
            min_direct_referrals: directs,
            min_personal_volume: Decimal::from(pv),
            min_team_volume: Decimal::from(tv),
        };
        Self {
            requirements: BTreeMap::from([
                (Rank::Starter, req(0, 0, 0)),
                (Rank::Bronze, req(2, 100, 500)),
                (Rank::Silver, req(4, 200, 2_000)),
                (Rank::Gold, req(6, 300, 10_000)),
                (Rank::Platinum, req(8, 400, 50_000)),
                (Rank::Diamond, req(10, 500, 250_000)),
            ]),
            protection: ProtectionPolicy::default(),
        }
    }
}

/// Commission run execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Size of the worker pool evaluating participants.
    pub worker_threads: usize,

    /// Failure ratio, in basis points of attempted participants, above which the whole run
    /// fails and nothing is committed.
    pub max_error_bps: u16,

    /// Overall run deadline; remaining participants are aborted when it passes.
    pub deadline_ms: Option<u64>,
}

impl RunConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_error_bps: 5_000,
            deadline_ms: None,
        }
    }
}

/// Refund terms for one product type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundPolicy {
    pub window_days: i64,
    pub max_refund_fraction: Rate,
    pub processing_fee: Decimal,
    /// Membership fees refund in full.
    #[serde(default)]
    pub membership_fee: bool,
}

/// Cooling-off window and refund policy tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub cooling_off_days: i64,

    /// Product type -> refund terms.
    pub refund_policies: BTreeMap<String, RefundPolicy>,

    /// Reasons approved in full regardless of purchase age.
    pub window_bypass_reasons: BTreeSet<String>,

    /// Reasons approved when the purchase is inside the product's window.
    pub standard_reasons: BTreeSet<String>,
}

impl ComplianceConfig {
    fn validate(&self) -> Result<()> {
        if self.cooling_off_days < 0 {
            return Err(McreError::ConfigError(
                "cooling_off_days must not be negative".into(),
            ));
        }
        for (product, policy) in &self.refund_policies {
            if policy.window_days < 0 {
                return Err(McreError::ConfigError(format!(
                    "refund window for {} must not be negative",
                    product
                )));
            }
            if policy.processing_fee.is_sign_negative() && !policy.processing_fee.is_zero() {
                return Err(McreError::ConfigError(format!(
                    "processing fee for {} must not be negative",
                    product
                )));
            }
            if policy.membership_fee && policy.max_refund_fraction != Rate::ONE {
                return Err(McreError::ConfigError(format!(
                    "membership fee product {} must refund in full",
                    product
                )));
            }
        }
        if let Some(r) = self
            .window_bypass_reasons
            .intersection(&self.standard_reasons)
            .next()
        {
            return Err(McreError::ConfigError(format!(
                "refund reason {} listed as both bypass and standard",
                r
            )));
        }
        Ok(())
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        let policy = |window_days, fraction_bps, fee_cents: i64, membership_fee| RefundPolicy {
            window_days,
            max_refund_fraction: bps(fraction_bps),
            processing_fee: Decimal::new(fee_cents, 2),
            membership_fee,
        };
        Self {
            cooling_off_days: 14,
            refund_policies: BTreeMap::from([
                ("membership_fee".to_string(), policy(14, 10_000, 0, true)),
                ("marketing_tools".to_string(), policy(7, 8_000, 500, false)),
                ("training_course".to_string(), policy(30, 7_500, 1_000, false)),
                ("starter_kit".to_string(), policy(30, 9_000, 250, false)),
            ]),
            window_bypass_reasons: BTreeSet::from([
                "billing_error".to_string(),
                "duplicate_charge".to_string(),
            ]),
            standard_reasons: BTreeSet::from([
                "changed_mind".to_string(),
                "cooling_off_cancellation".to_string(),
                "dissatisfied".to_string(),
                "not_as_described".to_string(),
            ]),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (e.g. `info,mcre_core::orchestrator=debug`).
    pub level: String,

    /// Whether to include timestamps in logs.
    pub include_timestamps: bool,

    /// JSON output format.
    pub json_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            include_timestamps: true,
            json_output: false,
        }
    }
}

/// Builder for EngineConfig.
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn direct_rate(mut self, rate: Rate) -> Self {
        self.config.commission.direct_rate = rate;
        self
    }

    pub fn override_levels(mut self, levels: Vec<OverrideLevel>) -> Self {
        self.config.commission.override_levels = levels;
        self
    }

    pub fn leadership_rate(mut self, rank: Rank, rate: Rate) -> Self {
        self.config.commission.leadership_rates.insert(rank, rate);
        self
    }

    pub fn matching_rate(mut self, rate: Rate) -> Self {
        self.config.commission.matching_rate = rate;
        self
    }

    pub fn rank_advancement_bonus(mut self, rank: Rank, amount: Decimal) -> Self {
        self.config.commission.rank_advancement_bonus.insert(rank, amount);
        self
    }

    pub fn holding_period_days(mut self, days: i64) -> Self {
        self.config.commission.holding_period_days = days;
        self
    }

    pub fn rank_requirement(mut self, rank: Rank, requirement: RankRequirement) -> Self {
        self.config.ranks.requirements.insert(rank, requirement);
        self
    }

    pub fn protection_limit(mut self, rank: Rank, limit: u32) -> Self {
        self.config.ranks.protection.0.insert(rank, limit);
        self
    }

    pub fn max_ancestor_depth(mut self, depth: usize) -> Self {
        self.config.genealogy.max_ancestor_depth = depth;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.run.worker_threads = threads;
        self
    }

    pub fn max_error_bps(mut self, bps: u16) -> Self {
        self.config.run.max_error_bps = bps;
        self
    }

    pub fn run_deadline(mut self, deadline: Duration) -> Self {
        self.config.run.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn cooling_off_days(mut self, days: i64) -> Self {
        self.config.compliance.cooling_off_days = days;
        self
    }

    pub fn refund_policy(mut self, product: impl Into<String>, policy: RefundPolicy) -> Self {
        self.config
            .compliance
            .refund_policies
            .insert(product.into(), policy);
        self
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Enable JSON log output.
    pub fn json_logs(mut self, enabled: bool) -> Self {
        self.config.logging.json_output = enabled;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
