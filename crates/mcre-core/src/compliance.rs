//! Cooling-off window and refund policy.
//!
//! Both operations are pure functions of a participant, the configuration and `now`; they
//! are served independently of commission runs.

use crate::config::{ComplianceConfig, EngineConfig};
use crate::money::{ensure_non_negative, floor_to_scale};
use crate::period::whole_days_between;
use crate::types::{Participant, ParticipantId};
use crate::{McreError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

/// What a participant may not do while cooling off. Recruiting is never restricted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoolingOffRestrictions {
    pub commission_earning: bool,
    pub payout_requests: bool,
    pub rank_advancement: bool,
    pub recruiting: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoolingOffStatus {
    pub end_date: DateTime<Utc>,
    /// Started days left, 0 once the window has ended.
    pub days_remaining: i64,
    pub is_active: bool,
    pub restrictions: CoolingOffRestrictions,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Approved,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    TimeExpired,
    InvalidReason,
}

/// Input of a refund request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefundApplication {
    pub participant: ParticipantId,
    pub reason: String,
    pub amount: Decimal,
    pub purchased_at: DateTime<Utc>,
    pub product: String,
}

/// Decided refund request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub participant: ParticipantId,
    pub reason: String,
    pub amount_requested: Decimal,
    pub purchased_at: DateTime<Utc>,
    pub product: String,
    pub eligible: bool,
    pub approved_amount: Decimal,
    pub processing_fee: Decimal,
    pub net_refund: Decimal,
    pub status: RefundStatus,
    pub rejection: Option<RejectionCode>,
    pub decided_at: DateTime<Utc>,
}

pub struct CompliancePolicy<'a> {
    config: &'a ComplianceConfig,
    currency_scale: u32,
}

impl<'a> CompliancePolicy<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config: &config.compliance,
            currency_scale: config.commission.currency_scale,
        }
    }

    pub fn cooling_off_status(
        &self,
        participant: &Participant,
        now: DateTime<Utc>,
    ) -> CoolingOffStatus {
        let end_date = participant.cooling_off_end(self.config.cooling_off_days);
        let is_active = now < end_date;
        let days_remaining = if is_active {
            let left = end_date - now;
            let whole = left.num_days();
            if left > chrono::Duration::days(whole) {
                whole + 1
            } else {
                whole
            }
        } else {
            0
        };
        CoolingOffStatus {
            end_date,
            days_remaining,
            is_active,
            restrictions: CoolingOffRestrictions {
                commission_earning: is_active,
                payout_requests: is_active,
                rank_advancement: is_active,
                recruiting: false,
            },
        }
    }

    /// Decide a refund request.
    ///
    /// Preconditions:
    /// - `application.product` has a configured refund policy.
    /// - `application.amount >= 0` and the purchase is not in the future.
    ///
    /// Rejections (`TimeExpired`, `InvalidReason`) are returned as decided requests, not errors.
    pub fn request_refund(
        &self,
        application: RefundApplication,
        now: DateTime<Utc>,
    ) -> Result<RefundRequest> {
        let policy = self
            .config
            .refund_policies
            .get(&application.product)
            .ok_or_else(|| {
                McreError::Validation(format!("unknown product type: {}", application.product))
            })?;
        ensure_non_negative("refund amount", application.amount)?;
        if application.purchased_at > now {
            return Err(McreError::Validation(
                "purchase date is in the future".into(),
            ));
        }

        let reason = application.reason.as_str();
        let age_days = whole_days_between(application.purchased_at, now);

        let (approved, fee, rejection) = if self.config.window_bypass_reasons.contains(reason) {
            (application.amount, policy.processing_fee, None)
        } else if !self.config.standard_reasons.contains(reason) {
            (Decimal::ZERO, Decimal::ZERO, Some(RejectionCode::InvalidReason))
        } else if age_days > policy.window_days {
            (Decimal::ZERO, Decimal::ZERO, Some(RejectionCode::TimeExpired))
        } else {
            let approved = policy
                .max_refund_fraction
                .apply(application.amount, self.currency_scale);
            (approved, policy.processing_fee, None)
        };

        let approved = floor_to_scale(approved, self.currency_scale);
        let net_refund = (approved - fee).max(Decimal::ZERO);
        let status = if rejection.is_none() {
            RefundStatus::Approved
        } else {
            RefundStatus::Rejected
        };

        info!(
            participant = %application.participant,
            product = %application.product,
            reason,
            status = ?status,
            approved = %approved,
            "Refund request decided"
        );

        Ok(RefundRequest {
            participant: application.participant,
            reason: application.reason,
            amount_requested: application.amount,
            purchased_at: application.purchased_at,
            product: application.product,
            eligible: rejection.is_none(),
            approved_amount: approved,
            processing_fee: fee,
            net_refund,
            status,
            rejection,
            decided_at: now,
        })
    }
}
