//! Commission calculation.
//!
//! Pure functions of a snapshot: nothing here reads a store or mutates a participant. The
//! output is a list of drafts which the run later passes through the earnings cap guard
//! before anything is persisted.

use crate::config::EngineConfig;
use crate::genealogy::GenealogySnapshot;
use crate::money::floor_to_scale;
use crate::period::RunKey;
use crate::types::{
    CommissionSource, CommissionType, NewCommissionEntry, Participant, ParticipantId, Rank,
    SaleEvent,
};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;

/// A commission owed, before cap clamping and persistence.
#[derive(Clone, Debug, PartialEq)]
pub struct CommissionDraft {
    pub recipient: ParticipantId,
    pub source: CommissionSource,
    pub kind: CommissionType,
    pub level: u8,
    pub amount: Decimal,
    pub release_at: DateTime<Utc>,
}

impl CommissionDraft {
    /// Ledger form with `amount` replaced by the capped amount.
    pub fn into_entry(
        self,
        amount: Decimal,
        created_at: DateTime<Utc>,
        run_key: Option<RunKey>,
    ) -> NewCommissionEntry {
        NewCommissionEntry {
            recipient: self.recipient,
            source: self.source,
            amount,
            kind: self.kind,
            level: self.level,
            created_at,
            release_at: self.release_at,
            run_key,
        }
    }
}

pub struct CommissionCalculator<'a> {
    config: &'a EngineConfig,
    now: DateTime<Utc>,
}

impl<'a> CommissionCalculator<'a> {
    pub fn new(config: &'a EngineConfig, now: DateTime<Utc>) -> Self {
        Self { config, now }
    }

    fn scale(&self) -> u32 {
        self.config.commission.currency_scale
    }

    /// Entries are held for the holding period, and never released before the recipient's
    /// cooling-off window ends. Recipients still in that window are not credited at all, so
    /// for credited entries the holding period decides.
    pub fn release_at(&self, recipient: &Participant) -> DateTime<Utc> {
        let held = self.now + Duration::days(self.config.commission.holding_period_days);
        held.max(recipient.cooling_off_end(self.config.compliance.cooling_off_days))
    }

    /// Participants inside their cooling-off window earn nothing.
    fn earning_restricted(&self, participant: &Participant) -> bool {
        self.now < participant.cooling_off_end(self.config.compliance.cooling_off_days)
    }

    fn eligible<'g>(
        &self,
        genealogy: &'g GenealogySnapshot,
        id: ParticipantId,
    ) -> Option<&'g Participant> {
        genealogy.participant(id).filter(|p| {
            p.active && genealogy.integrity_fault(id).is_none() && !self.earning_restricted(p)
        })
    }

    fn draft(
        &self,
        recipient: &Participant,
        source: CommissionSource,
        kind: CommissionType,
        level: u8,
        amount: Decimal,
    ) -> Option<CommissionDraft> {
        let amount = floor_to_scale(amount, self.scale());
        if amount <= Decimal::ZERO {
            return None;
        }
        Some(CommissionDraft {
            recipient: recipient.id,
            source,
            kind,
            level,
            amount,
            release_at: self.release_at(recipient),
        })
    }

    /// Direct, matching and override drafts generated by one sale.
    ///
    /// Fails with `DataIntegrity` when the actor's upline runs into a sponsor cycle.
    pub fn for_sale(
        &self,
        genealogy: &GenealogySnapshot,
        sale: &SaleEvent,
    ) -> Result<Vec<CommissionDraft>> {
        let commission = &self.config.commission;
        let source = CommissionSource::Sale(sale.id);
        let chain = genealogy.ancestors(sale.actor, self.config.genealogy.max_ancestor_depth)?;
        let mut drafts = Vec::new();

        let direct = chain.first().and_then(|&sponsor| {
            let recipient = self.eligible(genealogy, sponsor)?;
            self.draft(
                recipient,
                source,
                CommissionType::Direct,
                0,
                sale.amount * commission.direct_rate.get(),
            )
        });

        if let Some(direct) = direct {
            let matching = chain.get(1).and_then(|&upline| {
                let recipient = self.eligible(genealogy, upline)?;
                self.draft(
                    recipient,
                    source,
                    CommissionType::Matching,
                    0,
                    direct.amount * commission.matching_rate.get(),
                )
            });
            drafts.push(direct);
            drafts.extend(matching);
        }

        // Position in the chain fixes the level; a skipped ancestor forfeits its tier.
        let mut paid = HashSet::new();
        for (idx, (ancestor, tier)) in chain.iter().zip(&commission.override_levels).enumerate() {
            let Some(recipient) = self.eligible(genealogy, *ancestor) else {
                continue;
            };
            if recipient.rank < tier.min_rank || !paid.insert(recipient.id) {
                continue;
            }
            let level = u8::try_from(idx + 1).unwrap_or(u8::MAX);
            drafts.extend(self.draft(
                recipient,
                source,
                CommissionType::Override,
                level,
                sale.amount * tier.rate.get(),
            ));
        }

        Ok(drafts)
    }

    /// Leadership commission on the participant's own team volume at its current rank.
    pub fn leadership(
        &self,
        participant: &Participant,
        team_volume: Decimal,
    ) -> Option<CommissionDraft> {
        let rate = self.config.commission.leadership_rate(participant.rank);
        if rate.is_zero() || self.earning_restricted(participant) {
            return None;
        }
        self.draft(
            participant,
            CommissionSource::Participant(participant.id),
            CommissionType::Leadership,
            0,
            team_volume * rate.get(),
        )
    }

    /// One-time bonus for reaching `new_rank` for the first time.
    pub fn rank_bonus(&self, participant: &Participant, new_rank: Rank) -> Option<CommissionDraft> {
        if new_rank <= participant.highest_rank || self.earning_restricted(participant) {
            return None;
        }
        let bonus = self
            .config
            .commission
            .rank_advancement_bonus
            .get(&new_rank)
            .copied()?;
        self.draft(
            participant,
            CommissionSource::Participant(participant.id),
            CommissionType::Bonus,
            0,
            bonus,
        )
    }
}
