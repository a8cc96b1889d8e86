//! Period-bounded sales volume.

use crate::genealogy::GenealogySnapshot;
use crate::period::PeriodWindow;
use crate::types::{ParticipantId, SaleEvent};
use crate::{McreError, Result};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Sales of one period, grouped by actor.
///
/// Only events with `window.start <= occurred_at < window.end` are kept, so two snapshots
/// built over the same feed and window are identical no matter when they are built.
#[derive(Clone, Debug, Default)]
pub struct VolumeSnapshot {
    window: Option<PeriodWindow>,
    sales: BTreeMap<ParticipantId, Vec<SaleEvent>>,
    personal: BTreeMap<ParticipantId, Decimal>,
    corrupt: BTreeSet<ParticipantId>,
}

impl VolumeSnapshot {
    pub fn build(window: PeriodWindow, events: Vec<SaleEvent>) -> Self {
        let mut snapshot = VolumeSnapshot {
            window: Some(window),
            ..Default::default()
        };

        for event in events {
            if !window.contains(event.occurred_at) {
                continue;
            }
            if event.amount.is_sign_negative() && !event.amount.is_zero() {
                warn!(
                    participant = %event.actor,
                    event = event.id.0,
                    amount = %event.amount,
                    "Negative sale amount in feed"
                );
                snapshot.corrupt.insert(event.actor);
                continue;
            }
            *snapshot.personal.entry(event.actor).or_default() += event.amount;
            snapshot.sales.entry(event.actor).or_default().push(event);
        }

        for list in snapshot.sales.values_mut() {
            list.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
        }
        snapshot
    }

    pub fn window(&self) -> Option<PeriodWindow> {
        self.window
    }

    pub fn personal_volume(&self, id: ParticipantId) -> Decimal {
        self.personal.get(&id).copied().unwrap_or_default()
    }

    /// Sum of personal volume over the downline of `id`, excluding `id` itself.
    pub fn team_volume(
        &self,
        genealogy: &GenealogySnapshot,
        id: ParticipantId,
        max_depth: usize,
    ) -> Result<Decimal> {
        Ok(genealogy
            .descendants(id, max_depth)?
            .into_iter()
            .map(|d| self.personal_volume(d))
            .sum())
    }

    /// Sales by `id` in occurrence order.
    pub fn sales_by(&self, id: ParticipantId) -> &[SaleEvent] {
        self.sales.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `DataIntegrity` when the feed carried a corrupt event for `id`.
    pub fn check(&self, id: ParticipantId) -> Result<()> {
        if self.corrupt.contains(&id) {
            return Err(McreError::integrity(id, "negative sale amount in feed"));
        }
        Ok(())
    }
}
