//! Sponsorship tree snapshot.
//!
//! A run loads every participant once and builds an immutable arena: nodes live in a `Vec`
//! sorted by id, with parent and child links stored as indices. Integrity problems found while
//! linking (cycles, dangling sponsors, shared referral codes) are recorded per participant
//! instead of failing the whole snapshot, so a run can skip exactly the affected participants.

use crate::types::{Participant, ParticipantId};
use crate::{McreError, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegrityFault {
    DuplicateId,
    DuplicateReferralCode,
    DanglingSponsor(ParticipantId),
    SelfSponsored,
    SponsorCycle,
}

impl fmt::Display for IntegrityFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityFault::DuplicateId => f.write_str("participant id appears more than once"),
            IntegrityFault::DuplicateReferralCode => f.write_str("referral code is not unique"),
            IntegrityFault::DanglingSponsor(s) => write!(f, "sponsor {} does not exist", s),
            IntegrityFault::SelfSponsored => f.write_str("participant sponsors itself"),
            IntegrityFault::SponsorCycle => f.write_str("participant is part of a sponsor cycle"),
        }
    }
}

#[derive(Clone, Debug)]
struct Node {
    participant: Participant,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Immutable view of the sponsorship forest for one run.
#[derive(Clone, Debug, Default)]
pub struct GenealogySnapshot {
    nodes: Vec<Node>,
    index: HashMap<ParticipantId, usize>,
    faults: BTreeMap<ParticipantId, IntegrityFault>,
}

impl GenealogySnapshot {
    pub fn build(mut participants: Vec<Participant>) -> Self {
        participants.sort_by_key(|p| p.id);

        let mut snapshot = GenealogySnapshot::default();
        for participant in participants {
            if snapshot.index.contains_key(&participant.id) {
                snapshot.fault(participant.id, IntegrityFault::DuplicateId);
                continue;
            }
            snapshot.index.insert(participant.id, snapshot.nodes.len());
            snapshot.nodes.push(Node {
                participant,
                parent: None,
                children: Vec::new(),
            });
        }

        let mut holders: HashMap<&str, Vec<ParticipantId>> = HashMap::new();
        for node in &snapshot.nodes {
            holders
                .entry(node.participant.referral_code.as_str())
                .or_default()
                .push(node.participant.id);
        }
        let shared: Vec<ParticipantId> = holders
            .into_values()
            .filter(|ids| ids.len() > 1)
            .flatten()
            .collect();
        for id in shared {
            snapshot.fault(id, IntegrityFault::DuplicateReferralCode);
        }

        for i in 0..snapshot.nodes.len() {
            let id = snapshot.nodes[i].participant.id;
            let Some(sponsor) = snapshot.nodes[i].participant.sponsor else {
                continue;
            };
            if sponsor == id {
                snapshot.fault(id, IntegrityFault::SelfSponsored);
                continue;
            }
            match snapshot.index.get(&sponsor).copied() {
                Some(p) => {
                    snapshot.nodes[i].parent = Some(p);
                    snapshot.nodes[p].children.push(i);
                }
                None => snapshot.fault(id, IntegrityFault::DanglingSponsor(sponsor)),
            }
        }

        snapshot.mark_cycles();
        snapshot
    }

    fn fault(&mut self, id: ParticipantId, fault: IntegrityFault) {
        warn!(participant = %id, fault = %fault, "Genealogy integrity fault");
        self.faults.entry(id).or_insert(fault);
    }

    // 0 = unvisited, 1 = on the current parent walk, 2 = resolved.
    fn mark_cycles(&mut self) {
        let mut colour = vec![0u8; self.nodes.len()];
        let mut in_cycle = Vec::new();

        for start in 0..self.nodes.len() {
            let mut path = Vec::new();
            let mut cursor = Some(start);
            while let Some(i) = cursor {
                match colour[i] {
                    0 => {
                        colour[i] = 1;
                        path.push(i);
                        cursor = self.nodes[i].parent;
                    }
                    1 => {
                        if let Some(pos) = path.iter().position(|&n| n == i) {
                            in_cycle.extend_from_slice(&path[pos..]);
                        }
                        break;
                    }
                    _ => break,
                }
            }
            for i in path {
                colour[i] = 2;
            }
        }

        for i in in_cycle {
            let id = self.nodes[i].participant.id;
            self.fault(id, IntegrityFault::SponsorCycle);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.index.get(&id).map(|&i| &self.nodes[i].participant)
    }

    /// All participants in ascending id order.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.nodes.iter().map(|n| &n.participant)
    }

    pub fn integrity_fault(&self, id: ParticipantId) -> Option<IntegrityFault> {
        self.faults.get(&id).copied()
    }

    pub fn faults(&self) -> &BTreeMap<ParticipantId, IntegrityFault> {
        &self.faults
    }

    fn require(&self, id: ParticipantId) -> Result<usize> {
        self.index
            .get(&id)
            .copied()
            .ok_or_else(|| McreError::Validation(format!("unknown participant {}", id)))
    }

    /// Upline of `id` starting at its sponsor, at most `max_depth` long.
    ///
    /// Stops at a root. Walking into a node that belongs to a sponsor cycle, or revisiting a
    /// node, returns `DataIntegrity`.
    pub fn ancestors(&self, id: ParticipantId, max_depth: usize) -> Result<Vec<ParticipantId>> {
        let start = self.require(id)?;
        let mut chain = Vec::with_capacity(max_depth);
        let mut seen = HashSet::from([start]);
        let mut cursor = self.nodes[start].parent;

        while let Some(i) = cursor {
            if chain.len() >= max_depth {
                break;
            }
            let ancestor = self.nodes[i].participant.id;
            let cyclic = self.faults.get(&ancestor) == Some(&IntegrityFault::SponsorCycle);
            if !seen.insert(i) || cyclic {
                warn!(participant = %id, at = %ancestor, "Sponsor cycle on ancestor walk");
                return Err(McreError::integrity(
                    id,
                    format!("sponsor cycle reached at participant {}", ancestor),
                ));
            }
            chain.push(ancestor);
            cursor = self.nodes[i].parent;
        }
        Ok(chain)
    }

    /// Breadth-first downline of `id` (excluding `id`), at most `max_depth` levels deep.
    pub fn descendants(&self, id: ParticipantId, max_depth: usize) -> Result<Vec<ParticipantId>> {
        let start = self.require(id)?;
        let mut out = Vec::new();
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([(start, 0usize)]);

        while let Some((i, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for &child in &self.nodes[i].children {
                if !seen.insert(child) {
                    let at = self.nodes[child].participant.id;
                    warn!(participant = %id, at = %at, "Sponsor cycle in downline");
                    return Err(McreError::integrity(
                        id,
                        format!("sponsor cycle in downline at participant {}", at),
                    ));
                }
                out.push(self.nodes[child].participant.id);
                queue.push_back((child, depth + 1));
            }
        }
        Ok(out)
    }

    /// Direct referrals of `id`.
    pub fn children(&self, id: ParticipantId) -> Vec<ParticipantId> {
        self.index
            .get(&id)
            .map(|&i| {
                self.nodes[i]
                    .children
                    .iter()
                    .map(|&c| self.nodes[c].participant.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Active direct referrals of `id`.
    pub fn direct_referral_count(&self, id: ParticipantId) -> u32 {
        self.index
            .get(&id)
            .map(|&i| {
                self.nodes[i]
                    .children
                    .iter()
                    .filter(|&&c| self.nodes[c].participant.active)
                    .count() as u32
            })
            .unwrap_or(0)
    }
}
