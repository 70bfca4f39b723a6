//! Per-chain supply counters

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use trophy_relay::{ChainId, MilestoneId, SupplyReport};

use crate::ledger::IssuanceRecord;

/// Issued supply of one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSupply {
    pub chain_id: ChainId,
    pub total: u64,
    pub per_milestone: BTreeMap<MilestoneId, u64>,
}

impl ChainSupply {
    pub fn empty(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            total: 0,
            per_milestone: BTreeMap::new(),
        }
    }

    pub fn issued(&self, milestone_id: MilestoneId) -> u64 {
        self.per_milestone.get(&milestone_id).copied().unwrap_or(0)
    }

    pub fn to_report(&self) -> SupplyReport {
        SupplyReport {
            total: self.total,
            per_milestone: self.per_milestone.clone(),
        }
    }
}

/// Monotonic counters, one entry per chain
#[derive(Debug, Default)]
pub struct SupplyTracker {
    chains: DashMap<ChainId, ChainSupply>,
}

impl SupplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild counters from the `Issued` records of a ledger
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a IssuanceRecord>) -> Self {
        let tracker = Self::new();
        for record in records.into_iter().filter(|r| r.is_issued()) {
            tracker.increment(&record.key.chain_id, record.key.milestone_id);
        }
        tracker
    }

    /// Bump the chain total and the milestone counter as one step
    pub fn increment(&self, chain_id: &ChainId, milestone_id: MilestoneId) {
        let mut supply = self
            .chains
            .entry(chain_id.clone())
            .or_insert_with(|| ChainSupply::empty(chain_id.clone()));
        supply.total += 1;
        *supply.per_milestone.entry(milestone_id).or_insert(0) += 1;
    }

    pub fn get(&self, chain_id: &ChainId) -> ChainSupply {
        self.chains
            .get(chain_id)
            .map(|supply| supply.value().clone())
            .unwrap_or_else(|| ChainSupply::empty(chain_id.clone()))
    }
}
