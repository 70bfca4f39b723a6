//! Milestone table and evaluator
//!
//! The table is fixed configuration: validated and sorted once at load, then
//! only read.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use trophy_relay::MilestoneId;

use crate::IssuanceError;

/// A win-count threshold that awards one achievement token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    /// Win count at which the milestone is reached
    pub threshold: u64,
    /// Token kind minted for this milestone (e.g. "bronze-trophy")
    pub token_kind: String,
}

impl Milestone {
    pub fn new(id: u32, threshold: u64, token_kind: impl Into<String>) -> Self {
        Self {
            id: MilestoneId(id),
            threshold,
            token_kind: token_kind.into(),
        }
    }
}

/// Milestones ordered by ascending threshold
#[derive(Debug, Clone)]
pub struct MilestoneTable {
    milestones: Vec<Milestone>,
}

impl MilestoneTable {
    pub fn new(mut milestones: Vec<Milestone>) -> Result<Self, IssuanceError> {
        if milestones.is_empty() {
            return Err(IssuanceError::Config("milestone table is empty".into()));
        }

        let mut ids = HashSet::new();
        let mut thresholds = HashSet::new();
        for milestone in &milestones {
            if milestone.threshold == 0 {
                return Err(IssuanceError::Config(format!(
                    "milestone {} has a zero threshold",
                    milestone.id
                )));
            }
            if !ids.insert(milestone.id) {
                return Err(IssuanceError::Config(format!(
                    "duplicate milestone id {}",
                    milestone.id
                )));
            }
            if !thresholds.insert(milestone.threshold) {
                return Err(IssuanceError::Config(format!(
                    "duplicate milestone threshold {}",
                    milestone.threshold
                )));
            }
        }

        milestones.sort_by_key(|m| m.threshold);
        Ok(Self { milestones })
    }

    pub fn get(&self, id: MilestoneId) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: MilestoneId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.milestones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.milestones.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Milestone> {
        self.milestones.iter()
    }
}

/// Maps a win-count update to the milestones it newly crosses
#[derive(Debug, Clone)]
pub struct MilestoneEvaluator {
    table: MilestoneTable,
}

impl MilestoneEvaluator {
    pub fn new(table: MilestoneTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &MilestoneTable {
        &self.table
    }

    /// Every milestone with threshold in `(previous, new]`, ascending.
    ///
    /// A jump across several thresholds yields all of them, not only the
    /// highest.
    pub fn evaluate(&self, previous: u64, new: u64) -> Result<Vec<MilestoneId>, IssuanceError> {
        if new < previous {
            return Err(IssuanceError::InvalidRange { previous, new });
        }

        let milestones = &self.table.milestones;
        let start = milestones.partition_point(|m| m.threshold <= previous);
        let end = milestones.partition_point(|m| m.threshold <= new);
        Ok(milestones[start..end].iter().map(|m| m.id).collect())
    }
}
