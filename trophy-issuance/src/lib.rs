//! trophy-issuance
//!
//! Awards achievement tokens when a player's win count crosses configured
//! milestones, at most once per (user, milestone, chain), and replicates each
//! issuance to remote chains over the authenticated relay from `trophy-relay`.
//!
//! The pieces, leaves first:
//! - [`MilestoneEvaluator`]: pure mapping from a win-count update to crossed milestones
//! - [`IssuanceLedger`]: idempotent reservation and forward-only issuance status
//! - [`SupplyTracker`]: per-chain issued counters used by audits
//! - [`IssuanceCoordinator`]: local issuance, inbound application, audit and reconciliation
//!
//! Ledger mint primitives and relay transports are collaborators supplied by
//! the embedding service ([`Minter`], [`trophy_relay::Transport`]).

pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod milestones;
pub mod mint;
pub mod supply;

pub use config::CoordinatorConfig;
pub use coordinator::{
    CrossChainAudit, IssuanceCoordinator, IssuanceOutcome, MilestoneComparison, ReconcileReport,
    SupplyAudit, SyncStatus,
};
pub use error::{IssuanceError, MintError};
pub use ledger::{
    FailureNote, IssuanceKey, IssuanceLedger, IssuanceOrigin, IssuanceRecord, IssuanceStatus,
    Reservation,
};
pub use milestones::{Milestone, MilestoneEvaluator, MilestoneTable};
pub use mint::{MintRequest, Minter};
pub use supply::{ChainSupply, SupplyTracker};

/// Rail identifier for the issuance coordinator
pub const RAIL_ID_TROPHY_ISSUANCE: &str = "TROPHY_ISSUANCE";
