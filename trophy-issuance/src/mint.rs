//! Ledger mint primitive

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trophy_relay::{ChainId, MilestoneId, UserId};

use crate::MintError;

/// One token to mint on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRequest {
    pub chain_id: ChainId,
    pub user_id: UserId,
    pub milestone_id: MilestoneId,
    pub token_kind: String,
}

/// Mints achievement tokens on the local chain's ledger.
///
/// Returns the transaction reference on success.
#[async_trait]
pub trait Minter: Send + Sync {
    async fn mint(&self, request: &MintRequest) -> Result<String, MintError>;
}
