//! Shared test fixtures for the trophy issuance crates.
//!
//! Deterministic router keys, the reference milestone table (thresholds
//! 10, 20, ..., 90) and a wired home/remote coordinator pair whose relay
//! traffic is queued in memory and delivered on demand.

use std::sync::Arc;

use trophy_issuance::{
    CoordinatorConfig, IssuanceCoordinator, IssuanceError, IssuanceLedger, IssuanceOutcome,
    Milestone,
};
use trophy_relay::{AllowlistEntry, ChainId, RouterKey};

pub mod doubles;

pub use doubles::{DownTransport, Outbox, RecordingMinter};

pub const HOME_CHAIN: &str = "ethereum";
pub const REMOTE_CHAIN: &str = "arbitrum";

pub const HOME_ROUTER_SEED: u8 = 0x11;
pub const REMOTE_ROUTER_SEED: u8 = 0x22;

/// Deterministic router key derived from a single seed byte.
pub fn router_key(seed: u8) -> RouterKey {
    RouterKey::from_bytes(&[seed; 32])
}

/// Nine milestones with ids 1..=9 at thresholds 10, 20, ..., 90.
pub fn milestones_by_tens() -> Vec<Milestone> {
    (1..=9u32)
        .map(|i| Milestone::new(i, u64::from(i) * 10, format!("trophy-{}", i * 10)))
        .collect()
}

/// Configuration for `chain` that relays to `remotes` and trusts `allowlist`.
pub fn config(chain: &str, remotes: &[&str], allowlist: Vec<AllowlistEntry>) -> CoordinatorConfig {
    CoordinatorConfig {
        chain_id: ChainId::new(chain),
        milestones: milestones_by_tens(),
        remote_chains: remotes.iter().map(|r| ChainId::new(r)).collect(),
        allowlist,
        replay_window: 64,
        mint_timeout_ms: 1_000,
        relay_timeout_ms: 1_000,
        stale_reservation_secs: 300,
        ledger_path: None,
    }
}

pub fn home_config() -> CoordinatorConfig {
    config(
        HOME_CHAIN,
        &[REMOTE_CHAIN],
        vec![AllowlistEntry::new(
            REMOTE_CHAIN,
            router_key(REMOTE_ROUTER_SEED).identity_hex(),
        )],
    )
}

pub fn remote_config() -> CoordinatorConfig {
    config(
        REMOTE_CHAIN,
        &[],
        vec![AllowlistEntry::new(
            HOME_CHAIN,
            router_key(HOME_ROUTER_SEED).identity_hex(),
        )],
    )
}

/// A home coordinator and a remote coordinator that trust each other.
pub struct CoordinatorPair {
    pub home: Arc<IssuanceCoordinator>,
    pub remote: Arc<IssuanceCoordinator>,
    pub home_minter: Arc<RecordingMinter>,
    pub remote_minter: Arc<RecordingMinter>,
    /// Messages sent by the home coordinator
    pub home_outbox: Arc<Outbox>,
    /// Messages sent by the remote coordinator
    pub remote_outbox: Arc<Outbox>,
}

impl CoordinatorPair {
    pub fn new() -> Result<Self, IssuanceError> {
        Self::with_ledgers(IssuanceLedger::in_memory(), IssuanceLedger::in_memory())
    }

    pub fn with_ledgers(
        home_ledger: IssuanceLedger,
        remote_ledger: IssuanceLedger,
    ) -> Result<Self, IssuanceError> {
        let home_minter = Arc::new(RecordingMinter::new());
        let remote_minter = Arc::new(RecordingMinter::new());
        let home_outbox = Arc::new(Outbox::new());
        let remote_outbox = Arc::new(Outbox::new());

        let home = IssuanceCoordinator::with_ledger(
            &home_config(),
            router_key(HOME_ROUTER_SEED),
            home_ledger,
            home_minter.clone(),
            home_outbox.clone(),
            0,
        )?;
        let remote = IssuanceCoordinator::with_ledger(
            &remote_config(),
            router_key(REMOTE_ROUTER_SEED),
            remote_ledger,
            remote_minter.clone(),
            remote_outbox.clone(),
            0,
        )?;

        Ok(Self {
            home: Arc::new(home),
            remote: Arc::new(remote),
            home_minter,
            remote_minter,
            home_outbox,
            remote_outbox,
        })
    }

    /// Deliver every queued home message to the remote coordinator.
    pub async fn pump_home_to_remote(&self) -> Result<Vec<IssuanceOutcome>, IssuanceError> {
        let mut outcomes = Vec::new();
        for (_, bytes) in self.home_outbox.drain() {
            outcomes.push(self.remote.handle_inbound_message(&bytes).await?);
        }
        Ok(outcomes)
    }

    /// Deliver every queued remote message to the home coordinator.
    pub async fn pump_remote_to_home(&self) -> Result<Vec<IssuanceOutcome>, IssuanceError> {
        let mut outcomes = Vec::new();
        for (_, bytes) in self.remote_outbox.drain() {
            outcomes.push(self.home.handle_inbound_message(&bytes).await?);
        }
        Ok(outcomes)
    }
}
