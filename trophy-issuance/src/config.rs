//! Coordinator configuration.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trophy_relay::{
    validate_identifier, AllowlistEntry, ChainId, RouterKey, SourceChainAllowlist,
    DEFAULT_REPLAY_WINDOW,
};

use crate::milestones::{Milestone, MilestoneTable};
use crate::IssuanceError;

pub const CONFIG_PATH_ENV: &str = "TROPHY_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/trophy.json";
pub const CHAIN_ID_ENV: &str = "TROPHY_CHAIN_ID";
pub const LEDGER_PATH_ENV: &str = "TROPHY_LEDGER_PATH";
pub const ROUTER_KEY_ENV: &str = "TROPHY_ROUTER_KEY";

fn default_replay_window() -> usize {
    DEFAULT_REPLAY_WINDOW
}

fn default_mint_timeout_ms() -> u64 {
    10_000
}

fn default_relay_timeout_ms() -> u64 {
    5_000
}

fn default_stale_reservation_secs() -> u64 {
    300
}

/// Coordinator configuration, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Chain this coordinator issues on.
    pub chain_id: ChainId,
    /// Milestone threshold table.
    pub milestones: Vec<Milestone>,
    /// Chains that receive a relay message for every local issuance.
    #[serde(default)]
    pub remote_chains: Vec<ChainId>,
    /// Chains accepted as message origins, with their trusted routers.
    #[serde(default)]
    pub allowlist: Vec<AllowlistEntry>,
    /// Remembered nonces per source chain.
    #[serde(default = "default_replay_window")]
    pub replay_window: usize,
    #[serde(default = "default_mint_timeout_ms")]
    pub mint_timeout_ms: u64,
    #[serde(default = "default_relay_timeout_ms")]
    pub relay_timeout_ms: u64,
    /// Age after which an unfinished reservation is retried.
    #[serde(default = "default_stale_reservation_secs")]
    pub stale_reservation_secs: u64,
    /// sled database path; in-memory ledger when unset.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
}

impl CoordinatorConfig {
    pub fn from_json(json: &str) -> Result<Self, IssuanceError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| IssuanceError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IssuanceError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            IssuanceError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Load from `TROPHY_CONFIG_PATH` and apply environment overrides.
    pub fn from_env() -> Result<Self, IssuanceError> {
        let mut config = Self::from_file(config_path())?;
        config.apply_overrides(env::var(CHAIN_ID_ENV).ok(), env::var(LEDGER_PATH_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, chain_id: Option<String>, ledger_path: Option<String>) {
        if let Some(chain_id) = chain_id.filter(|s| !s.trim().is_empty()) {
            self.chain_id = ChainId::new(chain_id);
        }
        if let Some(path) = ledger_path.filter(|s| !s.trim().is_empty()) {
            self.ledger_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<(), IssuanceError> {
        if self.chain_id.is_empty() {
            return Err(IssuanceError::Config("chain_id must be set".into()));
        }
        // Every chain id ends up on the wire, as a source or a destination
        wire_identifier("chain_id", &self.chain_id)?;
        for remote in &self.remote_chains {
            wire_identifier("remote chain", remote)?;
        }
        for entry in &self.allowlist {
            wire_identifier("allowlist chain", &entry.chain_id)?;
        }

        MilestoneTable::new(self.milestones.clone())?;

        let mut remotes = HashSet::new();
        for remote in &self.remote_chains {
            if *remote == self.chain_id {
                return Err(IssuanceError::Config(format!(
                    "remote chain {remote} is the home chain"
                )));
            }
            if remote.is_empty() || !remotes.insert(remote) {
                return Err(IssuanceError::Config(format!(
                    "invalid or duplicate remote chain '{remote}'"
                )));
            }
        }

        SourceChainAllowlist::from_entries(&self.allowlist)?;

        if self.replay_window == 0 {
            return Err(IssuanceError::Config("replay_window must be positive".into()));
        }
        if self.mint_timeout_ms == 0 || self.relay_timeout_ms == 0 {
            return Err(IssuanceError::Config("timeouts must be positive".into()));
        }
        // Claim times are whole seconds, so a reservation can look stale up
        // to a second early; its mint must have timed out by then
        if self
            .stale_reservation_secs
            .saturating_sub(1)
            .saturating_mul(1_000)
            <= self.mint_timeout_ms
        {
            return Err(IssuanceError::Config(
                "stale_reservation_secs must exceed the mint timeout by more than one second"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn mint_timeout(&self) -> Duration {
        Duration::from_millis(self.mint_timeout_ms)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }
}

fn wire_identifier(field: &str, chain: &ChainId) -> Result<(), IssuanceError> {
    validate_identifier(field, chain.as_str()).map_err(|e| IssuanceError::Config(e.to_string()))
}

/// Configuration file path from `TROPHY_CONFIG_PATH`.
pub fn config_path() -> PathBuf {
    env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Re-read only the allowlist section, for an administrative reload.
pub fn allowlist_from_file(path: impl AsRef<Path>) -> Result<Vec<AllowlistEntry>, IssuanceError> {
    Ok(CoordinatorConfig::from_file(path)?.allowlist)
}

/// Router signing key from `TROPHY_ROUTER_KEY`. Never stored in the config file.
pub fn router_key_from_env() -> Result<RouterKey, IssuanceError> {
    let secret = env::var(ROUTER_KEY_ENV)
        .map_err(|_| IssuanceError::Config(format!("{ROUTER_KEY_ENV} must be set")))?;
    Ok(RouterKey::from_hex(&secret)?)
}
