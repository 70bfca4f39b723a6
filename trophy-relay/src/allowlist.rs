//! Source-chain allowlist
//!
//! Registry of the remote networks this coordinator accepts messages from and
//! the router identity trusted for each of them. The registry is an immutable
//! snapshot; an administrative reload builds a new snapshot and swaps it in
//! atomically, so readers never observe a partially updated set.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{auth, ChainId, RejectReason, RelayError};

/// Trusted router for one source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub chain_id: ChainId,
    /// Hex-encoded Ed25519 verifying key of the chain's router
    pub trusted_router: String,
}

impl AllowlistEntry {
    pub fn new(chain_id: impl Into<ChainId>, trusted_router: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            trusted_router: trusted_router.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Rejected(RejectReason),
}

/// One immutable generation of the allowlist
#[derive(Debug, Default)]
pub struct AllowlistSnapshot {
    generation: u64,
    routers: HashMap<ChainId, [u8; 32]>,
}

impl AllowlistSnapshot {
    fn build(generation: u64, entries: &[AllowlistEntry]) -> Result<Self, RelayError> {
        let mut routers = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.chain_id.is_empty() {
                return Err(RelayError::InvalidAllowlist("empty chain id".into()));
            }
            let router = auth::parse_identity(&entry.trusted_router)?;
            if routers.insert(entry.chain_id.clone(), router).is_some() {
                return Err(RelayError::InvalidAllowlist(format!(
                    "chain {} listed twice",
                    entry.chain_id
                )));
            }
        }
        Ok(Self {
            generation,
            routers,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn trusted_router(&self, chain_id: &ChainId) -> Option<&[u8; 32]> {
        self.routers.get(chain_id)
    }

    pub fn chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<_> = self.routers.keys().cloned().collect();
        chains.sort();
        chains
    }

    pub fn verify(&self, source_chain: &ChainId, sender: &[u8; 32]) -> Verdict {
        match self.routers.get(source_chain) {
            None => Verdict::Rejected(RejectReason::UnknownChain {
                chain_id: source_chain.clone(),
            }),
            Some(router) if router != sender => Verdict::Rejected(RejectReason::UntrustedSender {
                chain_id: source_chain.clone(),
                sender: hex::encode(sender),
            }),
            Some(_) => Verdict::Allowed,
        }
    }
}

/// Swappable allowlist shared by the inbound relay path
#[derive(Debug)]
pub struct SourceChainAllowlist {
    current: RwLock<Arc<AllowlistSnapshot>>,
}

impl SourceChainAllowlist {
    pub fn from_entries(entries: &[AllowlistEntry]) -> Result<Self, RelayError> {
        Ok(Self {
            current: RwLock::new(Arc::new(AllowlistSnapshot::build(1, entries)?)),
        })
    }

    /// Current snapshot; callers keep a consistent view for as long as they hold it
    pub fn snapshot(&self) -> Arc<AllowlistSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Fails closed: any chain absent from the snapshot is rejected
    pub fn verify(&self, source_chain: &ChainId, sender: &[u8; 32]) -> Verdict {
        self.snapshot().verify(source_chain, sender)
    }

    /// Replace the registry with a freshly validated snapshot.
    /// On error the previous snapshot stays in place.
    pub fn reload(&self, entries: &[AllowlistEntry]) -> Result<u64, RelayError> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = AllowlistSnapshot::build(guard.generation + 1, entries)?;
        let generation = next.generation;
        *guard = Arc::new(next);
        info!(generation, chains = entries.len(), "allowlist reloaded");
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RouterKey;

    fn router(seed: u8) -> RouterKey {
        RouterKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_verify_verdicts() {
        let trusted = router(1);
        let allowlist = SourceChainAllowlist::from_entries(&[AllowlistEntry::new(
            "ethereum",
            trusted.identity_hex(),
        )])
        .unwrap();

        assert_eq!(
            allowlist.verify(&ChainId::new("ethereum"), &trusted.identity()),
            Verdict::Allowed
        );
        assert_eq!(
            allowlist.verify(&ChainId::new("x"), &trusted.identity()),
            Verdict::Rejected(RejectReason::UnknownChain {
                chain_id: ChainId::new("x")
            })
        );

        let impostor = router(2);
        match allowlist.verify(&ChainId::new("ethereum"), &impostor.identity()) {
            Verdict::Rejected(RejectReason::UntrustedSender { chain_id, sender }) => {
                assert_eq!(chain_id.as_str(), "ethereum");
                assert_eq!(sender, impostor.identity_hex());
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_empty_allowlist_fails_closed() {
        let allowlist = SourceChainAllowlist::from_entries(&[]).unwrap();
        assert!(matches!(
            allowlist.verify(&ChainId::new("ethereum"), &router(1).identity()),
            Verdict::Rejected(RejectReason::UnknownChain { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_and_malformed_entries() {
        let key = router(1).identity_hex();
        let duplicate = [
            AllowlistEntry::new("ethereum", key.clone()),
            AllowlistEntry::new("Ethereum", key),
        ];
        assert!(SourceChainAllowlist::from_entries(&duplicate).is_err());

        let malformed = [AllowlistEntry::new("ethereum", "not-hex")];
        assert!(SourceChainAllowlist::from_entries(&malformed).is_err());
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let first = router(1);
        let second = router(2);
        let allowlist = SourceChainAllowlist::from_entries(&[AllowlistEntry::new(
            "ethereum",
            first.identity_hex(),
        )])
        .unwrap();

        let held = allowlist.snapshot();
        let generation = allowlist
            .reload(&[AllowlistEntry::new("ethereum", second.identity_hex())])
            .unwrap();
        assert_eq!(generation, 2);

        // The held snapshot is unaffected by the swap
        assert_eq!(held.verify(&ChainId::new("ethereum"), &first.identity()), Verdict::Allowed);
        assert!(matches!(
            allowlist.verify(&ChainId::new("ethereum"), &first.identity()),
            Verdict::Rejected(RejectReason::UntrustedSender { .. })
        ));
        assert_eq!(
            allowlist.verify(&ChainId::new("ethereum"), &second.identity()),
            Verdict::Allowed
        );
    }

    #[test]
    fn test_failed_reload_keeps_previous() {
        let key = router(1);
        let allowlist = SourceChainAllowlist::from_entries(&[AllowlistEntry::new(
            "ethereum",
            key.identity_hex(),
        )])
        .unwrap();

        assert!(allowlist
            .reload(&[AllowlistEntry::new("arbitrum", "00")])
            .is_err());
        assert_eq!(allowlist.snapshot().generation(), 1);
        assert_eq!(allowlist.snapshot().chains(), vec![ChainId::new("ethereum")]);
    }
}
