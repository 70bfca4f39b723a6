//! Issuance ledger
//!
//! Durable record of every (user, milestone, chain) issuance. `reserve` is a
//! single insert-if-absent against the key, so of any number of concurrent
//! reservations for one key exactly one wins. Records are never deleted;
//! their status only moves forward:
//!
//! ```text
//! Reserved -> Issued
//! Reserved -> Failed -> Reserved (retry claim) -> Issued
//! ```
//!
//! A local issuance also carries the remote chains its relay message has not
//! reached yet. The list is written together with `Issued` and only shrinks.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::Db;
use tracing::debug;
use trophy_relay::{ChainId, MilestoneId, UserId};

use crate::{IssuanceError, MintError};

// ═══════════════════════════════════════════════════════════════════════════════
// RECORD TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssuanceKey {
    pub user_id: UserId,
    pub milestone_id: MilestoneId,
    pub chain_id: ChainId,
}

impl IssuanceKey {
    pub fn new(user_id: UserId, milestone_id: MilestoneId, chain_id: ChainId) -> Self {
        Self {
            user_id,
            milestone_id,
            chain_id,
        }
    }

    /// Chain-first, length-prefixed so one chain's records share a prefix
    fn storage_key(&self) -> Vec<u8> {
        let user = self.user_id.as_str().as_bytes();
        let mut buf = chain_prefix(&self.chain_id);
        buf.extend_from_slice(&(user.len() as u32).to_be_bytes());
        buf.extend_from_slice(user);
        buf.extend_from_slice(&self.milestone_id.0.to_be_bytes());
        buf
    }
}

impl fmt::Display for IssuanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.user_id, self.milestone_id, self.chain_id
        )
    }
}

fn chain_prefix(chain_id: &ChainId) -> Vec<u8> {
    let chain = chain_id.as_str().as_bytes();
    let mut buf = Vec::with_capacity(8 + chain.len());
    buf.extend_from_slice(&(chain.len() as u32).to_be_bytes());
    buf.extend_from_slice(chain);
    buf
}

/// What triggered an issuance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssuanceOrigin {
    /// Win report on this chain
    Local,
    /// Relay message from another chain
    Remote { source_chain: ChainId, nonce: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceStatus {
    Reserved,
    Issued,
    Failed,
}

impl IssuanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Issued => "issued",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNote {
    pub reason: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRecord {
    pub key: IssuanceKey,
    pub origin: IssuanceOrigin,
    pub status: IssuanceStatus,
    /// Unix seconds of the first reservation
    pub reserved_at: u64,
    /// Unix seconds of the latest reservation or retry claim
    pub claimed_at: u64,
    pub issued_at: Option<u64>,
    /// Mint transaction reference
    pub reference: Option<String>,
    pub failure: Option<FailureNote>,
    /// Mint attempts started, including the first
    pub attempts: u32,
    /// Remote chains still owed a relay message for this issuance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_relays: Vec<ChainId>,
}

impl IssuanceRecord {
    fn reserved(key: IssuanceKey, origin: IssuanceOrigin) -> Self {
        let now = unix_now();
        Self {
            key,
            origin,
            status: IssuanceStatus::Reserved,
            reserved_at: now,
            claimed_at: now,
            issued_at: None,
            reference: None,
            failure: None,
            attempts: 1,
            pending_relays: Vec::new(),
        }
    }

    pub fn is_issued(&self) -> bool {
        self.status == IssuanceStatus::Issued
    }

    fn is_retry_candidate(&self, now: u64, stale_after_secs: u64) -> bool {
        match self.status {
            IssuanceStatus::Failed => self.failure.as_ref().map_or(true, |f| f.retryable),
            IssuanceStatus::Reserved => self.claimed_at.saturating_add(stale_after_secs) <= now,
            IssuanceStatus::Issued => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Caller owns the key and must mint
    Reserved,
    /// Key already exists; nothing to do
    AlreadyIssued { status: IssuanceStatus },
}

enum Transition {
    Applied(IssuanceRecord),
    Refused(IssuanceStatus),
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════════
// LEDGER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct IssuanceLedger {
    backend: Arc<LedgerBackend>,
}

enum LedgerBackend {
    InMemory(DashMap<IssuanceKey, IssuanceRecord>),
    Persistent(Db),
}

impl IssuanceLedger {
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(LedgerBackend::InMemory(DashMap::new())),
        }
    }

    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, IssuanceError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    IssuanceError::Storage(format!(
                        "failed to create directory for ledger db at {}: {}",
                        path_ref.display(),
                        err
                    ))
                })?;
            }
        }
        let db = sled::open(path_ref).map_err(|err| {
            IssuanceError::Storage(format!(
                "failed to open ledger db at {}: {}",
                path_ref.display(),
                err
            ))
        })?;
        Ok(Self {
            backend: Arc::new(LedgerBackend::Persistent(db)),
        })
    }

    pub fn is_persistent(&self) -> bool {
        matches!(&*self.backend, LedgerBackend::Persistent(_))
    }

    /// Atomically claim `key`. Exactly one concurrent caller sees `Reserved`.
    pub fn reserve(
        &self,
        key: &IssuanceKey,
        origin: IssuanceOrigin,
    ) -> Result<Reservation, IssuanceError> {
        let reservation = match &*self.backend {
            LedgerBackend::InMemory(records) => match records.entry(key.clone()) {
                Entry::Occupied(existing) => Reservation::AlreadyIssued {
                    status: existing.get().status,
                },
                Entry::Vacant(slot) => {
                    slot.insert(IssuanceRecord::reserved(key.clone(), origin));
                    Reservation::Reserved
                }
            },
            LedgerBackend::Persistent(db) => {
                let record = IssuanceRecord::reserved(key.clone(), origin);
                let swapped = db
                    .compare_and_swap(key.storage_key(), None as Option<&[u8]>, Some(encode(&record)?))
                    .map_err(|err| IssuanceError::Storage(format!("ledger db cas error: {err}")))?;
                match swapped {
                    Ok(()) => Reservation::Reserved,
                    Err(conflict) => {
                        let status = match conflict.current {
                            Some(bytes) => decode(&bytes)?.status,
                            None => IssuanceStatus::Reserved,
                        };
                        Reservation::AlreadyIssued { status }
                    }
                }
            }
        };

        debug!(key = %key, ?reservation, "reserve");
        Ok(reservation)
    }

    /// `Reserved -> Issued`, by the holder of claim `attempt`.
    ///
    /// `pending_relays` are the chains that must still receive the issuance;
    /// they are stored in the same write as the status.
    pub fn mark_issued(
        &self,
        key: &IssuanceKey,
        attempt: u32,
        reference: &str,
        pending_relays: &[ChainId],
    ) -> Result<IssuanceRecord, IssuanceError> {
        let outcome = self.transition(key, |record| {
            if record.status != IssuanceStatus::Reserved || record.attempts != attempt {
                return Transition::Refused(record.status);
            }
            let mut next = record.clone();
            next.status = IssuanceStatus::Issued;
            next.issued_at = Some(unix_now());
            next.reference = Some(reference.to_string());
            next.failure = None;
            next.pending_relays = pending_relays.to_vec();
            Transition::Applied(next)
        })?;
        applied_or_invalid(key, outcome, IssuanceStatus::Issued)
    }

    /// Drop `delivered` from an issued record's pending relays
    pub fn settle_relays(
        &self,
        key: &IssuanceKey,
        delivered: &[ChainId],
    ) -> Result<IssuanceRecord, IssuanceError> {
        let outcome = self.transition(key, |record| {
            if record.status != IssuanceStatus::Issued {
                return Transition::Refused(record.status);
            }
            let mut next = record.clone();
            next.pending_relays.retain(|chain| !delivered.contains(chain));
            Transition::Applied(next)
        })?;
        applied_or_invalid(key, outcome, IssuanceStatus::Issued)
    }

    /// `Reserved -> Failed`; the key stays taken, never rolled back
    pub fn mark_failed(
        &self,
        key: &IssuanceKey,
        attempt: u32,
        error: &MintError,
    ) -> Result<IssuanceRecord, IssuanceError> {
        let outcome = self.transition(key, |record| {
            if record.status != IssuanceStatus::Reserved || record.attempts != attempt {
                return Transition::Refused(record.status);
            }
            let mut next = record.clone();
            next.status = IssuanceStatus::Failed;
            next.failure = Some(FailureNote {
                reason: error.to_string(),
                retryable: error.is_retryable(),
            });
            Transition::Applied(next)
        })?;
        applied_or_invalid(key, outcome, IssuanceStatus::Failed)
    }

    /// Claim a retry candidate for another mint attempt.
    ///
    /// `observed_attempts` is the attempt count the caller saw when it listed
    /// the candidate; the claim succeeds only if nobody else claimed it since.
    /// Returns `None` when the record is no longer eligible.
    pub fn claim_retry(
        &self,
        key: &IssuanceKey,
        observed_attempts: u32,
        stale_after_secs: u64,
    ) -> Result<Option<IssuanceRecord>, IssuanceError> {
        let now = unix_now();
        let outcome = self.transition(key, |record| {
            if record.attempts != observed_attempts
                || !record.is_retry_candidate(now, stale_after_secs)
            {
                return Transition::Refused(record.status);
            }
            let mut next = record.clone();
            next.status = IssuanceStatus::Reserved;
            next.claimed_at = now;
            next.attempts += 1;
            next.failure = None;
            Transition::Applied(next)
        })?;
        Ok(match outcome {
            Transition::Applied(record) => Some(record),
            Transition::Refused(_) => None,
        })
    }

    pub fn get(&self, key: &IssuanceKey) -> Result<Option<IssuanceRecord>, IssuanceError> {
        match &*self.backend {
            LedgerBackend::InMemory(records) => Ok(records.get(key).map(|r| r.value().clone())),
            LedgerBackend::Persistent(db) => db
                .get(key.storage_key())
                .map_err(|err| IssuanceError::Storage(format!("ledger db get error: {err}")))?
                .map(|bytes| decode(&bytes))
                .transpose(),
        }
    }

    pub fn records(&self) -> Result<Vec<IssuanceRecord>, IssuanceError> {
        match &*self.backend {
            LedgerBackend::InMemory(records) => {
                Ok(records.iter().map(|entry| entry.value().clone()).collect())
            }
            LedgerBackend::Persistent(db) => db
                .iter()
                .values()
                .map(|value| {
                    let bytes = value.map_err(|err| {
                        IssuanceError::Storage(format!("ledger db scan error: {err}"))
                    })?;
                    decode(&bytes)
                })
                .collect(),
        }
    }

    pub fn records_for_chain(
        &self,
        chain_id: &ChainId,
    ) -> Result<Vec<IssuanceRecord>, IssuanceError> {
        match &*self.backend {
            LedgerBackend::InMemory(records) => Ok(records
                .iter()
                .filter(|entry| entry.key().chain_id == *chain_id)
                .map(|entry| entry.value().clone())
                .collect()),
            LedgerBackend::Persistent(db) => db
                .scan_prefix(chain_prefix(chain_id))
                .values()
                .map(|value| {
                    let bytes = value.map_err(|err| {
                        IssuanceError::Storage(format!("ledger db scan error: {err}"))
                    })?;
                    decode(&bytes)
                })
                .collect(),
        }
    }

    /// Retryable failures plus reservations not completed within `stale_after_secs`
    pub fn retry_candidates(
        &self,
        stale_after_secs: u64,
    ) -> Result<Vec<IssuanceRecord>, IssuanceError> {
        let now = unix_now();
        let mut candidates: Vec<_> = self
            .records()?
            .into_iter()
            .filter(|record| record.is_retry_candidate(now, stale_after_secs))
            .collect();
        candidates.sort_by_key(|record| record.reserved_at);
        Ok(candidates)
    }

    /// Issued records with relay messages still owed, oldest issuance first
    pub fn relay_backlog(&self) -> Result<Vec<IssuanceRecord>, IssuanceError> {
        let mut backlog: Vec<_> = self
            .records()?
            .into_iter()
            .filter(|record| record.is_issued() && !record.pending_relays.is_empty())
            .collect();
        backlog.sort_by_key(|record| record.issued_at);
        Ok(backlog)
    }

    pub fn flush(&self) -> Result<(), IssuanceError> {
        if let LedgerBackend::Persistent(db) = &*self.backend {
            db.flush()
                .map_err(|err| IssuanceError::Storage(format!("ledger db flush error: {err}")))?;
        }
        Ok(())
    }

    fn transition<F>(&self, key: &IssuanceKey, step: F) -> Result<Transition, IssuanceError>
    where
        F: Fn(&IssuanceRecord) -> Transition,
    {
        match &*self.backend {
            LedgerBackend::InMemory(records) => {
                let mut record = records
                    .get_mut(key)
                    .ok_or_else(|| IssuanceError::RecordNotFound(key.clone()))?;
                let outcome = step(&record);
                if let Transition::Applied(next) = &outcome {
                    *record = next.clone();
                }
                Ok(outcome)
            }
            LedgerBackend::Persistent(db) => {
                let storage_key = key.storage_key();
                loop {
                    let current = db
                        .get(&storage_key)
                        .map_err(|err| IssuanceError::Storage(format!("ledger db get error: {err}")))?
                        .ok_or_else(|| IssuanceError::RecordNotFound(key.clone()))?;

                    let outcome = step(&decode(&current)?);
                    let Transition::Applied(next) = &outcome else {
                        return Ok(outcome);
                    };

                    let swapped = db
                        .compare_and_swap(&storage_key, Some(&current), Some(encode(next)?))
                        .map_err(|err| {
                            IssuanceError::Storage(format!("ledger db cas error: {err}"))
                        })?;
                    if swapped.is_ok() {
                        return Ok(outcome);
                    }
                    // Lost a race with another writer; re-read and re-apply
                }
            }
        }
    }
}

fn applied_or_invalid(
    key: &IssuanceKey,
    outcome: Transition,
    to: IssuanceStatus,
) -> Result<IssuanceRecord, IssuanceError> {
    match outcome {
        Transition::Applied(record) => Ok(record),
        Transition::Refused(from) => Err(IssuanceError::InvalidTransition {
            key: key.clone(),
            from: from.as_str(),
            to: to.as_str(),
        }),
    }
}

fn encode(record: &IssuanceRecord) -> Result<Vec<u8>, IssuanceError> {
    serde_json::to_vec(record)
        .map_err(|err| IssuanceError::Storage(format!("ledger record encode error: {err}")))
}

fn decode(bytes: &[u8]) -> Result<IssuanceRecord, IssuanceError> {
    serde_json::from_slice(bytes)
        .map_err(|err| IssuanceError::Storage(format!("ledger record decode error: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str, milestone: u32, chain: &str) -> IssuanceKey {
        IssuanceKey::new(UserId::new(user), MilestoneId(milestone), ChainId::new(chain))
    }

    fn backends() -> Vec<(IssuanceLedger, Option<tempfile::TempDir>)> {
        let dir = tempfile::tempdir().unwrap();
        let persistent = IssuanceLedger::persistent(dir.path().join("ledger")).unwrap();
        vec![
            (IssuanceLedger::in_memory(), None),
            (persistent, Some(dir)),
        ]
    }

    #[test]
    fn test_reserve_is_idempotent() {
        for (ledger, _dir) in backends() {
            let k = key("alice", 1, "ethereum");
            assert_eq!(
                ledger.reserve(&k, IssuanceOrigin::Local).unwrap(),
                Reservation::Reserved
            );
            assert_eq!(
                ledger.reserve(&k, IssuanceOrigin::Local).unwrap(),
                Reservation::AlreadyIssued {
                    status: IssuanceStatus::Reserved
                }
            );

            // Same user and milestone on another chain is a distinct key
            assert_eq!(
                ledger
                    .reserve(&key("alice", 1, "arbitrum"), IssuanceOrigin::Local)
                    .unwrap(),
                Reservation::Reserved
            );
        }
    }

    #[test]
    fn test_concurrent_reserve_has_one_winner() {
        for (ledger, _dir) in backends() {
            let k = key("racer", 7, "ethereum");
            let winners: usize = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..16)
                    .map(|_| {
                        let ledger = ledger.clone();
                        let k = k.clone();
                        scope.spawn(move || ledger.reserve(&k, IssuanceOrigin::Local).unwrap())
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap())
                    .filter(|r| *r == Reservation::Reserved)
                    .count()
            });
            assert_eq!(winners, 1);
            assert_eq!(ledger.records().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_status_moves_forward_only() {
        for (ledger, _dir) in backends() {
            let k = key("bob", 2, "ethereum");
            ledger.reserve(&k, IssuanceOrigin::Local).unwrap();

            let issued = ledger.mark_issued(&k, 1, "0xabc", &[]).unwrap();
            assert_eq!(issued.status, IssuanceStatus::Issued);
            assert_eq!(issued.reference.as_deref(), Some("0xabc"));
            assert!(issued.issued_at.is_some());

            assert!(matches!(
                ledger.mark_failed(&k, 1, &MintError::Retryable("late".into())),
                Err(IssuanceError::InvalidTransition { from: "issued", .. })
            ));
            assert!(matches!(
                ledger.mark_issued(&k, 1, "0xdef", &[]),
                Err(IssuanceError::InvalidTransition { .. })
            ));
            assert_eq!(
                ledger.get(&k).unwrap().unwrap().reference.as_deref(),
                Some("0xabc")
            );
        }
    }

    #[test]
    fn test_failed_record_is_claimed_once() {
        for (ledger, _dir) in backends() {
            let k = key("carol", 3, "ethereum");
            ledger.reserve(&k, IssuanceOrigin::Local).unwrap();
            let failed = ledger
                .mark_failed(&k, 1, &MintError::Retryable("rpc down".into()))
                .unwrap();
            assert_eq!(failed.status, IssuanceStatus::Failed);

            let candidates = ledger.retry_candidates(300).unwrap();
            assert_eq!(candidates.len(), 1);
            let observed = candidates[0].attempts;

            let claimed = ledger.claim_retry(&k, observed, 300).unwrap().unwrap();
            assert_eq!(claimed.status, IssuanceStatus::Reserved);
            assert_eq!(claimed.attempts, 2);

            // A second reconciler holding the same snapshot loses
            assert!(ledger.claim_retry(&k, observed, 300).unwrap().is_none());

            // The superseded first attempt can no longer settle the record
            assert!(ledger.mark_issued(&k, 1, "0x0", &[]).is_err());
            ledger.mark_issued(&k, 2, "0x1", &[]).unwrap();
            assert!(ledger.retry_candidates(300).unwrap().is_empty());
        }
    }

    #[test]
    fn test_non_retryable_failure_is_not_a_candidate() {
        for (ledger, _dir) in backends() {
            let k = key("dave", 1, "ethereum");
            ledger.reserve(&k, IssuanceOrigin::Local).unwrap();
            ledger
                .mark_failed(&k, 1, &MintError::NonRetryable("bad address".into()))
                .unwrap();

            assert!(ledger.retry_candidates(0).unwrap().is_empty());
            assert!(ledger.claim_retry(&k, 1, 0).unwrap().is_none());
        }
    }

    #[test]
    fn test_stale_reservation_is_candidate() {
        for (ledger, _dir) in backends() {
            let k = key("erin", 4, "ethereum");
            ledger.reserve(&k, IssuanceOrigin::Local).unwrap();

            assert!(ledger.retry_candidates(3_600).unwrap().is_empty());
            assert_eq!(ledger.retry_candidates(0).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_records_for_chain_filters() {
        for (ledger, _dir) in backends() {
            ledger
                .reserve(&key("a", 1, "ethereum"), IssuanceOrigin::Local)
                .unwrap();
            ledger
                .reserve(&key("b", 1, "ethereum"), IssuanceOrigin::Local)
                .unwrap();
            ledger
                .reserve(
                    &key("a", 1, "arbitrum"),
                    IssuanceOrigin::Remote {
                        source_chain: ChainId::new("ethereum"),
                        nonce: 1,
                    },
                )
                .unwrap();

            assert_eq!(ledger.records_for_chain(&ChainId::new("ethereum")).unwrap().len(), 2);
            let remote = ledger.records_for_chain(&ChainId::new("arbitrum")).unwrap();
            assert_eq!(remote.len(), 1);
            assert!(matches!(remote[0].origin, IssuanceOrigin::Remote { nonce: 1, .. }));
            assert_eq!(ledger.records().unwrap().len(), 3);
        }
    }

    #[test]
    fn test_missing_record_transition() {
        let ledger = IssuanceLedger::in_memory();
        assert!(matches!(
            ledger.mark_issued(&key("nobody", 1, "ethereum"), 1, "0x", &[]),
            Err(IssuanceError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_persistent_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger");
        let k = key("frank", 5, "ethereum");

        {
            let ledger = IssuanceLedger::persistent(&path).unwrap();
            ledger.reserve(&k, IssuanceOrigin::Local).unwrap();
            ledger
                .mark_issued(&k, 1, "0xfeed", &[ChainId::new("arbitrum")])
                .unwrap();
            ledger.flush().unwrap();
        }

        let reopened = IssuanceLedger::persistent(&path).unwrap();
        assert_eq!(
            reopened.reserve(&k, IssuanceOrigin::Local).unwrap(),
            Reservation::AlreadyIssued {
                status: IssuanceStatus::Issued
            }
        );
        // Owed relays outlive the process
        let backlog = reopened.relay_backlog().unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].pending_relays, vec![ChainId::new("arbitrum")]);
    }

    #[test]
    fn test_pending_relays_shrink_until_settled() {
        for (ledger, _dir) in backends() {
            let k = key("gina", 2, "ethereum");
            let remotes = [ChainId::new("arbitrum"), ChainId::new("base")];
            ledger.reserve(&k, IssuanceOrigin::Local).unwrap();
            assert!(matches!(
                ledger.settle_relays(&k, &remotes),
                Err(IssuanceError::InvalidTransition { from: "reserved", .. })
            ));

            let issued = ledger.mark_issued(&k, 1, "0xaa", &remotes).unwrap();
            assert_eq!(issued.pending_relays.len(), 2);
            assert_eq!(ledger.relay_backlog().unwrap().len(), 1);

            let settled = ledger.settle_relays(&k, &remotes[..1]).unwrap();
            assert_eq!(settled.pending_relays, vec![ChainId::new("base")]);
            assert_eq!(ledger.relay_backlog().unwrap().len(), 1);

            ledger.settle_relays(&k, &remotes).unwrap();
            assert!(ledger.relay_backlog().unwrap().is_empty());
            assert!(ledger.get(&k).unwrap().unwrap().pending_relays.is_empty());
        }
    }

    #[test]
    fn test_record_without_pending_relays_decodes() {
        let json = r#"{
            "key": { "user_id": "hank", "milestone_id": 1, "chain_id": "ethereum" },
            "origin": { "kind": "local" },
            "status": "issued",
            "reserved_at": 1, "claimed_at": 1, "issued_at": 2,
            "reference": "0x1", "failure": null, "attempts": 1
        }"#;
        let record = decode(json.as_bytes()).unwrap();
        assert!(record.pending_relays.is_empty());
        assert!(!String::from_utf8(encode(&record).unwrap())
            .unwrap()
            .contains("pending_relays"));
    }
}
