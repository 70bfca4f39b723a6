//! Issuance coordinator
//!
//! Owns the write path to the ledger and the supply counters. Local path:
//! win report -> evaluator -> reserve -> mint -> mark issued -> supply ->
//! relay fan-out. Remote path: relay verification -> reserve -> mint ->
//! mark issued -> supply.
//!
//! Relay messages that were not delivered stay on the issued record and are
//! sent again by [`IssuanceCoordinator::reconcile`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{error, info, warn};
use trophy_relay::{
    validate_identifier, AllowlistEntry, ChainId, CrossChainRelay, DispatchStatus,
    InboundVerdict, IssuancePayload, MilestoneId, RejectReason, RelayBody, RelayDispatch,
    RouterKey, SourceChainAllowlist, SupplyReport, Transport, UserId,
};

use crate::config::CoordinatorConfig;
use crate::ledger::{
    IssuanceKey, IssuanceLedger, IssuanceOrigin, IssuanceRecord, IssuanceStatus, Reservation,
};
use crate::milestones::{MilestoneEvaluator, MilestoneTable};
use crate::mint::{MintRequest, Minter};
use crate::supply::{ChainSupply, SupplyTracker};
use crate::{IssuanceError, MintError};

// ═══════════════════════════════════════════════════════════════════════════════
// OUTCOMES
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of one issuance attempt or one inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IssuanceOutcome {
    Issued {
        key: IssuanceKey,
        reference: String,
        /// Relay messages sent for a local issuance; empty for remote ones
        relayed: Vec<RelayDispatch>,
    },
    /// Key was already reserved; expected for duplicates and retries
    AlreadyIssued {
        key: IssuanceKey,
        status: IssuanceStatus,
    },
    /// Mint failed after reservation; the record is left `Failed`
    MintFailed {
        key: IssuanceKey,
        error: String,
        retryable: bool,
    },
    Rejected {
        reason: RejectReason,
    },
    SupplyReportRecorded {
        source_chain: ChainId,
        nonce: u64,
        /// False when a newer report from the same chain was already stored
        applied: bool,
    },
}

impl IssuanceOutcome {
    pub fn is_issued(&self) -> bool {
        matches!(self, Self::Issued { .. })
    }

    pub fn key(&self) -> Option<&IssuanceKey> {
        match self {
            Self::Issued { key, .. }
            | Self::AlreadyIssued { key, .. }
            | Self::MintFailed { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Supply counters of a chain next to the ledger records they must match
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupplyAudit {
    pub supply: ChainSupply,
    pub issued_records: u64,
    pub pending_records: u64,
    pub failed_records: u64,
    pub consistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InSync,
    /// Peer has fewer issuances; relay delivery still in flight
    Lagging,
    /// Peer has more issuances than the home chain
    Divergent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MilestoneComparison {
    pub milestone_id: MilestoneId,
    pub home: u64,
    pub peer: u64,
    pub status: SyncStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrossChainAudit {
    pub home_chain: ChainId,
    pub peer_chain: ChainId,
    pub report_nonce: u64,
    pub home_total: u64,
    pub peer_total: u64,
    pub milestones: Vec<MilestoneComparison>,
    pub status: SyncStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub issued: Vec<IssuanceKey>,
    pub still_failing: Vec<IssuanceKey>,
    /// Claimed by another reconciler or no longer eligible
    pub skipped: usize,
    /// Failed records that need operator attention
    pub non_retryable: usize,
    /// Owed relay messages delivered during this pass
    pub relays_delivered: usize,
    /// Owed relay messages that failed again
    pub relays_outstanding: usize,
}

#[derive(Debug, Clone)]
struct PeerReport {
    nonce: u64,
    report: SupplyReport,
}

// ═══════════════════════════════════════════════════════════════════════════════
// COORDINATOR
// ═══════════════════════════════════════════════════════════════════════════════

pub struct IssuanceCoordinator {
    chain_id: ChainId,
    evaluator: MilestoneEvaluator,
    ledger: IssuanceLedger,
    supply: SupplyTracker,
    relay: CrossChainRelay,
    minter: Arc<dyn Minter>,
    remote_chains: Vec<ChainId>,
    peer_reports: DashMap<ChainId, PeerReport>,
    mint_timeout: Duration,
    stale_reservation_secs: u64,
}

impl IssuanceCoordinator {
    /// Build a coordinator with the ledger backend named in the config.
    ///
    /// Outbound nonces start above the current time in microseconds so they
    /// keep increasing across restarts.
    pub fn from_config(
        config: &CoordinatorConfig,
        router_key: RouterKey,
        minter: Arc<dyn Minter>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, IssuanceError> {
        let ledger = match &config.ledger_path {
            Some(path) => IssuanceLedger::persistent(path)?,
            None => IssuanceLedger::in_memory(),
        };
        let nonce_floor = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Self::with_ledger(config, router_key, ledger, minter, transport, nonce_floor)
    }

    pub fn with_ledger(
        config: &CoordinatorConfig,
        router_key: RouterKey,
        ledger: IssuanceLedger,
        minter: Arc<dyn Minter>,
        transport: Arc<dyn Transport>,
        nonce_floor: u64,
    ) -> Result<Self, IssuanceError> {
        config.validate()?;

        let table = MilestoneTable::new(config.milestones.clone())?;
        let allowlist = Arc::new(SourceChainAllowlist::from_entries(&config.allowlist)?);
        let relay = CrossChainRelay::new(
            config.chain_id.clone(),
            router_key,
            allowlist,
            transport,
            config.replay_window,
            config.relay_timeout(),
            nonce_floor,
        );

        // Counters follow the ledger, including records from earlier runs
        let supply = SupplyTracker::from_records(&ledger.records()?);

        info!(
            chain = %config.chain_id,
            milestones = table.len(),
            remotes = config.remote_chains.len(),
            persistent = ledger.is_persistent(),
            "Issuance coordinator ready"
        );

        Ok(Self {
            chain_id: config.chain_id.clone(),
            evaluator: MilestoneEvaluator::new(table),
            ledger,
            supply,
            relay,
            minter,
            remote_chains: config.remote_chains.clone(),
            peer_reports: DashMap::new(),
            mint_timeout: config.mint_timeout(),
            stale_reservation_secs: config.stale_reservation_secs,
        })
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn remote_chains(&self) -> &[ChainId] {
        &self.remote_chains
    }

    pub fn milestones(&self) -> &MilestoneTable {
        self.evaluator.table()
    }

    pub fn ledger(&self) -> &IssuanceLedger {
        &self.ledger
    }

    pub fn router_identity(&self) -> String {
        self.relay.identity_hex()
    }

    pub fn allowlist(&self) -> &Arc<SourceChainAllowlist> {
        self.relay.allowlist()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Local issuance
    // ───────────────────────────────────────────────────────────────────────────

    /// Issue every milestone crossed by `previous -> new`, in ascending order.
    ///
    /// Safe under duplicate win reports: already reserved keys come back as
    /// `AlreadyIssued`. Only a backwards range, a user id the relay cannot
    /// carry, or a storage fault is an error.
    pub async fn evaluate_and_issue(
        &self,
        user_id: &UserId,
        previous: u64,
        new: u64,
    ) -> Result<Vec<IssuanceOutcome>, IssuanceError> {
        validate_identifier("user id", user_id.as_str())
            .map_err(|e| IssuanceError::InvalidUser(e.to_string()))?;

        let crossed = self.evaluator.evaluate(previous, new)?;
        let mut outcomes = Vec::with_capacity(crossed.len());

        for milestone_id in crossed {
            let key = IssuanceKey::new(user_id.clone(), milestone_id, self.chain_id.clone());
            let outcome = match self.ledger.reserve(&key, IssuanceOrigin::Local)? {
                Reservation::Reserved => self.complete(key, 1, &IssuanceOrigin::Local).await?,
                Reservation::AlreadyIssued { status } => {
                    info!(key = %key, status = status.as_str(), "Milestone already reserved");
                    IssuanceOutcome::AlreadyIssued { key, status }
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Inbound
    // ───────────────────────────────────────────────────────────────────────────

    /// Verify and apply raw relay bytes. Channel anomalies come back as
    /// `Rejected`; only storage faults are errors.
    pub async fn handle_inbound_message(
        &self,
        bytes: &[u8],
    ) -> Result<IssuanceOutcome, IssuanceError> {
        let message = match self.relay.receive(bytes) {
            InboundVerdict::Accepted(message) => message,
            InboundVerdict::Rejected(reason) => return Ok(IssuanceOutcome::Rejected { reason }),
        };

        match message.body {
            RelayBody::Issuance(payload) => {
                self.apply_remote(message.source_chain, message.nonce, payload)
                    .await
            }
            RelayBody::SupplyReport(report) => {
                Ok(self.record_peer_report(message.source_chain, message.nonce, report))
            }
        }
    }

    /// Only reachable with a message that passed the inbound pipeline
    async fn apply_remote(
        &self,
        source_chain: ChainId,
        nonce: u64,
        payload: IssuancePayload,
    ) -> Result<IssuanceOutcome, IssuanceError> {
        if !self.milestones().contains(payload.milestone_id) {
            warn!(
                source = %source_chain,
                nonce,
                milestone = %payload.milestone_id,
                "Relay message references unknown milestone"
            );
            return Ok(IssuanceOutcome::Rejected {
                reason: RejectReason::UnknownMilestone {
                    milestone_id: payload.milestone_id,
                },
            });
        }

        let key = IssuanceKey::new(payload.user_id, payload.milestone_id, self.chain_id.clone());
        let origin = IssuanceOrigin::Remote {
            source_chain,
            nonce,
        };

        match self.ledger.reserve(&key, origin.clone())? {
            Reservation::Reserved => self.complete(key, 1, &origin).await,
            Reservation::AlreadyIssued { status } => {
                info!(key = %key, status = status.as_str(), "Remote issuance already applied");
                Ok(IssuanceOutcome::AlreadyIssued { key, status })
            }
        }
    }

    fn record_peer_report(
        &self,
        source_chain: ChainId,
        nonce: u64,
        report: SupplyReport,
    ) -> IssuanceOutcome {
        let mut stored = self
            .peer_reports
            .entry(source_chain.clone())
            .or_insert_with(|| PeerReport {
                nonce: 0,
                report: SupplyReport::default(),
            });

        // Reports can arrive out of order; keep the newest
        let applied = nonce > stored.nonce;
        if applied {
            *stored = PeerReport { nonce, report };
        }
        drop(stored);

        info!(source = %source_chain, nonce, applied, "Supply report received");
        IssuanceOutcome::SupplyReportRecorded {
            source_chain,
            nonce,
            applied,
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Mint completion
    // ───────────────────────────────────────────────────────────────────────────

    /// Mint a key this caller holds claim `attempt` on, then settle the record
    async fn complete(
        &self,
        key: IssuanceKey,
        attempt: u32,
        origin: &IssuanceOrigin,
    ) -> Result<IssuanceOutcome, IssuanceError> {
        let Some(milestone) = self.milestones().get(key.milestone_id) else {
            let err = MintError::NonRetryable(format!("unknown milestone {}", key.milestone_id));
            return self.settle_failure(key, attempt, err);
        };

        let request = MintRequest {
            chain_id: key.chain_id.clone(),
            user_id: key.user_id.clone(),
            milestone_id: key.milestone_id,
            token_kind: milestone.token_kind.clone(),
        };

        let minted = match tokio::time::timeout(self.mint_timeout, self.minter.mint(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(MintError::Timeout(self.mint_timeout.as_millis() as u64)),
        };

        let reference = match minted {
            Ok(reference) => reference,
            Err(err) => return self.settle_failure(key, attempt, err),
        };

        let owed = match origin {
            IssuanceOrigin::Local => self.remote_chains.clone(),
            IssuanceOrigin::Remote { .. } => Vec::new(),
        };
        self.ledger.mark_issued(&key, attempt, &reference, &owed)?;
        self.supply.increment(&key.chain_id, key.milestone_id);
        info!(key = %key, reference = %reference, "Milestone issued");

        let relayed = if owed.is_empty() {
            Vec::new()
        } else {
            let dispatches = self.relay.broadcast(&owed, &issuance_body(&key)).await;
            let delivered: Vec<ChainId> = dispatches
                .iter()
                .filter(|d| d.status == DispatchStatus::Delivered)
                .map(|d| d.destination.clone())
                .collect();
            if !delivered.is_empty() {
                self.ledger.settle_relays(&key, &delivered)?;
            }
            dispatches
        };

        Ok(IssuanceOutcome::Issued {
            key,
            reference,
            relayed,
        })
    }

    fn settle_failure(
        &self,
        key: IssuanceKey,
        attempt: u32,
        err: MintError,
    ) -> Result<IssuanceOutcome, IssuanceError> {
        warn!(key = %key, retryable = err.is_retryable(), "Mint failed: {}", err);
        self.ledger.mark_failed(&key, attempt, &err)?;
        Ok(IssuanceOutcome::MintFailed {
            key,
            error: err.to_string(),
            retryable: err.is_retryable(),
        })
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Audit
    // ───────────────────────────────────────────────────────────────────────────

    /// Compare a chain's supply counters with its ledger records.
    ///
    /// A mismatch is tallied a second time before it is reported, since an
    /// issuance caught between its ledger write and its supply increment
    /// looks the same as drift for that instant.
    pub fn audit_supply(&self, chain_id: &ChainId) -> Result<SupplyAudit, IssuanceError> {
        let mut audit = self.tally(chain_id)?;
        if !audit.consistent {
            std::thread::yield_now();
            audit = self.tally(chain_id)?;
        }

        if !audit.consistent {
            error!(
                chain = %chain_id,
                supply_total = audit.supply.total,
                issued_records = audit.issued_records,
                "Supply diverges from issuance records"
            );
        }
        Ok(audit)
    }

    fn tally(&self, chain_id: &ChainId) -> Result<SupplyAudit, IssuanceError> {
        let supply = self.supply.get(chain_id);
        let records = self.ledger.records_for_chain(chain_id)?;

        let mut audit = SupplyAudit {
            supply: supply.clone(),
            issued_records: 0,
            pending_records: 0,
            failed_records: 0,
            consistent: true,
        };
        let mut issued_by_milestone = ChainSupply::empty(chain_id.clone());
        for record in &records {
            match record.status {
                IssuanceStatus::Issued => {
                    audit.issued_records += 1;
                    issued_by_milestone.total += 1;
                    *issued_by_milestone
                        .per_milestone
                        .entry(record.key.milestone_id)
                        .or_insert(0) += 1;
                }
                IssuanceStatus::Reserved => audit.pending_records += 1,
                IssuanceStatus::Failed => audit.failed_records += 1,
            }
        }

        audit.consistent = issued_by_milestone == supply;
        Ok(audit)
    }

    pub fn supply(&self, chain_id: &ChainId) -> ChainSupply {
        self.supply.get(chain_id)
    }

    /// Send a signed snapshot of this chain's supply to a peer
    pub async fn send_supply_report(
        &self,
        destination: &ChainId,
    ) -> Result<RelayDispatch, IssuanceError> {
        if *destination == self.chain_id {
            return Err(IssuanceError::Config(
                "supply report destination is the home chain".into(),
            ));
        }
        let report = self.supply.get(&self.chain_id).to_report();
        Ok(self
            .relay
            .send(destination, RelayBody::SupplyReport(report))
            .await)
    }

    /// Compare home supply with the latest report received from `peer`.
    /// `None` until a report from that chain has been accepted.
    pub fn cross_chain_audit(&self, peer: &ChainId) -> Option<CrossChainAudit> {
        let stored = self.peer_reports.get(peer).map(|entry| entry.value().clone())?;
        let home = self.supply.get(&self.chain_id);

        let milestone_ids: BTreeSet<MilestoneId> = home
            .per_milestone
            .keys()
            .chain(stored.report.per_milestone.keys())
            .copied()
            .collect();

        let milestones: Vec<_> = milestone_ids
            .into_iter()
            .map(|milestone_id| {
                let home_count = home.issued(milestone_id);
                let peer_count = stored
                    .report
                    .per_milestone
                    .get(&milestone_id)
                    .copied()
                    .unwrap_or(0);
                MilestoneComparison {
                    milestone_id,
                    home: home_count,
                    peer: peer_count,
                    status: compare(home_count, peer_count),
                }
            })
            .collect();

        let mut status = compare(home.total, stored.report.total);
        for comparison in &milestones {
            status = status.max_severity(comparison.status);
        }

        match status {
            SyncStatus::Divergent => error!(
                home = %self.chain_id,
                peer = %peer,
                home_total = home.total,
                peer_total = stored.report.total,
                "Peer supply exceeds home issuance"
            ),
            SyncStatus::Lagging => info!(
                home = %self.chain_id,
                peer = %peer,
                home_total = home.total,
                peer_total = stored.report.total,
                "Peer supply lagging"
            ),
            SyncStatus::InSync => {}
        }

        Some(CrossChainAudit {
            home_chain: self.chain_id.clone(),
            peer_chain: peer.clone(),
            report_nonce: stored.nonce,
            home_total: home.total,
            peer_total: stored.report.total,
            milestones,
            status,
        })
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Reconciliation and administration
    // ───────────────────────────────────────────────────────────────────────────

    /// Retry retryable failures and stale reservations once each, then re-send
    /// every relay message an issued record still owes.
    ///
    /// Scheduling and backoff are left to the caller.
    pub async fn reconcile(&self) -> Result<ReconcileReport, IssuanceError> {
        let candidates = self.ledger.retry_candidates(self.stale_reservation_secs)?;
        let mut report = ReconcileReport {
            examined: candidates.len(),
            ..ReconcileReport::default()
        };

        for candidate in candidates {
            let Some(claimed) = self.ledger.claim_retry(
                &candidate.key,
                candidate.attempts,
                self.stale_reservation_secs,
            )?
            else {
                report.skipped += 1;
                continue;
            };

            info!(key = %claimed.key, attempt = claimed.attempts, "Retrying issuance");
            match self
                .complete(claimed.key, claimed.attempts, &claimed.origin)
                .await?
            {
                IssuanceOutcome::Issued { key, .. } => report.issued.push(key),
                IssuanceOutcome::MintFailed { key, .. } => report.still_failing.push(key),
                _ => {}
            }
        }

        for record in self.ledger.relay_backlog()? {
            // Just minted above; its broadcast already ran
            if report.issued.contains(&record.key) {
                continue;
            }
            self.resend_relays(&record, &mut report).await?;
        }

        report.non_retryable = self
            .ledger
            .records()?
            .iter()
            .filter(|record| {
                record.status == IssuanceStatus::Failed
                    && record.failure.as_ref().is_some_and(|f| !f.retryable)
            })
            .count();

        info!(
            examined = report.examined,
            issued = report.issued.len(),
            still_failing = report.still_failing.len(),
            relays_delivered = report.relays_delivered,
            relays_outstanding = report.relays_outstanding,
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    /// Send an owed issuance again, each time under a fresh nonce. Receivers
    /// key on (user, milestone), so a copy that did arrive earlier is harmless.
    async fn resend_relays(
        &self,
        record: &IssuanceRecord,
        report: &mut ReconcileReport,
    ) -> Result<(), IssuanceError> {
        let body = issuance_body(&record.key);
        let mut settled = Vec::new();

        for destination in &record.pending_relays {
            if !self.remote_chains.contains(destination) {
                warn!(
                    key = %record.key,
                    %destination,
                    "Dropping owed relay to a chain that is no longer a remote"
                );
                settled.push(destination.clone());
                continue;
            }

            let dispatch = self.relay.send(destination, body.clone()).await;
            if dispatch.status == DispatchStatus::Delivered {
                report.relays_delivered += 1;
                settled.push(destination.clone());
            } else {
                report.relays_outstanding += 1;
            }
        }

        if !settled.is_empty() {
            self.ledger.settle_relays(&record.key, &settled)?;
        }
        Ok(())
    }

    /// Atomically replace the source-chain allowlist; returns the new generation
    pub fn reload_allowlist(&self, entries: &[AllowlistEntry]) -> Result<u64, IssuanceError> {
        Ok(self.relay.allowlist().reload(entries)?)
    }
}

fn issuance_body(key: &IssuanceKey) -> RelayBody {
    RelayBody::Issuance(IssuancePayload {
        user_id: key.user_id.clone(),
        milestone_id: key.milestone_id,
    })
}

fn compare(home: u64, peer: u64) -> SyncStatus {
    match peer.cmp(&home) {
        std::cmp::Ordering::Equal => SyncStatus::InSync,
        std::cmp::Ordering::Less => SyncStatus::Lagging,
        std::cmp::Ordering::Greater => SyncStatus::Divergent,
    }
}

impl SyncStatus {
    fn max_severity(self, other: Self) -> Self {
        match (self, other) {
            (Self::Divergent, _) | (_, Self::Divergent) => Self::Divergent,
            (Self::Lagging, _) | (_, Self::Lagging) => Self::Lagging,
            _ => Self::InSync,
        }
    }
}
