//! Cross-chain relay
//!
//! Outbound: assigns a strictly increasing nonce per destination, signs the
//! message with the local router key and hands the bytes to a [`Transport`]
//! under a timeout. Inbound: runs the verification pipeline
//! (structure, allowlist, signature, destination, replay window) and yields
//! either the accepted message or the reason it was rejected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    auth, ChainId, RejectReason, RelayBody, RelayMessage, ReplayWindow, RouterKey,
    SourceChainAllowlist, Verdict,
};

/// Carries encoded relay messages to a remote chain.
///
/// Delivery is at-least-once at best: implementations may delay, duplicate,
/// reorder or drop messages.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, destination: &ChainId, bytes: Vec<u8>) -> anyhow::Result<()>;
}

/// What happened to one outbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DispatchStatus {
    Delivered,
    /// Transport did not answer within the relay timeout
    Pending,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayDispatch {
    pub destination: ChainId,
    pub nonce: u64,
    pub message_ref: String,
    pub status: DispatchStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundVerdict {
    Accepted(RelayMessage),
    Rejected(RejectReason),
}

pub struct CrossChainRelay {
    local_chain: ChainId,
    key: RouterKey,
    allowlist: Arc<SourceChainAllowlist>,
    replay: ReplayWindow,
    /// Last nonce used per destination
    nonces: DashMap<ChainId, u64>,
    nonce_floor: u64,
    transport: Arc<dyn Transport>,
    send_timeout: Duration,
}

impl CrossChainRelay {
    /// `nonce_floor` seeds every destination counter; the first nonce sent is
    /// `nonce_floor + 1`. Services pass a clock-derived floor so nonces keep
    /// increasing across restarts.
    pub fn new(
        local_chain: ChainId,
        key: RouterKey,
        allowlist: Arc<SourceChainAllowlist>,
        transport: Arc<dyn Transport>,
        replay_capacity: usize,
        send_timeout: Duration,
        nonce_floor: u64,
    ) -> Self {
        Self {
            local_chain,
            key,
            allowlist,
            replay: ReplayWindow::new(replay_capacity),
            nonces: DashMap::new(),
            nonce_floor,
            transport,
            send_timeout,
        }
    }

    pub fn local_chain(&self) -> &ChainId {
        &self.local_chain
    }

    pub fn identity_hex(&self) -> String {
        self.key.identity_hex()
    }

    pub fn allowlist(&self) -> &Arc<SourceChainAllowlist> {
        &self.allowlist
    }

    pub fn replay_window(&self) -> &ReplayWindow {
        &self.replay
    }

    fn next_nonce(&self, destination: &ChainId) -> u64 {
        let mut last = self
            .nonces
            .entry(destination.clone())
            .or_insert(self.nonce_floor);
        *last += 1;
        *last
    }

    /// Build and sign the next message for `destination`
    pub fn seal(&self, destination: &ChainId, body: RelayBody) -> RelayMessage {
        let mut message = RelayMessage {
            source_chain: self.local_chain.clone(),
            destination_chain: destination.clone(),
            nonce: self.next_nonce(destination),
            sender: self.key.identity(),
            body,
            signature: [0u8; 64],
        };
        message.signature = self.key.sign(&message.signing_digest());
        message
    }

    /// Seal and dispatch one message. Never fails: transport problems are
    /// reported in the returned status.
    pub async fn send(&self, destination: &ChainId, body: RelayBody) -> RelayDispatch {
        let message = self.seal(destination, body);
        let message_ref = message.message_ref();

        let status = match tokio::time::timeout(
            self.send_timeout,
            self.transport.deliver(destination, message.encode()),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!("Relay message {} delivered", message_ref);
                DispatchStatus::Delivered
            }
            Ok(Err(e)) => {
                warn!("Relay message {} failed: {:#}", message_ref, e);
                DispatchStatus::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    "Relay message {} not confirmed within {:?}",
                    message_ref, self.send_timeout
                );
                DispatchStatus::Pending
            }
        };

        RelayDispatch {
            destination: destination.clone(),
            nonce: message.nonce,
            message_ref,
            status,
        }
    }

    /// Send the same body to every destination concurrently
    pub async fn broadcast(&self, destinations: &[ChainId], body: &RelayBody) -> Vec<RelayDispatch> {
        join_all(
            destinations
                .iter()
                .filter(|destination| **destination != self.local_chain)
                .map(|destination| self.send(destination, body.clone())),
        )
        .await
    }

    /// Run the inbound verification pipeline on raw relay bytes.
    ///
    /// The (source, nonce) pair is recorded only once every other check has
    /// passed, so unauthenticated input can never consume a nonce.
    pub fn receive(&self, bytes: &[u8]) -> InboundVerdict {
        let message = match RelayMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                return self.reject(RejectReason::Malformed {
                    detail: e.to_string(),
                })
            }
        };

        if let Verdict::Rejected(reason) = self
            .allowlist
            .verify(&message.source_chain, &message.sender)
        {
            return self.reject(reason);
        }

        if !auth::verify_tag(
            &message.sender,
            &message.signing_digest(),
            &message.signature,
        ) {
            return self.reject(RejectReason::BadSignature);
        }

        if message.destination_chain != self.local_chain {
            return self.reject(RejectReason::WrongDestination {
                expected: self.local_chain.clone(),
                actual: message.destination_chain,
            });
        }

        if !self.replay.observe(&message.source_chain, message.nonce) {
            return self.reject(RejectReason::DuplicateMessage {
                source_chain: message.source_chain,
                nonce: message.nonce,
            });
        }

        info!(
            relay = %message.message_ref(),
            msg_type = ?message.msg_type(),
            "Accepted relay message"
        );
        InboundVerdict::Accepted(message)
    }

    fn reject(&self, reason: RejectReason) -> InboundVerdict {
        match reason {
            // Expected on an at-least-once channel
            RejectReason::DuplicateMessage { .. } => {
                info!(code = reason.code(), "Dropped relay message: {}", reason)
            }
            _ => warn!(code = reason.code(), "Rejected relay message: {}", reason),
        }
        InboundVerdict::Rejected(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllowlistEntry, IssuancePayload, MilestoneId, UserId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(ChainId, Vec<u8>)>>,
    }

    #[async_trait]
    impl Transport for Outbox {
        async fn deliver(&self, destination: &ChainId, bytes: Vec<u8>) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((destination.clone(), bytes));
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn deliver(&self, destination: &ChainId, _bytes: Vec<u8>) -> anyhow::Result<()> {
            anyhow::bail!("no route to {destination}")
        }
    }

    struct Stalled;

    #[async_trait]
    impl Transport for Stalled {
        async fn deliver(&self, _destination: &ChainId, _bytes: Vec<u8>) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn payload() -> RelayBody {
        RelayBody::Issuance(IssuancePayload {
            user_id: UserId::new("player-1"),
            milestone_id: MilestoneId(2),
        })
    }

    /// Home relay on "ethereum" and a receiver on "arbitrum" that trusts it
    fn pair(transport: Arc<dyn Transport>) -> (CrossChainRelay, CrossChainRelay) {
        let home_key = RouterKey::from_bytes(&[1u8; 32]);
        let remote_key = RouterKey::from_bytes(&[2u8; 32]);

        let home_allowlist = Arc::new(SourceChainAllowlist::from_entries(&[]).unwrap());
        let remote_allowlist = Arc::new(
            SourceChainAllowlist::from_entries(&[AllowlistEntry::new(
                "ethereum",
                home_key.identity_hex(),
            )])
            .unwrap(),
        );

        let home = CrossChainRelay::new(
            ChainId::new("ethereum"),
            home_key,
            home_allowlist,
            transport,
            16,
            Duration::from_millis(50),
            0,
        );
        let remote = CrossChainRelay::new(
            ChainId::new("arbitrum"),
            remote_key,
            remote_allowlist,
            Arc::new(Outbox::default()),
            16,
            Duration::from_millis(50),
            0,
        );
        (home, remote)
    }

    #[test]
    fn test_nonces_increase_per_destination() {
        let (home, _) = pair(Arc::new(Outbox::default()));
        let arbitrum = ChainId::new("arbitrum");
        let base = ChainId::new("base");

        assert_eq!(home.seal(&arbitrum, payload()).nonce, 1);
        assert_eq!(home.seal(&arbitrum, payload()).nonce, 2);
        assert_eq!(home.seal(&base, payload()).nonce, 1);
    }

    #[test]
    fn test_nonce_floor_offsets_counter() {
        let relay = CrossChainRelay::new(
            ChainId::new("ethereum"),
            RouterKey::from_bytes(&[1u8; 32]),
            Arc::new(SourceChainAllowlist::from_entries(&[]).unwrap()),
            Arc::new(Outbox::default()),
            16,
            Duration::from_secs(1),
            1_000,
        );
        assert_eq!(relay.seal(&ChainId::new("arbitrum"), payload()).nonce, 1_001);
    }

    #[test]
    fn test_accepts_once_then_duplicate() {
        let (home, remote) = pair(Arc::new(Outbox::default()));
        let bytes = home.seal(&ChainId::new("arbitrum"), payload()).encode();

        assert!(matches!(remote.receive(&bytes), InboundVerdict::Accepted(_)));
        assert_eq!(
            remote.receive(&bytes),
            InboundVerdict::Rejected(RejectReason::DuplicateMessage {
                source_chain: ChainId::new("ethereum"),
                nonce: 1,
            })
        );
    }

    #[test]
    fn test_rejects_untrusted_and_tampered() {
        let (home, remote) = pair(Arc::new(Outbox::default()));

        // Unknown source chain
        let stranger = CrossChainRelay::new(
            ChainId::new("x"),
            RouterKey::from_bytes(&[9u8; 32]),
            Arc::new(SourceChainAllowlist::from_entries(&[]).unwrap()),
            Arc::new(Outbox::default()),
            16,
            Duration::from_secs(1),
            0,
        );
        let bytes = stranger.seal(&ChainId::new("arbitrum"), payload()).encode();
        assert!(matches!(
            remote.receive(&bytes),
            InboundVerdict::Rejected(RejectReason::UnknownChain { .. })
        ));

        // Known chain, wrong router
        let mut message = home.seal(&ChainId::new("arbitrum"), payload());
        let impostor = RouterKey::from_bytes(&[8u8; 32]);
        message.sender = impostor.identity();
        message.signature = impostor.sign(&message.signing_digest());
        assert!(matches!(
            remote.receive(&message.encode()),
            InboundVerdict::Rejected(RejectReason::UntrustedSender { .. })
        ));

        // Tampered body keeps the sender but breaks the tag
        let mut message = home.seal(&ChainId::new("arbitrum"), payload());
        message.body = RelayBody::Issuance(IssuancePayload {
            user_id: UserId::new("player-1"),
            milestone_id: MilestoneId(9),
        });
        let nonce = message.nonce;
        assert_eq!(
            remote.receive(&message.encode()),
            InboundVerdict::Rejected(RejectReason::BadSignature)
        );
        assert!(!remote.replay_window().contains(&ChainId::new("ethereum"), nonce));
    }

    #[test]
    fn test_rejects_wrong_destination_and_garbage() {
        let (home, remote) = pair(Arc::new(Outbox::default()));
        let bytes = home.seal(&ChainId::new("base"), payload()).encode();
        assert!(matches!(
            remote.receive(&bytes),
            InboundVerdict::Rejected(RejectReason::WrongDestination { .. })
        ));

        assert!(matches!(
            remote.receive(&[0xff, 0x00]),
            InboundVerdict::Rejected(RejectReason::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_reports_transport_outcome() {
        let outbox = Arc::new(Outbox::default());
        let (home, remote) = pair(outbox.clone());

        let dispatch = home.send(&ChainId::new("arbitrum"), payload()).await;
        assert_eq!(dispatch.status, DispatchStatus::Delivered);
        assert_eq!(dispatch.message_ref, "ethereum#1->arbitrum");

        let (destination, bytes) = outbox.sent.lock().unwrap().pop().unwrap();
        assert_eq!(destination.as_str(), "arbitrum");
        assert!(matches!(remote.receive(&bytes), InboundVerdict::Accepted(_)));

        let (failing, _) = pair(Arc::new(Unreachable));
        let dispatch = failing.send(&ChainId::new("arbitrum"), payload()).await;
        assert!(matches!(dispatch.status, DispatchStatus::Failed(ref e) if e.contains("no route")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_as_pending() {
        let (home, _) = pair(Arc::new(Stalled));
        let dispatch = home.send(&ChainId::new("arbitrum"), payload()).await;
        assert_eq!(dispatch.status, DispatchStatus::Pending);
    }

    #[tokio::test]
    async fn test_broadcast_skips_local_chain() {
        let outbox = Arc::new(Outbox::default());
        let (home, _) = pair(outbox.clone());

        let destinations = [
            ChainId::new("arbitrum"),
            ChainId::new("ethereum"),
            ChainId::new("base"),
        ];
        let dispatches = home.broadcast(&destinations, &payload()).await;

        assert_eq!(dispatches.len(), 2);
        assert_eq!(outbox.sent.lock().unwrap().len(), 2);
    }
}
