//! trophy-relay
//!
//! Wire protocol for replicating achievement issuance between a home chain and
//! its remote chains. This crate provides the relay message types and their
//! byte encoding, the router authentication tag, the source-chain allowlist
//! that forms the inbound trust boundary, and the bounded replay window.
//!
//! The transport that carries relay bytes between chains is an external
//! collaborator (see [`relay::Transport`]); it may delay, duplicate, reorder or
//! drop messages.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

pub mod allowlist;
pub mod auth;
pub mod encoding;
pub mod relay;
pub mod replay;

pub use allowlist::{AllowlistEntry, AllowlistSnapshot, SourceChainAllowlist, Verdict};
pub use auth::RouterKey;
pub use encoding::{validate_identifier, MAX_IDENTIFIER_LEN};
pub use relay::{CrossChainRelay, DispatchStatus, InboundVerdict, RelayDispatch, Transport};
pub use replay::ReplayWindow;

/// Rail identifier for trophy relay messages
pub const RAIL_ID_TROPHY_RELAY: &str = "TROPHY_RELAY";

/// Current wire protocol version
pub const PROTOCOL_VERSION: u64 = 1;

/// Domain separator mixed into every signing digest
pub const SIGNING_DOMAIN: &[u8] = b"trophy-relay-v1";

/// Default number of remembered nonces per source chain
pub const DEFAULT_REPLAY_WINDOW: usize = 4096;

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    #[error("invalid router key: {0}")]
    InvalidKey(String),

    #[error("invalid allowlist: {0}")]
    InvalidAllowlist(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

/// Why an inbound relay message was not accepted.
///
/// These are outcomes, not faults: the relay network is assumed unreliable and
/// possibly adversarial, so every variant is an expected condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Bytes did not decode into a well-formed message
    Malformed { detail: String },
    /// Source chain is absent from the allowlist
    UnknownChain { chain_id: ChainId },
    /// Source chain is known but the sender is not its trusted router
    UntrustedSender { chain_id: ChainId, sender: String },
    /// Authentication tag does not verify against the sender key
    BadSignature,
    /// Message is addressed to another chain
    WrongDestination { expected: ChainId, actual: ChainId },
    /// (source chain, nonce) was already accepted
    DuplicateMessage { source_chain: ChainId, nonce: u64 },
    /// Payload references a milestone this chain does not know
    UnknownMilestone { milestone_id: MilestoneId },
}

impl RejectReason {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "MALFORMED",
            Self::UnknownChain { .. } => "UNKNOWN_CHAIN",
            Self::UntrustedSender { .. } => "UNTRUSTED_SENDER",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::WrongDestination { .. } => "WRONG_DESTINATION",
            Self::DuplicateMessage { .. } => "DUPLICATE_MESSAGE",
            Self::UnknownMilestone { .. } => "UNKNOWN_MILESTONE",
        }
    }

    /// Whether this rejection indicates a trust-boundary violation
    pub fn is_trust_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownChain { .. } | Self::UntrustedSender { .. } | Self::BadSignature
        )
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { detail } => write!(f, "malformed message: {detail}"),
            Self::UnknownChain { chain_id } => write!(f, "unknown source chain {chain_id}"),
            Self::UntrustedSender { chain_id, sender } => {
                write!(f, "untrusted sender {sender} for chain {chain_id}")
            }
            Self::BadSignature => write!(f, "authentication tag did not verify"),
            Self::WrongDestination { expected, actual } => {
                write!(f, "message addressed to {actual}, expected {expected}")
            }
            Self::DuplicateMessage { source_chain, nonce } => {
                write!(f, "duplicate message {source_chain}#{nonce}")
            }
            Self::UnknownMilestone { milestone_id } => {
                write!(f, "unknown milestone {milestone_id}")
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IDENTIFIERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Network identifier (e.g. "ethereum", "arbitrum"). Always lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for ChainId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for ChainId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<ChainId> for String {
    fn from(value: ChainId) -> Self {
        value.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque player identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MilestoneId(pub u32);

impl fmt::Display for MilestoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MESSAGES
// ═══════════════════════════════════════════════════════════════════════════════

/// Message types carried on the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// A milestone was issued on the origin chain and should be replicated
    IssuanceRelay = 0,
    /// Snapshot of the origin chain's issued supply
    SupplyReport = 1,
}

impl TryFrom<u8> for MessageType {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::IssuanceRelay),
            1 => Ok(Self::SupplyReport),
            _ => Err(RelayError::InvalidMessageType(value)),
        }
    }
}

/// Issuance event replicated to a remote chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuancePayload {
    pub user_id: UserId,
    pub milestone_id: MilestoneId,
}

/// Issued supply of the sending chain at the time of sending
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyReport {
    pub total: u64,
    pub per_milestone: BTreeMap<MilestoneId, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayBody {
    Issuance(IssuancePayload),
    SupplyReport(SupplyReport),
}

impl RelayBody {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Issuance(_) => MessageType::IssuanceRelay,
            Self::SupplyReport(_) => MessageType::SupplyReport,
        }
    }
}

/// Authenticated, nonce-tagged message between two chain coordinators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    /// Strictly increasing per (source, destination)
    pub nonce: u64,
    /// Ed25519 verifying key of the sending router
    pub sender: [u8; 32],
    pub body: RelayBody,
    /// Ed25519 signature over [`RelayMessage::signing_digest`]
    pub signature: [u8; 64],
}

impl RelayMessage {
    pub fn msg_type(&self) -> MessageType {
        self.body.msg_type()
    }

    /// Encode the message to bytes
    pub fn encode(&self) -> Vec<u8> {
        encoding::encode_message(self)
    }

    /// Decode a message from bytes, validating its structure
    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        encoding::decode_message(bytes)
    }

    /// Digest covered by the authentication tag
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(SIGNING_DOMAIN);
        hasher.update(encoding::encode_unsigned(self));
        hasher.finalize().into()
    }

    pub fn sender_hex(&self) -> String {
        hex::encode(self.sender)
    }

    /// Human-readable reference, e.g. `ethereum#7->arbitrum`
    pub fn message_ref(&self) -> String {
        format!(
            "{}#{}->{}",
            self.source_chain, self.nonce, self.destination_chain
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0).unwrap(), MessageType::IssuanceRelay);
        assert_eq!(MessageType::try_from(1).unwrap(), MessageType::SupplyReport);
        assert!(matches!(
            MessageType::try_from(7),
            Err(RelayError::InvalidMessageType(7))
        ));
    }

    #[test]
    fn test_chain_id_is_normalised() {
        assert_eq!(ChainId::new(" Ethereum "), ChainId::new("ethereum"));
        let parsed: ChainId = serde_json::from_str("\"ARBITRUM\"").unwrap();
        assert_eq!(parsed.as_str(), "arbitrum");
    }

    #[test]
    fn test_reject_reason_codes() {
        let reason = RejectReason::UnknownChain {
            chain_id: ChainId::new("x"),
        };
        assert_eq!(reason.code(), "UNKNOWN_CHAIN");
        assert!(reason.is_trust_violation());

        let duplicate = RejectReason::DuplicateMessage {
            source_chain: ChainId::new("ethereum"),
            nonce: 3,
        };
        assert!(!duplicate.is_trust_violation());
        assert_eq!(duplicate.to_string(), "duplicate message ethereum#3");
    }

    #[test]
    fn test_digest_changes_with_body() {
        let mut message = RelayMessage {
            source_chain: ChainId::new("ethereum"),
            destination_chain: ChainId::new("arbitrum"),
            nonce: 1,
            sender: [9u8; 32],
            body: RelayBody::Issuance(IssuancePayload {
                user_id: UserId::new("player-1"),
                milestone_id: MilestoneId(3),
            }),
            signature: [0u8; 64],
        };
        let before = message.signing_digest();

        message.signature = [1u8; 64];
        assert_eq!(before, message.signing_digest(), "signature is not covered");

        message.body = RelayBody::Issuance(IssuancePayload {
            user_id: UserId::new("player-1"),
            milestone_id: MilestoneId(4),
        });
        assert_ne!(before, message.signing_digest());
        assert_eq!(message.message_ref(), "ethereum#1->arbitrum");
    }
}
