//! Router keys and relay authentication tags
//!
//! Every coordinator signs outbound messages with its router key. The sender
//! identity carried in a message is the router's Ed25519 verifying key, which
//! receivers match against their allowlist before checking the tag.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::RelayError;

/// Signing key of the local router
#[derive(Clone)]
pub struct RouterKey {
    signing: SigningKey,
}

impl RouterKey {
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// Parse a hex-encoded 32-byte secret (optional `0x` prefix)
    pub fn from_hex(secret: &str) -> Result<Self, RelayError> {
        let bytes = decode_hex32(secret)
            .map_err(|reason| RelayError::InvalidKey(format!("router secret: {reason}")))?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Verifying key that identifies this router to its peers
    pub fn identity(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn identity_hex(&self) -> String {
        hex::encode(self.identity())
    }

    pub fn sign(&self, digest: &[u8; 32]) -> [u8; 64] {
        self.signing.sign(digest).to_bytes()
    }
}

impl fmt::Debug for RouterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterKey")
            .field("identity", &self.identity_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a hex-encoded router identity (verifying key)
pub fn parse_identity(identity: &str) -> Result<[u8; 32], RelayError> {
    let bytes = decode_hex32(identity)
        .map_err(|reason| RelayError::InvalidKey(format!("router identity: {reason}")))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| RelayError::InvalidKey("router identity is not a valid point".into()))?;
    Ok(bytes)
}

/// Check an authentication tag against the claimed sender
pub fn verify_tag(sender: &[u8; 32], digest: &[u8; 32], signature: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(sender) else {
        return false;
    };
    key.verify_strict(digest, &Signature::from_bytes(signature))
        .is_ok()
}

fn decode_hex32(value: &str) -> Result<[u8; 32], String> {
    let value = value.trim();
    let value = value.strip_prefix("0x").unwrap_or(value);
    let bytes = hex::decode(value).map_err(|e| format!("invalid hex: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
