use thiserror::Error;
use trophy_relay::RelayError;

use crate::ledger::IssuanceKey;

#[derive(Debug, Error)]
pub enum IssuanceError {
    /// Win count went backwards; a caller bug, never retried
    #[error("invalid win-count range: new {new} < previous {previous}")]
    InvalidRange { previous: u64, new: u64 },

    /// User id that no remote chain would accept
    #[error("invalid user id: {0}")]
    InvalidUser(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("record not found: {0}")]
    RecordNotFound(IssuanceKey),

    #[error("invalid status transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: IssuanceKey,
        from: &'static str,
        to: &'static str,
    },

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Failure reported by a chain's mint primitive
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MintError {
    #[error("retryable mint failure: {0}")]
    Retryable(String),

    /// e.g. malformed input rejected by the ledger
    #[error("non-retryable mint failure: {0}")]
    NonRetryable(String),

    #[error("mint timed out after {0} ms")]
    Timeout(u64),
}

impl MintError {
    /// Everything but an explicit non-retryable classification is retried
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NonRetryable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_error_classification() {
        assert!(MintError::Retryable("rpc down".into()).is_retryable());
        assert!(MintError::Timeout(10_000).is_retryable());
        assert!(!MintError::NonRetryable("bad user".into()).is_retryable());
    }

    #[test]
    fn test_invalid_range_message() {
        let err = IssuanceError::InvalidRange {
            previous: 10,
            new: 3,
        };
        assert_eq!(
            err.to_string(),
            "invalid win-count range: new 3 < previous 10"
        );
    }
}
