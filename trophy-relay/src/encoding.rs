//! Byte encoding for relay messages
//!
//! Integers are written as 32-byte big-endian words and strings as a length
//! word followed by the UTF-8 bytes zero-padded to a word boundary, so the
//! layout stays readable by ABI-style decoders on the receiving chain.
//!
//! Layout:
//! ```text
//! msg_type (1) | version (32) | nonce (32) | source chain (str) |
//! destination chain (str) | sender key (32) | body | signature (64)
//! ```

use crate::{
    ChainId, IssuancePayload, MessageType, MilestoneId, RelayBody, RelayError, RelayMessage,
    SupplyReport, UserId, PROTOCOL_VERSION,
};

const WORD: usize = 32;
const SIGNATURE_LEN: usize = 64;

/// Longest accepted chain or user identifier, in bytes
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Check an identifier against the limits the decoder enforces.
///
/// Anything refused here would be rejected as malformed by every receiving
/// chain, so local callers check before acting on it.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), RelayError> {
    match length_violation(field, value.len()) {
        Some(detail) => Err(RelayError::InvalidIdentifier(detail)),
        None => Ok(()),
    }
}

fn length_violation(field: &str, len: usize) -> Option<String> {
    if len == 0 {
        return Some(format!("{field} is empty"));
    }
    if len > MAX_IDENTIFIER_LEN {
        return Some(format!("{field} too long: {len} > {MAX_IDENTIFIER_LEN}"));
    }
    None
}

/// Encode everything covered by the authentication tag
pub fn encode_unsigned(message: &RelayMessage) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(1 + 8 * WORD);

    encoded.push(message.msg_type() as u8);
    push_word(&mut encoded, PROTOCOL_VERSION);
    push_word(&mut encoded, message.nonce);
    push_string(&mut encoded, message.source_chain.as_str());
    push_string(&mut encoded, message.destination_chain.as_str());
    encoded.extend_from_slice(&message.sender);

    match &message.body {
        RelayBody::Issuance(payload) => {
            push_string(&mut encoded, payload.user_id.as_str());
            push_word(&mut encoded, u64::from(payload.milestone_id.0));
        }
        RelayBody::SupplyReport(report) => {
            push_word(&mut encoded, report.total);
            push_word(&mut encoded, report.per_milestone.len() as u64);
            for (milestone_id, issued) in &report.per_milestone {
                push_word(&mut encoded, u64::from(milestone_id.0));
                push_word(&mut encoded, *issued);
            }
        }
    }

    encoded
}

/// Encode a complete, signed message
pub fn encode_message(message: &RelayMessage) -> Vec<u8> {
    let mut encoded = encode_unsigned(message);
    encoded.extend_from_slice(&message.signature);
    encoded
}

/// Decode and structurally validate a message
pub fn decode_message(bytes: &[u8]) -> Result<RelayMessage, RelayError> {
    if bytes.is_empty() {
        return Err(RelayError::Decoding("empty payload".into()));
    }

    let msg_type = MessageType::try_from(bytes[0])?;
    let mut reader = Reader::new(&bytes[1..]);

    let version = reader.word("version")?;
    if version != PROTOCOL_VERSION {
        return Err(RelayError::UnsupportedVersion(version));
    }

    let nonce = reader.word("nonce")?;
    let source_chain = ChainId::new(reader.identifier("source chain")?);
    let destination_chain = ChainId::new(reader.identifier("destination chain")?);
    let sender = reader.fixed32("sender")?;

    let body = match msg_type {
        MessageType::IssuanceRelay => {
            let user_id = UserId::new(reader.identifier("user id")?);
            let milestone_id = reader.milestone_id()?;
            RelayBody::Issuance(IssuancePayload {
                user_id,
                milestone_id,
            })
        }
        MessageType::SupplyReport => {
            let total = reader.word("supply total")?;
            let count = reader.word("supply entry count")?;
            // Each entry is two words; reject counts the input cannot hold
            if count > (reader.remaining() / (2 * WORD)) as u64 {
                return Err(RelayError::Decoding(format!(
                    "supply entry count {count} exceeds payload"
                )));
            }

            let mut report = SupplyReport {
                total,
                ..SupplyReport::default()
            };
            for _ in 0..count {
                let milestone_id = reader.milestone_id()?;
                let issued = reader.word("supply entry")?;
                if report.per_milestone.insert(milestone_id, issued).is_some() {
                    return Err(RelayError::Decoding(format!(
                        "duplicate supply entry for milestone {milestone_id}"
                    )));
                }
            }
            RelayBody::SupplyReport(report)
        }
    };

    let signature_bytes = reader.take(SIGNATURE_LEN, "signature")?;
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(signature_bytes);

    reader.finish()?;

    Ok(RelayMessage {
        source_chain,
        destination_chain,
        nonce,
        sender,
        body,
        signature,
    })
}

fn push_word(out: &mut Vec<u8>, value: u64) {
    let mut word = [0u8; WORD];
    word[24..].copy_from_slice(&value.to_be_bytes());
    out.extend_from_slice(&word);
}

fn push_string(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    push_word(out, bytes.len() as u64);

    let padded_len = bytes.len().div_ceil(WORD) * WORD;
    let mut padded = vec![0u8; padded_len];
    padded[..bytes.len()].copy_from_slice(bytes);
    out.extend_from_slice(&padded);
}

/// Bounds-checked cursor over an encoded message
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], RelayError> {
        if self.remaining() < len {
            return Err(RelayError::Decoding(format!(
                "{field} truncated: need {len} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn word(&mut self, field: &str) -> Result<u64, RelayError> {
        let word = self.take(WORD, field)?;
        if word[..24].iter().any(|b| *b != 0) {
            return Err(RelayError::Decoding(format!("{field} overflows u64")));
        }
        let mut value = [0u8; 8];
        value.copy_from_slice(&word[24..]);
        Ok(u64::from_be_bytes(value))
    }

    fn fixed32(&mut self, field: &str) -> Result<[u8; 32], RelayError> {
        let bytes = self.take(WORD, field)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn milestone_id(&mut self) -> Result<MilestoneId, RelayError> {
        let raw = self.word("milestone id")?;
        u32::try_from(raw)
            .map(MilestoneId)
            .map_err(|_| RelayError::Decoding(format!("milestone id {raw} overflows u32")))
    }

    fn identifier(&mut self, field: &str) -> Result<String, RelayError> {
        let len = self.word(field)? as usize;
        if let Some(detail) = length_violation(field, len) {
            return Err(RelayError::Decoding(detail));
        }

        let padded = self.take(len.div_ceil(WORD) * WORD, field)?;
        if padded[len..].iter().any(|b| *b != 0) {
            return Err(RelayError::Decoding(format!("{field} has non-zero padding")));
        }

        String::from_utf8(padded[..len].to_vec())
            .map_err(|_| RelayError::Decoding(format!("{field} is not valid UTF-8")))
    }

    fn finish(self) -> Result<(), RelayError> {
        if self.remaining() != 0 {
            return Err(RelayError::Decoding(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuance_message() -> RelayMessage {
        RelayMessage {
            source_chain: ChainId::new("ethereum"),
            destination_chain: ChainId::new("arbitrum"),
            nonce: 42,
            sender: [7u8; 32],
            body: RelayBody::Issuance(IssuancePayload {
                user_id: UserId::new("player-0001"),
                milestone_id: MilestoneId(5),
            }),
            signature: [3u8; 64],
        }
    }

    #[test]
    fn test_issuance_layout() {
        let encoded = issuance_message().encode();

        // type + version + nonce + 2 chain strings (len + 1 word each)
        // + sender + user string (len + 1 word) + milestone + signature
        assert_eq!(encoded.len(), 1 + 2 * WORD + 4 * WORD + WORD + 2 * WORD + WORD + 64);
        assert_eq!(encoded[0], MessageType::IssuanceRelay as u8);

        let decoded = RelayMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, issuance_message());
    }

    #[test]
    fn test_supply_report_decodes() {
        let mut report = SupplyReport {
            total: 3,
            ..SupplyReport::default()
        };
        report.per_milestone.insert(MilestoneId(1), 2);
        report.per_milestone.insert(MilestoneId(2), 1);

        let mut message = issuance_message();
        message.body = RelayBody::SupplyReport(report.clone());

        let decoded = RelayMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded.body, RelayBody::SupplyReport(report));
    }

    #[test]
    fn test_rejects_empty_and_unknown_type() {
        assert!(matches!(
            RelayMessage::decode(&[]),
            Err(RelayError::Decoding(_))
        ));

        let mut encoded = issuance_message().encode();
        encoded[0] = 9;
        assert!(matches!(
            RelayMessage::decode(&encoded),
            Err(RelayError::InvalidMessageType(9))
        ));
    }

    #[test]
    fn test_rejects_truncation_and_trailing_bytes() {
        let encoded = issuance_message().encode();

        let truncated = &encoded[..encoded.len() - 1];
        assert!(RelayMessage::decode(truncated).is_err());

        let mut extended = encoded.clone();
        extended.push(0);
        let err = RelayMessage::decode(&extended).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let mut encoded = issuance_message().encode();
        encoded[1 + WORD - 1] = 2;
        assert!(matches!(
            RelayMessage::decode(&encoded),
            Err(RelayError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_rejects_empty_identifier() {
        let mut message = issuance_message();
        message.body = RelayBody::Issuance(IssuancePayload {
            user_id: UserId::new(""),
            milestone_id: MilestoneId(1),
        });
        let err = RelayMessage::decode(&message.encode()).unwrap_err();
        assert!(err.to_string().contains("user id is empty"));
    }

    #[test]
    fn test_identifier_limits_match_decoder() {
        assert!(validate_identifier("user id", "alice").is_ok());
        assert!(validate_identifier("user id", &"u".repeat(MAX_IDENTIFIER_LEN)).is_ok());

        let err = validate_identifier("user id", "").unwrap_err();
        assert!(matches!(err, RelayError::InvalidIdentifier(ref d) if d == "user id is empty"));

        let long = "u".repeat(MAX_IDENTIFIER_LEN + 1);
        let err = validate_identifier("user id", &long).unwrap_err();
        assert!(err.to_string().contains("user id too long: 257 > 256"));

        // Whatever passes the check survives the wire
        let mut message = issuance_message();
        message.body = RelayBody::Issuance(IssuancePayload {
            user_id: UserId::new("u".repeat(MAX_IDENTIFIER_LEN)),
            milestone_id: MilestoneId(1),
        });
        assert!(RelayMessage::decode(&message.encode()).is_ok());

        message.body = RelayBody::Issuance(IssuancePayload {
            user_id: UserId::new(long),
            milestone_id: MilestoneId(1),
        });
        let err = RelayMessage::decode(&message.encode()).unwrap_err();
        assert!(err.to_string().contains("user id too long"));
    }

    #[test]
    fn test_rejects_oversized_supply_count() {
        let mut message = issuance_message();
        message.body = RelayBody::SupplyReport(SupplyReport::default());
        let mut encoded = message.encode();

        // count word sits right after the total word, before the signature
        let count_end = encoded.len() - 64;
        encoded[count_end - 1] = 200;
        let err = RelayMessage::decode(&encoded).unwrap_err();
        assert!(err.to_string().contains("exceeds payload"));
    }
}
