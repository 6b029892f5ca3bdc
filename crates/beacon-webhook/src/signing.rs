//! HMAC-SHA256 webhook signatures.
//!
//! The signed message is `"{timestamp}.{event_type}.{body}"`, where `body`
//! is the exact request body (which embeds the payload and delivery id).
//! Receivers recompute the MAC with the shared secret and also reject
//! timestamps outside a tolerance window so captured requests cannot be
//! replayed later.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";
pub const EVENT_HEADER: &str = "x-webhook-event";
pub const DELIVERY_HEADER: &str = "x-webhook-delivery";
pub const ATTEMPT_HEADER: &str = "x-webhook-attempt";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("malformed timestamp")]
    MalformedTimestamp,
    #[error("signature mismatch")]
    Mismatch,
    #[error("timestamp outside tolerance ({age_secs}s old)")]
    Stale { age_secs: i64 },
    #[error("invalid signing key")]
    InvalidKey,
    #[error("malformed body: {0}")]
    MalformedBody(String),
}

impl VerificationError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingHeader(_) => "missing_header",
            Self::MalformedSignature => "malformed_signature",
            Self::MalformedTimestamp => "malformed_timestamp",
            Self::Mismatch => "signature_mismatch",
            Self::Stale { .. } => "stale",
            Self::InvalidKey => "invalid_key",
            Self::MalformedBody(_) => "malformed_body",
        }
    }
}

fn mac_for(
    secret: &str,
    timestamp: i64,
    event_type: &str,
    body: &[u8],
) -> Result<HmacSha256, VerificationError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| VerificationError::InvalidKey)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(event_type.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// Compute the signature header value (`sha256=<hex>`).
pub fn sign(
    secret: &str,
    timestamp: i64,
    event_type: &str,
    body: &[u8],
) -> Result<String, VerificationError> {
    let mac = mac_for(secret, timestamp, event_type, body)?;
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a signature header against the message. Comparison is constant time.
pub fn verify(
    secret: &str,
    signature: &str,
    timestamp: i64,
    event_type: &str,
    body: &[u8],
) -> Result<(), VerificationError> {
    let hex_sig = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(VerificationError::MalformedSignature)?;
    let expected = hex::decode(hex_sig).map_err(|_| VerificationError::MalformedSignature)?;
    mac_for(secret, timestamp, event_type, body)?
        .verify_slice(&expected)
        .map_err(|_| VerificationError::Mismatch)
}

/// Reject timestamps further than `tolerance` from `now` in either direction.
pub fn check_freshness(timestamp: i64, now: i64, tolerance: Duration) -> Result<(), VerificationError> {
    let age_secs = now.saturating_sub(timestamp);
    if age_secs.unsigned_abs() > tolerance.as_secs() {
        return Err(VerificationError::Stale { age_secs });
    }
    Ok(())
}
