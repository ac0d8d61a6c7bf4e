//! HMAC-SHA256 signing of webhook payloads.
//!
//! The signature scheme is frozen, recipients reimplement it byte for byte:
//! - The payload is serialized as canonical JSON: object keys sorted lexicographically at every
//!   depth, no insignificant whitespace (`,` and `:` separators), array order preserved
//! - The signed message is `{timestamp}.{canonical_json}` where `timestamp` is Unix seconds as
//!   a decimal string
//! - The signature is the lowercase hex HMAC-SHA256 of the message keyed with the secret bytes
//! - The canonical JSON is also the request body, sent with the `X-Browser-Use-Timestamp` and
//!   `X-Browser-Use-Signature` headers

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::SecretString;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use sha2::Sha256;

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// Prefix for webhook secrets
pub const SECRET_PREFIX: &str = "whsec_";

/// Header carrying the decimal Unix-seconds timestamp that was signed
pub const TIMESTAMP_HEADER: &str = "X-Browser-Use-Timestamp";

/// Header carrying the lowercase hex HMAC-SHA256 signature
pub const SIGNATURE_HEADER: &str = "X-Browser-Use-Signature";

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid signing key")]
    InvalidKey,
}

/// A payload ready to send: the canonical body plus the header values that authenticate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    pub timestamp: String,
    pub signature: String,
    pub body: String,
}

/// Generate a new webhook secret.
///
/// Returns a `whsec_` prefixed base64-encoded 32-byte random secret. The whole string (prefix
/// included) is the HMAC key.
pub fn generate_secret() -> SecretString {
    use rand::RngCore;

    let mut secret_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret_bytes);

    SecretString::from(format!("{}{}", SECRET_PREFIX, BASE64_STANDARD.encode(secret_bytes)))
}

/// Serialize a JSON value in canonical form.
pub fn canonical_json(payload: &Value) -> Result<String, SigningError> {
    Ok(serde_json::to_string(&Canonical(payload))?)
}

/// Sign `payload` with the current time.
pub fn sign(payload: &Value, secret: &[u8]) -> Result<SignedPayload, SigningError> {
    sign_at(payload, Utc::now().timestamp(), secret)
}

/// Sign `payload` as of `timestamp` (Unix seconds).
pub fn sign_at(payload: &Value, timestamp: i64, secret: &[u8]) -> Result<SignedPayload, SigningError> {
    let body = canonical_json(payload)?;
    let timestamp = timestamp.to_string();
    let signature = sign_message(&timestamp, &body, secret)?;

    Ok(SignedPayload { timestamp, signature, body })
}

/// Compute the hex signature over an already canonical body.
pub fn sign_message(timestamp: &str, canonical_body: &str, secret: &[u8]) -> Result<String, SigningError> {
    let mac = keyed_mac(timestamp, canonical_body, secret)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// HMAC state fed with `{timestamp}.{canonical_body}`, ready to finalize or verify.
pub(crate) fn keyed_mac(timestamp: &str, canonical_body: &str, secret: &[u8]) -> Result<HmacSha256, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SigningError::InvalidKey)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(canonical_body.as_bytes());
    Ok(mac)
}

/// Serializes a `Value` with object keys in sorted order regardless of how the map stores them.
struct Canonical<'a>(&'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

                let mut out = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    out.serialize_entry(key, &Canonical(value))?;
                }
                out.end()
            }
            Value::Array(items) => serializer.collect_seq(items.iter().map(Canonical)),
            scalar => scalar.serialize(serializer),
        }
    }
}
