//! Recipient-side verification of webhook signatures.
//!
//! Recipients recompute the signature over the canonical form of the received payload and
//! compare it in constant time. [`verify_request`] also fails closed on missing headers,
//! malformed input and timestamps outside the tolerance window (replay mitigation).

use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use hmac::Mac;
use serde_json::Value;

use super::signing::{SIGNATURE_HEADER, TIMESTAMP_HEADER, canonical_json, keyed_mac};

/// Clock skew recipients should accept between the signed timestamp and their own clock.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("missing X-Browser-Use-Timestamp header")]
    MissingTimestamp,
    #[error("missing X-Browser-Use-Signature header")]
    MissingSignature,
    #[error("timestamp is not a decimal Unix-seconds value")]
    MalformedTimestamp,
    #[error("payload is not a JSON object")]
    MalformedPayload,
    #[error("timestamp is outside the {tolerance_secs}s tolerance window")]
    StaleTimestamp { tolerance_secs: u64 },
    #[error("signature mismatch")]
    SignatureMismatch,
}

impl VerifyError {
    /// Status a recipient should answer with when rejecting the request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingTimestamp | Self::MissingSignature | Self::MalformedTimestamp | Self::MalformedPayload => {
                StatusCode::BAD_REQUEST
            }
            Self::StaleTimestamp { .. } | Self::SignatureMismatch => StatusCode::FORBIDDEN,
        }
    }
}

/// Check `received_signature` against the payload and timestamp.
///
/// Returns `false` for any mismatch, including a signature that is not valid hex.
pub fn verify(payload: &Value, timestamp: &str, received_signature: &str, secret: &[u8]) -> bool {
    let Ok(body) = canonical_json(payload) else {
        return false;
    };
    let Ok(received) = hex::decode(received_signature) else {
        return false;
    };
    let Ok(mac) = keyed_mac(timestamp, &body, secret) else {
        return false;
    };

    // verify_slice compares in constant time
    mac.verify_slice(&received).is_ok()
}

/// Full recipient check of a raw request body and its header values.
///
/// On success returns the parsed payload.
pub fn verify_request(
    body: &[u8],
    timestamp: Option<&str>,
    signature: Option<&str>,
    secret: &[u8],
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<Value, VerifyError> {
    let timestamp = timestamp.ok_or(VerifyError::MissingTimestamp)?;
    let signature = signature.ok_or(VerifyError::MissingSignature)?;

    let sent_at: i64 = timestamp.trim().parse().map_err(|_| VerifyError::MalformedTimestamp)?;

    let payload: Value = serde_json::from_slice(body).map_err(|_| VerifyError::MalformedPayload)?;
    if !payload.is_object() {
        return Err(VerifyError::MalformedPayload);
    }

    let skew = now.timestamp().abs_diff(sent_at);
    if skew > tolerance.as_secs() {
        return Err(VerifyError::StaleTimestamp {
            tolerance_secs: tolerance.as_secs(),
        });
    }

    if !verify(&payload, timestamp, signature, secret) {
        return Err(VerifyError::SignatureMismatch);
    }

    Ok(payload)
}

/// [`verify_request`] reading the timestamp and signature from request headers.
pub fn verify_headers(headers: &HeaderMap, body: &[u8], secret: &[u8], tolerance: Duration) -> Result<Value, VerifyError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    verify_request(
        body,
        header(TIMESTAMP_HEADER),
        header(SIGNATURE_HEADER),
        secret,
        tolerance,
        Utc::now(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::signing::sign_at;
    use axum::http::HeaderName;
    use serde_json::json;

    fn event(status: &str) -> Value {
        json!({
            "session_id": "602c8809-61ee-461d-acfd-3e8783f23326",
            "task_id": "b9792a06-0411-4838-96de-c720f34206a2",
            "status": status,
        })
    }

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).unwrap()
    }

    #[test]
    fn test_sign_then_verify() {
        for status in ["initializing", "started", "paused", "stopped", "finished"] {
            let payload = event(status);
            let signed = sign_at(&payload, 1_700_000_000, b"s3cr3t").unwrap();
            assert!(verify(&payload, &signed.timestamp, &signed.signature, b"s3cr3t"));
        }
    }

    #[test]
    fn test_tampering_invalidates_signature() {
        let payload = event("initializing");
        let signed = sign_at(&payload, 1_700_000_000, b"s3cr3t").unwrap();

        // Changed field value
        assert!(!verify(&event("finished"), &signed.timestamp, &signed.signature, b"s3cr3t"));

        // Changed identifier
        let mut other = payload.clone();
        other["task_id"] = json!("00000000-0000-0000-0000-000000000000");
        assert!(!verify(&other, &signed.timestamp, &signed.signature, b"s3cr3t"));

        // Changed timestamp
        assert!(!verify(&payload, "1700000001", &signed.signature, b"s3cr3t"));

        // Wrong secret
        assert!(!verify(&payload, &signed.timestamp, &signed.signature, b"other"));
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let payload = event("started");
        assert!(!verify(&payload, "1700000000", "not-hex", b"s3cr3t"));
        assert!(!verify(&payload, "1700000000", "abcd", b"s3cr3t"));
        assert!(!verify(&payload, "1700000000", "", b"s3cr3t"));
    }

    #[test]
    fn test_verify_request_accepts_reordered_body() {
        let signed = sign_at(&event("paused"), 1_700_000_000, b"s3cr3t").unwrap();
        let reordered = r#"{ "status": "paused", "task_id": "b9792a06-0411-4838-96de-c720f34206a2",
            "session_id": "602c8809-61ee-461d-acfd-3e8783f23326" }"#;

        let payload = verify_request(
            reordered.as_bytes(),
            Some(&signed.timestamp),
            Some(&signed.signature),
            b"s3cr3t",
            DEFAULT_TOLERANCE,
            at(1_700_000_010),
        )
        .unwrap();
        assert_eq!(payload["status"], "paused");
    }

    #[test]
    fn test_verify_request_fails_closed() {
        let signed = sign_at(&event("stopped"), 1_700_000_000, b"s3cr3t").unwrap();
        let body = signed.body.as_bytes();
        let now = at(1_700_000_000);

        assert_eq!(
            verify_request(body, None, Some(&signed.signature), b"s3cr3t", DEFAULT_TOLERANCE, now),
            Err(VerifyError::MissingTimestamp)
        );
        assert_eq!(
            verify_request(body, Some(&signed.timestamp), None, b"s3cr3t", DEFAULT_TOLERANCE, now),
            Err(VerifyError::MissingSignature)
        );
        assert_eq!(
            verify_request(body, Some("yesterday"), Some(&signed.signature), b"s3cr3t", DEFAULT_TOLERANCE, now),
            Err(VerifyError::MalformedTimestamp)
        );
        assert_eq!(
            verify_request(b"{not json", Some(&signed.timestamp), Some(&signed.signature), b"s3cr3t", DEFAULT_TOLERANCE, now),
            Err(VerifyError::MalformedPayload)
        );
        assert_eq!(
            verify_request(b"[1,2]", Some(&signed.timestamp), Some(&signed.signature), b"s3cr3t", DEFAULT_TOLERANCE, now),
            Err(VerifyError::MalformedPayload)
        );
        assert_eq!(
            verify_request(body, Some(&signed.timestamp), Some(&signed.signature), b"wrong", DEFAULT_TOLERANCE, now),
            Err(VerifyError::SignatureMismatch)
        );
        assert_eq!(VerifyError::SignatureMismatch.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_verify_request_rejects_stale_timestamp() {
        let signed = sign_at(&event("finished"), 1_700_000_000, b"s3cr3t").unwrap();
        let body = signed.body.as_bytes();

        let late = verify_request(
            body,
            Some(&signed.timestamp),
            Some(&signed.signature),
            b"s3cr3t",
            DEFAULT_TOLERANCE,
            at(1_700_000_301),
        );
        assert_eq!(late, Err(VerifyError::StaleTimestamp { tolerance_secs: 300 }));

        // Clock skew in the other direction counts too
        let early = verify_request(
            body,
            Some(&signed.timestamp),
            Some(&signed.signature),
            b"s3cr3t",
            DEFAULT_TOLERANCE,
            at(1_699_999_000),
        );
        assert!(matches!(early, Err(VerifyError::StaleTimestamp { .. })));

        let on_edge = verify_request(
            body,
            Some(&signed.timestamp),
            Some(&signed.signature),
            b"s3cr3t",
            DEFAULT_TOLERANCE,
            at(1_700_000_300),
        );
        assert!(on_edge.is_ok());
    }

    #[test]
    fn test_verify_headers() {
        let signed = crate::webhooks::signing::sign(&event("started"), b"s3cr3t").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_bytes(TIMESTAMP_HEADER.as_bytes()).unwrap(), signed.timestamp.parse().unwrap());
        headers.insert(HeaderName::from_bytes(SIGNATURE_HEADER.as_bytes()).unwrap(), signed.signature.parse().unwrap());

        assert!(verify_headers(&headers, signed.body.as_bytes(), b"s3cr3t", DEFAULT_TOLERANCE).is_ok());

        headers.remove(SIGNATURE_HEADER);
        assert_eq!(
            verify_headers(&headers, signed.body.as_bytes(), b"s3cr3t", DEFAULT_TOLERANCE),
            Err(VerifyError::MissingSignature)
        );
    }
}
