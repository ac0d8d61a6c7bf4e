//! Outbound HTTP for signed webhook payloads.
//!
//! Shared by the registration probe and the dispatcher. The sender has no access to secrets:
//! it receives an already signed payload and reports what the recipient answered.

use std::time::{Duration, Instant};

use super::signing::{SIGNATURE_HEADER, SignedPayload, TIMESTAMP_HEADER};

/// Outcome of a single HTTP send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success { status_code: u16 },
    Failure { status_code: Option<u16>, error: String },
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Success { status_code } => Some(*status_code),
            Self::Failure { status_code, .. } => *status_code,
        }
    }
}

/// Result of a send, with the time it took.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub outcome: SendOutcome,
    pub duration: Duration,
}

#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
}

impl WebhookSender {
    /// Build a sender whose requests are bounded by `request_timeout` unless overridden per call.
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            // A redirect is an answer from the recipient, not an acknowledgement
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("taskhooks/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    /// POST a signed payload. Any 2xx within the timeout is a success; everything else,
    /// including connection errors and timeouts, is a failure.
    pub async fn send(&self, url: &str, signed: &SignedPayload, timeout: Option<Duration>) -> SendReport {
        let start = Instant::now();

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(TIMESTAMP_HEADER, &signed.timestamp)
            .header(SIGNATURE_HEADER, &signed.signature)
            .body(signed.body.clone());
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        // The response (and its connection) is dropped as soon as the status is read
        let outcome = match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    SendOutcome::Success {
                        status_code: status.as_u16(),
                    }
                } else {
                    SendOutcome::Failure {
                        status_code: Some(status.as_u16()),
                        error: format!("HTTP {}", status.as_u16()),
                    }
                }
            }
            Err(e) if e.is_timeout() => SendOutcome::Failure {
                status_code: None,
                error: "request timed out".to_string(),
            },
            Err(e) => SendOutcome::Failure {
                status_code: None,
                error: e.to_string(),
            },
        };

        SendReport {
            outcome,
            duration: start.elapsed(),
        }
    }
}
