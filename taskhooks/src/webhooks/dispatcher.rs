//! Webhook dispatch: sign, send, retry, record.
//!
//! ```text
//! dispatch()                                   // never blocks the caller
//!   └─ tracker.spawn(deliver()):
//!        loop over DeliveryState
//!          Pending{n}
//!            ├─ registry.get()                 // disabled/deleted → Abandoned
//!            ├─ CPU: sign()                    // fresh timestamp per attempt
//!            ├─ acquire semaphore permit       // caps outbound concurrency
//!            ├─ HTTP POST
//!            └─ log.put(record)
//!          Backoff{n+1, delay}
//!            └─ sleep(delay) | shutdown        // no permit held while waiting
//!          Delivered → registry.record_success()
//!          Exhausted → registry.record_failure()
//! ```
//!
//! Each (event, endpoint) pair runs in its own task, so a slow or failing endpoint only ever
//! delays its own deliveries. On shutdown, sends already in flight finish and pending backoffs
//! are abandoned.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::types::{AccountId, DeliveryId, EndpointId, abbrev_uuid};
use crate::webhooks::deliveries::{AttemptOutcome, DeliveryAttempt, DeliveryLog, DeliveryRecord};
use crate::webhooks::registry::EndpointRegistry;
use crate::webhooks::retry::{DeliveryState, RetryPolicy};
use crate::webhooks::signing;
use crate::webhooks::transport::{SendOutcome, WebhookSender};

/// Final result of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Exhausted { attempts: u32 },
    /// Stopped before the retry budget was used up
    Abandoned { attempts: u32, reason: String },
}

pub struct DeliveryDispatcher {
    registry: Arc<EndpointRegistry>,
    sender: WebhookSender,
    policy: RetryPolicy,
    log: DeliveryLog,
    semaphore: Semaphore,
    tracker: TaskTracker,
    /// Serializes drain and shutdown so a drain never reopens a tracker shutdown has closed
    lifecycle: Mutex<()>,
    shutdown: CancellationToken,
}

impl DeliveryDispatcher {
    pub fn new(
        config: &WebhookConfig,
        registry: Arc<EndpointRegistry>,
        sender: WebhookSender,
        log: DeliveryLog,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            sender,
            policy: RetryPolicy::from_config(config),
            log,
            semaphore: Semaphore::new(config.max_concurrent_sends),
            tracker: TaskTracker::new(),
            lifecycle: Mutex::new(()),
            shutdown,
        }
    }

    /// Start delivering `payload` to an endpoint in the background.
    pub fn dispatch(self: &Arc<Self>, account_id: AccountId, endpoint_id: EndpointId, payload: Value) -> DeliveryId {
        let delivery_id = Uuid::new_v4();
        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            this.deliver(delivery_id, account_id, endpoint_id, payload).await;
        });
        delivery_id
    }

    /// Deliver `payload` to an endpoint, retrying per the policy, and report the final outcome.
    #[instrument(
        skip(self, account_id, payload),
        fields(delivery_id = %abbrev_uuid(&delivery_id), endpoint_id = %abbrev_uuid(&endpoint_id))
    )]
    pub async fn deliver(
        &self,
        delivery_id: DeliveryId,
        account_id: AccountId,
        endpoint_id: EndpointId,
        payload: Value,
    ) -> DeliveryOutcome {
        let mut record = DeliveryRecord::new(delivery_id, account_id, endpoint_id, payload);
        self.log.put(&record).await;

        let mut state = DeliveryState::start();
        loop {
            match state {
                DeliveryState::Pending { attempt } => {
                    // Disabled or deleted endpoints receive nothing further
                    let endpoint = match self.registry.get(endpoint_id) {
                        Ok(endpoint) if endpoint.is_active() => endpoint,
                        _ => return self.abandon(&mut record, "endpoint disabled or deleted").await,
                    };

                    let signed = match signing::sign(&record.payload, endpoint.secret().expose_secret().as_bytes()) {
                        Ok(signed) => signed,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to sign webhook payload");
                            return self.abandon(&mut record, format!("signing failed: {}", e)).await;
                        }
                    };

                    tracing::debug!(url = %endpoint.url, attempt, "Sending webhook HTTP request");
                    let sent_at = Utc::now();
                    let report = {
                        let Ok(_permit) = self.semaphore.acquire().await else {
                            return self.abandon(&mut record, "dispatcher closed").await;
                        };
                        self.sender.send(&endpoint.url, &signed, None).await
                    };

                    let success = report.outcome.is_success();
                    let outcome_label = if success { "success" } else { "failure" };
                    counter!("taskhooks_webhook_attempts_total", "outcome" => outcome_label).increment(1);

                    let next = state.on_outcome(success, &self.policy);
                    let outcome = match next {
                        DeliveryState::Delivered { .. } => AttemptOutcome::Success,
                        DeliveryState::Exhausted { .. } => AttemptOutcome::PermanentFailure,
                        _ => AttemptOutcome::TransientFailure,
                    };
                    let status_code = report.outcome.status_code();
                    let error = match report.outcome {
                        SendOutcome::Success { .. } => None,
                        SendOutcome::Failure { error, .. } => Some(error),
                    };
                    if let Some(error) = &error {
                        tracing::warn!(attempt, status_code = ?status_code, error = %error, "Webhook delivery attempt failed");
                    }

                    record.record_attempt(DeliveryAttempt {
                        attempt_number: attempt,
                        timestamp: signed.timestamp,
                        signature: signed.signature,
                        status_code,
                        outcome,
                        error,
                        sent_at,
                        duration_ms: u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
                    });
                    self.log.put(&record).await;
                    state = next;
                }
                DeliveryState::Backoff { next_attempt, delay } => {
                    tracing::debug!(next_attempt, delay = ?delay, "Scheduling webhook retry");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => state = state.on_backoff_elapsed(),
                        _ = self.shutdown.cancelled() => {
                            return self.abandon(&mut record, "shutting down").await;
                        }
                    }
                }
                DeliveryState::Delivered { attempts } => {
                    counter!("taskhooks_webhook_deliveries_total", "outcome" => "delivered").increment(1);
                    self.registry.record_success(endpoint_id);
                    tracing::debug!(attempts, "Webhook delivered successfully");
                    return DeliveryOutcome::Delivered { attempts };
                }
                DeliveryState::Exhausted { attempts } => {
                    counter!("taskhooks_webhook_deliveries_total", "outcome" => "exhausted").increment(1);
                    // The endpoint may have been deleted while the last attempt was in flight;
                    // record_failure is a no-op then.
                    self.registry.record_failure(endpoint_id);
                    tracing::warn!(attempts, last_error = ?record.last_error, "Webhook delivery exhausted its retries");
                    return DeliveryOutcome::Exhausted { attempts };
                }
            }
        }
    }

    /// Wait for every delivery started so far to finish, then keep accepting new ones.
    ///
    /// Pending backoffs are waited out. Once [`shutdown`](Self::shutdown) has been called the
    /// dispatcher stays closed.
    pub async fn drain(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
        if !self.shutdown.is_cancelled() {
            self.tracker.reopen();
        }
    }

    /// Stop scheduling retries and wait for in-flight sends to finish.
    pub async fn shutdown(&self) {
        // Cancel first: a running drain is waiting on backoffs this cuts short
        self.shutdown.cancel();
        let _lifecycle = self.lifecycle.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Webhook dispatcher stopped");
    }

    /// Number of deliveries still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    async fn abandon(&self, record: &mut DeliveryRecord, reason: impl Into<String>) -> DeliveryOutcome {
        let reason = reason.into();
        counter!("taskhooks_webhook_deliveries_total", "outcome" => "abandoned").increment(1);
        tracing::info!(reason = %reason, "Webhook delivery abandoned");

        record.abandon(reason.clone());
        self.log.put(record).await;

        DeliveryOutcome::Abandoned {
            attempts: u32::try_from(record.attempts.len()).unwrap_or(u32::MAX),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_webhook_config, wait_for_requests};
    use crate::webhooks::deliveries::DeliveryStatus;
    use crate::webhooks::signing::{SIGNATURE_HEADER, TIMESTAMP_HEADER, sign_message};
    use serde_json::json;
    use std::time::{Duration, Instant};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        registry: Arc<EndpointRegistry>,
        dispatcher: Arc<DeliveryDispatcher>,
        log: DeliveryLog,
    }

    fn harness(config: WebhookConfig) -> Harness {
        let sender = WebhookSender::new(config.request_timeout).unwrap();
        let registry = Arc::new(EndpointRegistry::new(&config, sender.clone()));
        let log = DeliveryLog::new(1000, Duration::from_secs(60));
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            &config,
            registry.clone(),
            sender,
            log.clone(),
            CancellationToken::new(),
        ));
        Harness {
            registry,
            dispatcher,
            log,
        }
    }

    async fn server_responding(status: u16) -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&mock_server)
            .await;
        mock_server
    }

    fn event() -> Value {
        json!({
            "session_id": "602c8809-61ee-461d-acfd-3e8783f23326",
            "task_id": "b9792a06-0411-4838-96de-c720f34206a2",
            "status": "initializing",
        })
    }

    #[test_log::test(tokio::test)]
    async fn test_delivery_is_signed_with_endpoint_secret() {
        let mock_server = server_responding(200).await;
        let h = harness(test_webhook_config());
        let endpoint = h.registry.insert_active(Uuid::new_v4(), &mock_server.uri(), "s3cr3t");

        let outcome = h
            .dispatcher
            .deliver(Uuid::new_v4(), endpoint.account_id, endpoint.id, event())
            .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });

        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];

        let body = std::str::from_utf8(&request.body).unwrap();
        assert_eq!(
            body,
            r#"{"session_id":"602c8809-61ee-461d-acfd-3e8783f23326","status":"initializing","task_id":"b9792a06-0411-4838-96de-c720f34206a2"}"#
        );

        let timestamp = request.headers.get(TIMESTAMP_HEADER).unwrap().to_str().unwrap();
        let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert_eq!(signature, sign_message(timestamp, body, b"s3cr3t").unwrap());
        assert_eq!(request.headers.get("content-type").unwrap(), "application/json");
    }

    #[test_log::test(tokio::test)]
    async fn test_failing_endpoint_gets_exactly_max_attempts() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(5)
            .mount(&mock_server)
            .await;

        let h = harness(test_webhook_config());
        let endpoint = h.registry.insert_active(Uuid::new_v4(), &mock_server.uri(), "s3cr3t");
        let delivery_id = Uuid::new_v4();

        let outcome = h.dispatcher.deliver(delivery_id, endpoint.account_id, endpoint.id, event()).await;
        assert_eq!(outcome, DeliveryOutcome::Exhausted { attempts: 5 });

        let record = h.log.get(delivery_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Exhausted);
        assert_eq!(record.attempts.len(), 5);
        let numbers: Vec<u32> = record.attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert!(record.attempts[..4].iter().all(|a| a.outcome == AttemptOutcome::TransientFailure));
        assert_eq!(record.attempts[4].outcome, AttemptOutcome::PermanentFailure);
        assert!(record.attempts.iter().all(|a| a.status_code == Some(500)));
        assert_eq!(record.last_error.as_deref(), Some("HTTP 500"));

        assert_eq!(h.registry.get(endpoint.id).unwrap().consecutive_failures, 1);

        // No sixth attempt shows up later
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 5);
    }

    #[test_log::test(tokio::test)]
    async fn test_succeeds_after_transient_failures() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let h = harness(test_webhook_config());
        let endpoint = h.registry.insert_active(Uuid::new_v4(), &mock_server.uri(), "s3cr3t");
        h.registry.record_failure(endpoint.id);
        let delivery_id = Uuid::new_v4();

        let outcome = h.dispatcher.deliver(delivery_id, endpoint.account_id, endpoint.id, event()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });

        let record = h.log.get(delivery_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts[2].status_code, Some(200));
        // Success resets the endpoint's failure counter
        assert_eq!(h.registry.get(endpoint.id).unwrap().consecutive_failures, 0);

        // Every attempt is signed afresh, but the body never changes
        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.body == requests[0].body));
    }

    #[test_log::test(tokio::test)]
    async fn test_disable_abandons_pending_retries() {
        let mock_server = server_responding(500).await;
        let mut config = test_webhook_config();
        config.backoff.initial_delay = Duration::from_millis(300);
        config.backoff.max_delay = Duration::from_secs(1);
        let h = harness(config);
        let endpoint = h.registry.insert_active(Uuid::new_v4(), &mock_server.uri(), "s3cr3t");

        let delivery_id = h.dispatcher.dispatch(endpoint.account_id, endpoint.id, event());
        wait_for_requests(&mock_server, 1).await;
        h.registry.disable(endpoint.id).unwrap();
        h.dispatcher.drain().await;

        assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
        let record = h.log.get(delivery_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Abandoned);
        assert_eq!(record.attempts.len(), 1);
        // Abandonment is not an endpoint failure
        assert_eq!(h.registry.get(endpoint.id).unwrap().consecutive_failures, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_failing_endpoint_does_not_delay_others() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(200)))
            .mount(&failing)
            .await;
        let healthy = server_responding(200).await;

        let mut config = test_webhook_config();
        config.backoff.initial_delay = Duration::from_millis(200);
        let h = harness(config);
        let account = Uuid::new_v4();
        let bad = h.registry.insert_active(account, &failing.uri(), "one");
        let good = h.registry.insert_active(account, &healthy.uri(), "two");

        let started = Instant::now();
        let slow = h.dispatcher.dispatch(account, bad.id, event());
        let fast = h.dispatcher.dispatch(account, good.id, event());

        wait_for_requests(&healthy, 1).await;
        assert!(started.elapsed() < Duration::from_millis(500));

        h.dispatcher.drain().await;
        assert_eq!(h.log.get(fast).await.unwrap().status, DeliveryStatus::Delivered);
        assert_eq!(h.log.get(slow).await.unwrap().status, DeliveryStatus::Exhausted);
        assert_eq!(healthy.received_requests().await.unwrap().len(), 1);
        assert_eq!(failing.received_requests().await.unwrap().len(), 5);
    }

    #[test_log::test(tokio::test)]
    async fn test_exhausted_deliveries_trip_failure_threshold() {
        let mock_server = server_responding(500).await;
        let mut config = test_webhook_config();
        config.max_attempts = 2;
        config.failure_threshold = Some(2);
        let h = harness(config);
        let endpoint = h.registry.insert_active(Uuid::new_v4(), &mock_server.uri(), "s3cr3t");

        for _ in 0..2 {
            h.dispatcher
                .deliver(Uuid::new_v4(), endpoint.account_id, endpoint.id, event())
                .await;
        }
        assert!(!h.registry.is_active(endpoint.id));

        // Nothing is sent to a disabled endpoint
        let outcome = h
            .dispatcher
            .deliver(Uuid::new_v4(), endpoint.account_id, endpoint.id, event())
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Abandoned { attempts: 0, .. }));
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_sends_are_bounded() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(150)))
            .mount(&mock_server)
            .await;

        let mut config = test_webhook_config();
        config.max_concurrent_sends = 1;
        let h = harness(config);
        let endpoint = h.registry.insert_active(Uuid::new_v4(), &mock_server.uri(), "s3cr3t");

        let started = Instant::now();
        for _ in 0..3 {
            h.dispatcher.dispatch(endpoint.account_id, endpoint.id, event());
        }
        h.dispatcher.drain().await;

        // One send at a time: three 150ms responses cannot overlap
        assert!(started.elapsed() >= Duration::from_millis(450));
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_abandons_backoff() {
        let mock_server = server_responding(500).await;
        let mut config = test_webhook_config();
        config.backoff.initial_delay = Duration::from_secs(30);
        config.backoff.max_delay = Duration::from_secs(60);
        let h = harness(config);
        let endpoint = h.registry.insert_active(Uuid::new_v4(), &mock_server.uri(), "s3cr3t");

        let delivery_id = h.dispatcher.dispatch(endpoint.account_id, endpoint.id, event());
        wait_for_requests(&mock_server, 1).await;

        tokio::time::timeout(Duration::from_secs(2), h.dispatcher.shutdown())
            .await
            .expect("shutdown should not wait for backoff");

        assert_eq!(h.dispatcher.in_flight(), 0);
        let record = h.log.get(delivery_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Abandoned);
        assert_eq!(record.last_error.as_deref(), Some("shutting down"));
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_during_drain_stays_closed() {
        let mock_server = server_responding(500).await;
        let mut config = test_webhook_config();
        config.backoff.initial_delay = Duration::from_secs(30);
        config.backoff.max_delay = Duration::from_secs(60);
        let h = harness(config);
        let endpoint = h.registry.insert_active(Uuid::new_v4(), &mock_server.uri(), "s3cr3t");

        h.dispatcher.dispatch(endpoint.account_id, endpoint.id, event());
        wait_for_requests(&mock_server, 1).await;

        // The drain is stuck behind a 30s backoff when shutdown starts
        let dispatcher = h.dispatcher.clone();
        let drain = tokio::spawn(async move { dispatcher.drain().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), h.dispatcher.shutdown())
            .await
            .expect("shutdown should complete while a drain is running");
        tokio::time::timeout(Duration::from_secs(2), drain)
            .await
            .expect("drain should finish once backoffs are abandoned")
            .unwrap();

        assert!(h.dispatcher.tracker.is_closed());
        assert_eq!(h.dispatcher.in_flight(), 0);
    }
}
