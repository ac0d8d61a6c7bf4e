//! Shared constructors for tests.

use std::time::Duration;

use axum_test::TestServer;
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

use crate::config::{BackoffConfig, Config, WebhookConfig};
use crate::webhooks::WebhookService;
use crate::webhooks::registry::EndpointRegistry;
use crate::webhooks::transport::WebhookSender;
use crate::{AppState, build_router};

/// Webhook config for tests: plain HTTP allowed, millisecond backoff without jitter.
pub fn test_webhook_config() -> WebhookConfig {
    WebhookConfig {
        request_timeout: Duration::from_secs(2),
        probe_timeout: Duration::from_secs(2),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
        },
        allow_insecure_urls: true,
        delivery_log_capacity: 1_000,
        delivery_retention: Duration::from_secs(60 * 60),
        ..WebhookConfig::default()
    }
}

pub fn registry_with(config: WebhookConfig) -> EndpointRegistry {
    let sender = WebhookSender::new(config.request_timeout).unwrap();
    EndpointRegistry::new(&config, sender)
}

pub fn test_service(config: WebhookConfig) -> WebhookService {
    WebhookService::new(&config, CancellationToken::new()).unwrap()
}

/// Router-backed test server plus the state behind it.
pub fn create_test_app(webhooks: WebhookConfig) -> (TestServer, AppState) {
    let config = Config {
        enable_metrics: false,
        webhooks,
        ..Config::default()
    };
    let state = AppState {
        webhooks: test_service(config.webhooks.clone()),
        config,
    };
    let server = TestServer::new(build_router(state.clone(), None)).unwrap();
    (server, state)
}

/// Poll until the mock server has seen at least `count` requests.
pub async fn wait_for_requests(server: &MockServer, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if server.received_requests().await.is_some_and(|r| r.len() >= count) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for webhook requests");
}
