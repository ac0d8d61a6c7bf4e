//! # taskhooks: signed webhook delivery for task status events
//!
//! `taskhooks` notifies customer-registered HTTPS endpoints whenever a task changes status.
//! Every delivery is signed with a per-endpoint secret so recipients can check that it came
//! from us and was not altered in transit.
//!
//! ## Overview
//!
//! An account registers a URL. Before the endpoint is stored as active it must acknowledge a
//! signed `{"test":"ok"}` probe with a 2xx. From then on, every task status transition reported
//! for the account is fanned out to its active endpoints:
//!
//! ```text
//! POST /api/v1/accounts/{id}/events
//!   └─ EventEmitter::emit()                       // returns immediately
//!        └─ for each active endpoint:
//!             DeliveryDispatcher::dispatch()      // one task per (event, endpoint)
//!               └─ sign → POST → retry with backoff → record
//! ```
//!
//! Deliveries are at-least-once: a recipient may see the same event more than once and should
//! deduplicate on `(task_id, status)`. There is no ordering guarantee between deliveries.
//!
//! ### Core Components
//!
//! The **webhook layer** ([`webhooks`]) holds the signing scheme, the recipient-side verifier,
//! the endpoint registry, the emitter and the dispatcher. Everything is kept in memory.
//!
//! The **API layer** ([`api`]) exposes webhook management and event submission over HTTP.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use taskhooks::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = taskhooks::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     taskhooks::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config)?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.ok();
//!     })
//!     .await
//! }
//! ```
//!
//! ## Verifying deliveries
//!
//! Recipients written in Rust can use [`webhooks::verify_request`] directly:
//!
//! ```
//! use taskhooks::webhooks::{DEFAULT_TOLERANCE, sign_at, verify_request};
//!
//! let payload = serde_json::json!({"status": "started"});
//! let signed = sign_at(&payload, 1_700_000_000, b"whsec_example").unwrap();
//!
//! let now = chrono::DateTime::from_timestamp(1_700_000_030, 0).unwrap();
//! let verified = verify_request(
//!     signed.body.as_bytes(),
//!     Some(&signed.timestamp),
//!     Some(&signed.signature),
//!     b"whsec_example",
//!     DEFAULT_TOLERANCE,
//!     now,
//! );
//! assert_eq!(verified.unwrap(), payload);
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod config;
pub mod errors;
pub mod telemetry;
pub mod types;
pub mod webhooks;

#[cfg(test)]
pub mod test_utils;

use std::sync::OnceLock;

use axum::{
    Router,
    routing::{get, post},
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, warn};

pub use config::Config;
use webhooks::WebhookService;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub webhooks: WebhookService,
}

static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder on first use and return its handle.
///
/// Returns `None` if another recorder was installed first.
pub fn get_or_install_prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to install Prometheus recorder: {}", e);
                None
            }
        })
        .clone()
}

/// Build the HTTP router.
pub fn build_router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    use api::handlers::{events, webhooks};

    let api_routes = Router::new()
        .route(
            "/accounts/{account_id}/webhooks",
            get(webhooks::list_webhooks).post(webhooks::create_webhook),
        )
        .route(
            "/accounts/{account_id}/webhooks/{webhook_id}",
            get(webhooks::get_webhook).delete(webhooks::delete_webhook),
        )
        .route("/accounts/{account_id}/webhooks/{webhook_id}/disable", post(webhooks::disable_webhook))
        .route("/accounts/{account_id}/webhooks/{webhook_id}/enable", post(webhooks::enable_webhook))
        .route(
            "/accounts/{account_id}/webhooks/{webhook_id}/rotate-secret",
            post(webhooks::rotate_secret),
        )
        .route(
            "/accounts/{account_id}/webhooks/{webhook_id}/deliveries",
            get(webhooks::list_deliveries),
        )
        .route("/accounts/{account_id}/events", post(events::emit_event));

    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .nest("/api/v1", api_routes)
        .with_state(state);

    if let Some(handle) = metrics {
        router = router.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// The running service: HTTP API plus the background delivery machinery.
///
/// 1. **Create**: [`Application::new`] builds the webhook components and the router
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and handles requests
/// 3. **Shutdown**: once the shutdown future resolves, in-flight sends finish and pending
///    retries are abandoned
pub struct Application {
    router: Router,
    config: Config,
    webhooks: WebhookService,
}

impl Application {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting taskhooks with configuration: {:#?}", config);

        let webhooks = WebhookService::new(&config.webhooks, CancellationToken::new())?;

        let metrics = if config.enable_metrics {
            get_or_install_prometheus_handle()
        } else {
            None
        };

        let state = AppState {
            config: config.clone(),
            webhooks: webhooks.clone(),
        };
        let router = build_router(state, metrics);

        Ok(Self {
            router,
            config,
            webhooks,
        })
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("taskhooks listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!(in_flight = self.webhooks.dispatcher.in_flight(), "Stopping webhook deliveries...");
        self.webhooks.shutdown().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
