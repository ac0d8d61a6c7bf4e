//! Wiring of the webhook components.
//!
//! Created once at startup. The registry, dispatcher and delivery log are shared between the
//! HTTP handlers and the emitter.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::WebhookConfig;
use crate::webhooks::deliveries::DeliveryLog;
use crate::webhooks::dispatcher::DeliveryDispatcher;
use crate::webhooks::emitter::EventEmitter;
use crate::webhooks::registry::EndpointRegistry;
use crate::webhooks::transport::WebhookSender;

#[derive(Clone)]
pub struct WebhookService {
    pub registry: Arc<EndpointRegistry>,
    pub dispatcher: Arc<DeliveryDispatcher>,
    pub emitter: Arc<EventEmitter>,
    pub deliveries: DeliveryLog,
}

impl WebhookService {
    pub fn new(config: &WebhookConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let sender = WebhookSender::new(config.request_timeout)?;
        let registry = Arc::new(EndpointRegistry::new(config, sender.clone()));
        let deliveries = DeliveryLog::new(config.delivery_log_capacity, config.delivery_retention);
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            config,
            registry.clone(),
            sender,
            deliveries.clone(),
            shutdown,
        ));
        let emitter = Arc::new(EventEmitter::new(registry.clone(), dispatcher.clone()));

        Ok(Self {
            registry,
            dispatcher,
            emitter,
            deliveries,
        })
    }

    /// Stop scheduling retries and wait for in-flight sends.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}
