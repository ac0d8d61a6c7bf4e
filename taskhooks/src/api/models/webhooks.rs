//! API request and response models for webhook endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AccountId, DeliveryId, EndpointId};
use crate::webhooks::deliveries::{DeliveryAttempt, DeliveryRecord, DeliveryStatus};
use crate::webhooks::registry::{Endpoint, EndpointStatus, RegisteredEndpoint};

/// Request to register a new webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookCreate {
    /// HTTPS URL to receive task events
    pub url: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AccountPathParams {
    pub account_id: AccountId,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WebhookPathParams {
    pub account_id: AccountId,
    pub webhook_id: EndpointId,
}

/// Response for a webhook. The secret is never included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub id: EndpointId,
    pub account_id: AccountId,
    pub url: String,
    pub status: EndpointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
}

impl From<Endpoint> for WebhookResponse {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            id: endpoint.id,
            account_id: endpoint.account_id,
            url: endpoint.url,
            status: endpoint.status,
            created_at: endpoint.created_at,
            updated_at: endpoint.updated_at,
            consecutive_failures: endpoint.consecutive_failures,
            disabled_at: endpoint.disabled_at,
        }
    }
}

/// Response for webhook create/rotate that includes the secret (shown only once).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookWithSecretResponse {
    #[serde(flatten)]
    pub webhook: WebhookResponse,
    /// Signing secret, the whole string is the HMAC key
    pub secret: String,
}

impl From<RegisteredEndpoint> for WebhookWithSecretResponse {
    fn from(registered: RegisteredEndpoint) -> Self {
        let secret = registered.secret().to_string();
        Self {
            webhook: registered.endpoint.into(),
            secret,
        }
    }
}

/// A delivery of one event to one webhook, with its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub id: DeliveryId,
    pub webhook_id: EndpointId,
    pub status: DeliveryStatus,
    pub payload: serde_json::Value,
    pub attempts: Vec<DeliveryAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DeliveryRecord> for DeliveryResponse {
    fn from(record: DeliveryRecord) -> Self {
        Self {
            id: record.id,
            webhook_id: record.endpoint_id,
            status: record.status,
            payload: record.payload,
            attempts: record.attempts,
            last_error: record.last_error,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}
