//! Endpoint registry: webhook destinations per account.
//!
//! An endpoint is created `pending`, receives a signed `{"test":"ok"}` probe and only becomes
//! `active` once the probe is acknowledged with a 2xx. A failed probe removes the endpoint again,
//! so nothing half-registered is ever visible to the emitter.
//!
//! The per-endpoint consecutive failure counter lives here; it is updated under the map's shard
//! lock so concurrent deliveries to the same endpoint cannot lose increments.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{DuplicateUrlPolicy, WebhookConfig};
use crate::errors::{Error, Result};
use crate::types::{AccountId, EndpointId, abbrev_uuid};
use crate::webhooks::events::probe_payload;
use crate::webhooks::signing::{self, generate_secret};
use crate::webhooks::transport::{SendOutcome, WebhookSender};

/// Lifecycle status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Registered, waiting for the probe to be acknowledged
    Pending,
    /// Receives events
    Active,
    /// Skipped by the emitter; queued retries are abandoned
    Disabled,
}

/// A registered webhook destination.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: EndpointId,
    pub account_id: AccountId,
    pub url: String,
    secret: Arc<SecretString>,
    pub status: EndpointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub disabled_at: Option<DateTime<Utc>>,
}

impl Endpoint {
    pub fn is_active(&self) -> bool {
        self.status == EndpointStatus::Active
    }

    /// Key material used for signing deliveries to this endpoint.
    pub(crate) fn secret(&self) -> &SecretString {
        &self.secret
    }
}

/// An endpoint together with its secret, returned only on registration and rotation.
#[derive(Debug, Clone)]
pub struct RegisteredEndpoint {
    pub endpoint: Endpoint,
}

impl RegisteredEndpoint {
    pub fn secret(&self) -> &str {
        self.endpoint.secret.expose_secret()
    }
}

pub struct EndpointRegistry {
    endpoints: DashMap<EndpointId, Endpoint>,
    /// (account, normalized URL) -> endpoint; only maintained when duplicates are rejected
    urls: DashMap<(AccountId, String), EndpointId>,
    sender: WebhookSender,
    probe_timeout: Duration,
    duplicate_urls: DuplicateUrlPolicy,
    allow_insecure_urls: bool,
    failure_threshold: Option<u32>,
}

impl EndpointRegistry {
    pub fn new(config: &WebhookConfig, sender: WebhookSender) -> Self {
        Self {
            endpoints: DashMap::new(),
            urls: DashMap::new(),
            sender,
            probe_timeout: config.probe_timeout,
            duplicate_urls: config.duplicate_urls,
            allow_insecure_urls: config.allow_insecure_urls,
            failure_threshold: config.failure_threshold,
        }
    }

    /// Register a new endpoint and activate it once the probe succeeds.
    #[instrument(skip(self), fields(account_id = %abbrev_uuid(&account_id)), err)]
    pub async fn register(&self, account_id: AccountId, url: &str) -> Result<RegisteredEndpoint> {
        let url = self.validate_url(url)?;
        let now = Utc::now();

        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            account_id,
            url: url.to_string(),
            secret: Arc::new(generate_secret()),
            status: EndpointStatus::Pending,
            created_at: now,
            updated_at: now,
            consecutive_failures: 0,
            disabled_at: None,
        };

        if self.duplicate_urls == DuplicateUrlPolicy::Reject {
            match self.urls.entry((account_id, endpoint.url.clone())) {
                Entry::Occupied(_) => {
                    return Err(Error::Conflict {
                        message: format!("A webhook for {} is already registered on this account", endpoint.url),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(endpoint.id);
                }
            }
        }
        self.endpoints.insert(endpoint.id, endpoint.clone());
        // Removes the pending endpoint on a failed probe or if this future is dropped mid-probe
        let pending = PendingRegistration {
            registry: self,
            id: endpoint.id,
        };

        self.probe(&endpoint).await?;
        pending.keep();

        // Only promote if nothing (e.g. an admin disable) changed the endpoint meanwhile
        let activated = match self.endpoints.get_mut(&endpoint.id) {
            Some(mut stored) if stored.status == EndpointStatus::Pending => {
                stored.status = EndpointStatus::Active;
                stored.updated_at = Utc::now();
                stored.clone()
            }
            Some(stored) => stored.clone(),
            None => {
                return Err(Error::NotFound {
                    resource: "Webhook".to_string(),
                    id: endpoint.id.to_string(),
                });
            }
        };

        info!(endpoint_id = %activated.id, url = %activated.url, "Webhook endpoint registered");
        Ok(RegisteredEndpoint { endpoint: activated })
    }

    /// Disable an endpoint. Disabling twice is a no-op.
    #[instrument(skip(self), fields(endpoint_id = %abbrev_uuid(&id)), err)]
    pub fn disable(&self, id: EndpointId) -> Result<Endpoint> {
        let mut endpoint = self.endpoints.get_mut(&id).ok_or_else(|| not_found(id))?;
        if endpoint.status != EndpointStatus::Disabled {
            let now = Utc::now();
            endpoint.status = EndpointStatus::Disabled;
            endpoint.disabled_at = Some(now);
            endpoint.updated_at = now;
            info!(endpoint_id = %id, "Webhook endpoint disabled");
        }
        Ok(endpoint.clone())
    }

    /// Re-activate a disabled endpoint. The endpoint is probed again first.
    #[instrument(skip(self), fields(endpoint_id = %abbrev_uuid(&id)), err)]
    pub async fn enable(&self, id: EndpointId) -> Result<Endpoint> {
        let endpoint = self.get(id)?;
        if endpoint.is_active() {
            return Ok(endpoint);
        }

        self.probe(&endpoint).await?;

        let mut stored = self.endpoints.get_mut(&id).ok_or_else(|| not_found(id))?;
        stored.status = EndpointStatus::Active;
        stored.consecutive_failures = 0;
        stored.disabled_at = None;
        stored.updated_at = Utc::now();
        info!(endpoint_id = %id, "Webhook endpoint re-enabled");
        Ok(stored.clone())
    }

    /// Replace an endpoint's secret. The new secret is returned once.
    #[instrument(skip(self), fields(endpoint_id = %abbrev_uuid(&id)), err)]
    pub fn rotate_secret(&self, id: EndpointId) -> Result<RegisteredEndpoint> {
        let mut endpoint = self.endpoints.get_mut(&id).ok_or_else(|| not_found(id))?;
        endpoint.secret = Arc::new(generate_secret());
        endpoint.updated_at = Utc::now();
        Ok(RegisteredEndpoint {
            endpoint: endpoint.clone(),
        })
    }

    /// Remove an endpoint permanently.
    #[instrument(skip(self), fields(endpoint_id = %abbrev_uuid(&id)), err)]
    pub fn delete(&self, id: EndpointId) -> Result<()> {
        if self.forget(id) { Ok(()) } else { Err(not_found(id)) }
    }

    pub fn get(&self, id: EndpointId) -> Result<Endpoint> {
        self.endpoints.get(&id).map(|e| e.clone()).ok_or_else(|| not_found(id))
    }

    /// All endpoints of an account, newest first.
    pub fn list(&self, account_id: AccountId) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.account_id == account_id)
            .map(|e| e.clone())
            .collect();
        endpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        endpoints
    }

    /// Endpoints of an account that should receive events.
    pub fn active_for_account(&self, account_id: AccountId) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.account_id == account_id && e.is_active())
            .map(|e| e.clone())
            .collect()
    }

    pub fn is_active(&self, id: EndpointId) -> bool {
        self.endpoints.get(&id).is_some_and(|e| e.is_active())
    }

    /// Reset the failure counter after a successful delivery.
    pub fn record_success(&self, id: EndpointId) {
        if let Some(mut endpoint) = self.endpoints.get_mut(&id) {
            endpoint.consecutive_failures = 0;
        }
    }

    /// Count an exhausted delivery. Returns `true` if this disabled the endpoint.
    pub fn record_failure(&self, id: EndpointId) -> bool {
        let Some(mut endpoint) = self.endpoints.get_mut(&id) else {
            return false;
        };
        endpoint.consecutive_failures += 1;

        let tripped = endpoint.is_active() && self.failure_threshold.is_some_and(|t| endpoint.consecutive_failures >= t);
        if tripped {
            let now = Utc::now();
            endpoint.status = EndpointStatus::Disabled;
            endpoint.disabled_at = Some(now);
            endpoint.updated_at = now;
            counter!("taskhooks_webhook_endpoints_disabled_total").increment(1);
            warn!(
                endpoint_id = %id,
                consecutive_failures = endpoint.consecutive_failures,
                "Webhook endpoint disabled after repeated delivery failures"
            );
        }
        tripped
    }

    /// Insert an already active endpoint with a known secret, skipping the probe.
    #[cfg(test)]
    pub(crate) fn insert_active(&self, account_id: AccountId, url: &str, secret: &str) -> Endpoint {
        let now = Utc::now();
        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            account_id,
            url: url.to_string(),
            secret: Arc::new(SecretString::from(secret.to_string())),
            status: EndpointStatus::Active,
            created_at: now,
            updated_at: now,
            consecutive_failures: 0,
            disabled_at: None,
        };
        self.endpoints.insert(endpoint.id, endpoint.clone());
        endpoint
    }

    fn validate_url(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw.trim()).map_err(|e| Error::Validation {
            message: format!("Invalid webhook URL: {}", e),
        })?;

        let scheme_ok = match url.scheme() {
            "https" => true,
            "http" => self.allow_insecure_urls,
            _ => false,
        };
        if !scheme_ok {
            return Err(Error::Validation {
                message: "Webhook URL must use HTTPS".to_string(),
            });
        }

        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::Validation {
                message: "Webhook URL must include a host".to_string(),
            });
        }

        Ok(url)
    }

    async fn probe(&self, endpoint: &Endpoint) -> Result<()> {
        let signed = signing::sign(&probe_payload(), endpoint.secret().expose_secret().as_bytes())
            .map_err(|e| Error::Internal {
                operation: format!("sign probe payload: {}", e),
            })?;

        let report = self.sender.send(&endpoint.url, &signed, Some(self.probe_timeout)).await;
        match report.outcome {
            SendOutcome::Success { status_code } => {
                info!(endpoint_id = %endpoint.id, status = status_code, "Webhook probe acknowledged");
                Ok(())
            }
            SendOutcome::Failure { status_code, error } => {
                warn!(endpoint_id = %endpoint.id, status_code = ?status_code, error = %error, "Webhook probe failed");
                Err(Error::EndpointUnreachable {
                    url: endpoint.url.clone(),
                    reason: error,
                })
            }
        }
    }

    /// Drop an endpoint and its URL index entry. Returns whether it existed.
    fn forget(&self, id: EndpointId) -> bool {
        match self.endpoints.remove(&id) {
            Some((_, endpoint)) => {
                self.urls.remove_if(&(endpoint.account_id, endpoint.url), |_, owner| *owner == id);
                true
            }
            None => false,
        }
    }
}

/// Owns a freshly inserted `pending` endpoint until its probe is acknowledged.
struct PendingRegistration<'a> {
    registry: &'a EndpointRegistry,
    id: EndpointId,
}

impl PendingRegistration<'_> {
    fn keep(self) {
        std::mem::forget(self);
    }
}

impl Drop for PendingRegistration<'_> {
    fn drop(&mut self) {
        if self.registry.forget(self.id) {
            info!(endpoint_id = %self.id, "Pending webhook registration discarded");
        }
    }
}

fn not_found(id: EndpointId) -> Error {
    Error::NotFound {
        resource: "Webhook".to_string(),
        id: id.to_string(),
    }
}
