//! Delivery records: one per (event, endpoint) pair, with every attempt made for it.
//!
//! Records are kept in a bounded in-memory cache for inspection; old entries are evicted by
//! size and age. Losing a record never affects the delivery itself.

use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{AccountId, DeliveryId, EndpointId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// First attempt not made yet
    Pending,
    /// Acknowledged with a 2xx
    Delivered,
    /// Last attempt failed, another one is scheduled
    Failed,
    /// Every attempt failed
    Exhausted,
    /// Stopped early because the endpoint was disabled or deleted, or the service shut down
    Abandoned,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Exhausted | Self::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Failed, will be retried
    TransientFailure,
    /// Failed, and no attempts are left
    PermanentFailure,
}

/// A single HTTP attempt of a delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub attempt_number: u32,
    /// Unix-seconds timestamp that was signed for this attempt
    pub timestamp: String,
    pub signature: String,
    pub status_code: Option<u16>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    pub account_id: AccountId,
    pub endpoint_id: EndpointId,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempts: Vec<DeliveryAttempt>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(id: DeliveryId, account_id: AccountId, endpoint_id: EndpointId, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            account_id,
            endpoint_id,
            payload,
            status: DeliveryStatus::Pending,
            attempts: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_attempt(&mut self, attempt: DeliveryAttempt) {
        self.status = match attempt.outcome {
            AttemptOutcome::Success => DeliveryStatus::Delivered,
            AttemptOutcome::TransientFailure => DeliveryStatus::Failed,
            AttemptOutcome::PermanentFailure => DeliveryStatus::Exhausted,
        };
        if attempt.error.is_some() {
            self.last_error = attempt.error.clone();
        }
        self.updated_at = Utc::now();
        self.attempts.push(attempt);
    }

    /// Mark the delivery as stopped early. A finished delivery keeps its final status.
    pub fn abandon(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = DeliveryStatus::Abandoned;
        self.last_error = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

/// Bounded store of recent delivery records.
#[derive(Clone)]
pub struct DeliveryLog {
    records: Cache<DeliveryId, DeliveryRecord>,
}

impl DeliveryLog {
    pub fn new(capacity: u64, retention: Duration) -> Self {
        let records = Cache::builder().max_capacity(capacity).time_to_live(retention).build();
        Self { records }
    }

    pub async fn put(&self, record: &DeliveryRecord) {
        self.records.insert(record.id, record.clone()).await;
    }

    pub async fn get(&self, id: DeliveryId) -> Option<DeliveryRecord> {
        self.records.get(&id).await
    }

    /// Retained records for one endpoint, newest first.
    pub fn for_endpoint(&self, endpoint_id: EndpointId) -> Vec<DeliveryRecord> {
        let mut records: Vec<DeliveryRecord> = self
            .records
            .iter()
            .filter(|(_, record)| record.endpoint_id == endpoint_id)
            .map(|(_, record)| record)
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }
}
