//! API models for submitting task events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::webhooks::emitter::{DispatchedDelivery, EmitReceipt};
use crate::webhooks::events::{TaskEvent, TaskStatus};

/// A task status transition reported by the task engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EventCreate {
    pub session_id: Uuid,
    pub task_id: Uuid,
    pub status: TaskStatus,
}

impl From<EventCreate> for TaskEvent {
    fn from(event: EventCreate) -> Self {
        TaskEvent::new(event.session_id, event.task_id, event.status)
    }
}

/// Deliveries scheduled for an event. Delivery happens after the response is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitResponse {
    pub deliveries: Vec<ScheduledDelivery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledDelivery {
    pub delivery_id: Uuid,
    pub webhook_id: Uuid,
}

impl From<EmitReceipt> for EmitResponse {
    fn from(receipt: EmitReceipt) -> Self {
        Self {
            deliveries: receipt
                .deliveries
                .into_iter()
                .map(|DispatchedDelivery { delivery_id, endpoint_id }| ScheduledDelivery {
                    delivery_id,
                    webhook_id: endpoint_id,
                })
                .collect(),
        }
    }
}
