//! Fan-out of task events to an account's active endpoints.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::types::{AccountId, DeliveryId, EndpointId, abbrev_uuid};
use crate::webhooks::dispatcher::DeliveryDispatcher;
use crate::webhooks::events::TaskEvent;
use crate::webhooks::registry::EndpointRegistry;

/// A delivery started by [`EventEmitter::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchedDelivery {
    pub delivery_id: DeliveryId,
    pub endpoint_id: EndpointId,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmitReceipt {
    pub deliveries: Vec<DispatchedDelivery>,
}

pub struct EventEmitter {
    registry: Arc<EndpointRegistry>,
    dispatcher: Arc<DeliveryDispatcher>,
}

impl EventEmitter {
    pub fn new(registry: Arc<EndpointRegistry>, dispatcher: Arc<DeliveryDispatcher>) -> Self {
        Self { registry, dispatcher }
    }

    /// Hand the event to the dispatcher once per active endpoint of the account.
    ///
    /// Returns as soon as the deliveries are scheduled; the caller never waits on the network.
    /// An account without active endpoints is not an error.
    #[instrument(skip(self, event), fields(account_id = %abbrev_uuid(&account_id), status = %event.status))]
    pub fn emit(&self, account_id: AccountId, event: &TaskEvent) -> EmitReceipt {
        let endpoints = self.registry.active_for_account(account_id);
        if endpoints.is_empty() {
            debug!("No active webhooks for account, skipping");
            return EmitReceipt::default();
        }

        let payload = event.to_payload();
        let deliveries = endpoints
            .iter()
            .map(|endpoint| DispatchedDelivery {
                delivery_id: self.dispatcher.dispatch(account_id, endpoint.id, payload.clone()),
                endpoint_id: endpoint.id,
            })
            .collect::<Vec<_>>();

        debug!(count = deliveries.len(), "Dispatched task event");
        EmitReceipt { deliveries }
    }
}
