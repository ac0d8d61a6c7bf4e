//! HTTP handlers for webhook management endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use tracing::instrument;

use crate::{
    AppState,
    api::models::webhooks::{AccountPathParams, DeliveryResponse, WebhookCreate, WebhookPathParams, WebhookResponse, WebhookWithSecretResponse},
    errors::{Error, Result},
    webhooks::registry::Endpoint,
};

/// Look up a webhook, treating one owned by another account as missing.
fn owned_webhook(state: &AppState, params: WebhookPathParams) -> Result<Endpoint> {
    let endpoint = state.webhooks.registry.get(params.webhook_id)?;
    if endpoint.account_id != params.account_id {
        return Err(Error::NotFound {
            resource: "Webhook".to_string(),
            id: params.webhook_id.to_string(),
        });
    }
    Ok(endpoint)
}

/// List all webhooks for an account.
#[instrument(skip_all)]
pub async fn list_webhooks(State(state): State<AppState>, Path(params): Path<AccountPathParams>) -> Result<Json<Vec<WebhookResponse>>> {
    let webhooks = state.webhooks.registry.list(params.account_id);
    Ok(Json(webhooks.into_iter().map(Into::into).collect()))
}

/// Register a webhook. The endpoint must acknowledge a signed test event before it is created.
/// Returns the secret, which is only shown once.
#[instrument(skip_all)]
pub async fn create_webhook(
    State(state): State<AppState>,
    Path(params): Path<AccountPathParams>,
    Json(request): Json<WebhookCreate>,
) -> Result<(StatusCode, Json<WebhookWithSecretResponse>)> {
    let registered = state.webhooks.registry.register(params.account_id, &request.url).await?;
    Ok((StatusCode::CREATED, Json(registered.into())))
}

#[instrument(skip_all)]
pub async fn get_webhook(State(state): State<AppState>, Path(params): Path<WebhookPathParams>) -> Result<Json<WebhookResponse>> {
    Ok(Json(owned_webhook(&state, params)?.into()))
}

/// Disable a webhook. Pending retries to it are abandoned.
#[instrument(skip_all)]
pub async fn disable_webhook(State(state): State<AppState>, Path(params): Path<WebhookPathParams>) -> Result<Json<WebhookResponse>> {
    owned_webhook(&state, params)?;
    let endpoint = state.webhooks.registry.disable(params.webhook_id)?;
    Ok(Json(endpoint.into()))
}

/// Re-enable a webhook after a fresh test event succeeds.
#[instrument(skip_all)]
pub async fn enable_webhook(State(state): State<AppState>, Path(params): Path<WebhookPathParams>) -> Result<Json<WebhookResponse>> {
    owned_webhook(&state, params)?;
    let endpoint = state.webhooks.registry.enable(params.webhook_id).await?;
    Ok(Json(endpoint.into()))
}

/// Replace a webhook's signing secret. Returns the new secret once.
#[instrument(skip_all)]
pub async fn rotate_secret(
    State(state): State<AppState>,
    Path(params): Path<WebhookPathParams>,
) -> Result<Json<WebhookWithSecretResponse>> {
    owned_webhook(&state, params)?;
    let rotated = state.webhooks.registry.rotate_secret(params.webhook_id)?;
    Ok(Json(rotated.into()))
}

#[instrument(skip_all)]
pub async fn delete_webhook(State(state): State<AppState>, Path(params): Path<WebhookPathParams>) -> Result<StatusCode> {
    owned_webhook(&state, params)?;
    state.webhooks.registry.delete(params.webhook_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Recent deliveries to a webhook, newest first.
#[instrument(skip_all)]
pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(params): Path<WebhookPathParams>,
) -> Result<Json<Vec<DeliveryResponse>>> {
    owned_webhook(&state, params)?;
    let deliveries = state.webhooks.deliveries.for_endpoint(params.webhook_id);
    Ok(Json(deliveries.into_iter().map(Into::into).collect()))
}
