//! HTTP handler for task events submitted by the task engine.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use tracing::instrument;

use crate::{
    AppState,
    api::models::{
        events::{EmitResponse, EventCreate},
        webhooks::AccountPathParams,
    },
    errors::Result,
    webhooks::TaskEvent,
};

/// Emit a task event to every active webhook of the account.
///
/// Answers as soon as deliveries are scheduled; delivery happens in the background.
#[instrument(skip_all)]
pub async fn emit_event(
    State(state): State<AppState>,
    Path(params): Path<AccountPathParams>,
    Json(request): Json<EventCreate>,
) -> Result<(StatusCode, Json<EmitResponse>)> {
    let event = TaskEvent::from(request);
    let receipt = state.webhooks.emitter.emit(params.account_id, &event);
    Ok((StatusCode::ACCEPTED, Json(receipt.into())))
}
