//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response data structures
//!
//! # API Structure
//!
//! All routes are scoped to an account under `/api/v1/accounts/{account_id}`:
//!
//! - **Webhooks** (`/webhooks/*`): registration, lifecycle, secret rotation, delivery history
//! - **Events** (`/events`): task status events handed to the emitter
//!
//! Authentication is expected to happen in front of this service.

pub mod handlers;
pub mod models;
