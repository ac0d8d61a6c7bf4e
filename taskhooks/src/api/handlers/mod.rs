//! HTTP request handlers.
//!
//! - [`webhooks`]: webhook registration, lifecycle and delivery history
//! - [`events`]: task events handed to the emitter

pub mod events;
pub mod webhooks;
