//! Webhook notification system for task status events.
//!
//! - [`signing`]: canonical JSON and HMAC-SHA256 signatures
//! - [`verify`]: recipient-side signature and timestamp checks
//! - [`events`]: task status events and payload builders
//! - [`registry`]: endpoint registration, probing and lifecycle
//! - [`emitter`]: fan-out of events to active endpoints
//! - [`dispatcher`]: sign/send/retry loop per delivery
//! - [`retry`]: backoff policy and delivery state machine
//! - [`deliveries`]: delivery records kept for inspection
//! - [`transport`]: outbound HTTP

pub mod deliveries;
pub mod dispatcher;
pub mod emitter;
pub mod events;
pub mod registry;
pub mod retry;
pub mod service;
pub mod signing;
pub mod transport;
pub mod verify;

pub use dispatcher::{DeliveryDispatcher, DeliveryOutcome};
pub use emitter::{EmitReceipt, EventEmitter};
pub use events::{TaskEvent, TaskStatus};
pub use registry::{Endpoint, EndpointRegistry, EndpointStatus, RegisteredEndpoint};
pub use service::WebhookService;
pub use signing::{generate_secret, sign, sign_at};
pub use verify::{DEFAULT_TOLERANCE, VerifyError, verify, verify_request};
