//! Signed, at-least-once webhook delivery.

pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod history;
pub mod mock;
pub mod receiver;
pub mod signing;
pub mod transport;

pub use dispatcher::{DeliveryOutcome, DeliveryReport, PendingDelivery, RetryPolicy, WebhookDispatcher};
pub use endpoint::{EndpointRegistry, EndpointSummary, RegisteredEndpoint, WebhookEndpoint};
pub use error::DeliveryError;
pub use history::{AttemptStatus, DeliveryAttempt, DeliveryLog};
pub use receiver::{ReceivedWebhook, SignedHeaders, WebhookReceiver};
pub use signing::VerificationError;
pub use transport::{HttpTransport, OutboundRequest, WebhookTransport};
