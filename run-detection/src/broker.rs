//! The ingress and egress channels, seen from the orchestrator.
use async_trait::async_trait;

use crate::error::BrokerError;
use crate::job_request::JobRequest;

/// A received message that has to be settled exactly once.
///
/// Settling may fail and be tried again. Once one settle call succeeded, further
/// calls do nothing.
#[async_trait]
pub trait IngressMessage: Send + Sync + 'static {
    fn payload(&self) -> Option<&[u8]>;

    /// How many times this message has been delivered, starting at 1.
    fn delivery_count(&self) -> u32;

    /// The message is done with and must not be delivered again.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Deliver the message again, with its delivery count incremented. Any backoff
    /// happens before this is called.
    async fn requeue(&self) -> Result<(), BrokerError>;

    /// Remove the message, dead-lettering it where the broker supports that.
    async fn reject(&self, reason: &str) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Ingress: Send + Sync + 'static {
    type Message: IngressMessage;

    /// Wait for the next message. [`BrokerError::Closed`] means there will be no more.
    async fn recv(&self) -> Result<Self::Message, BrokerError>;
}

#[async_trait]
pub trait Egress: Send + Sync + 'static {
    /// Publish `job_request`, returning once the broker has accepted it.
    async fn publish(&self, job_request: &JobRequest) -> Result<(), BrokerError>;
}
