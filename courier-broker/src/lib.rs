mod errors;
pub mod in_memory;
mod types;

pub use errors::BrokerError;
pub use types::{
    ChannelFault, ConnectionConfig, Delivery, DeliveryTag, ExchangeKind, ExchangeSpec, Payload,
    QueueSpec, Subscription,
};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Entry point into a broker backend.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// An open connection to the broker.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Open a new channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Close the connection and every channel still open on it.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Channel-level operations used by consumers.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries on this channel. Zero means unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start a subscription on `queue`.
    async fn consume(&self, queue: &str) -> Result<Subscription, BrokerError>;

    /// Acknowledge successful processing of a delivery.
    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Reject a delivery, optionally returning it to its queue.
    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Stop the broker from delivering further messages to a subscription.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Close the channel. Unacknowledged deliveries are returned to their queues.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Asynchronous faults raised by the broker for this channel.
    fn faults(&self) -> broadcast::Receiver<ChannelFault>;
}
