use thiserror::Error;

use crate::DeliveryTag;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("delivery not found: {0}")]
    UnknownDelivery(DeliveryTag),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),
    #[error("channel is closed")]
    ChannelClosed,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("internal broker error: {0}")]
    Internal(String),
}
