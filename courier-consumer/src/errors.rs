use std::path::PathBuf;

use courier_broker::{BrokerError, ChannelFault, DeliveryTag};
use thiserror::Error;

/// Downstream processing could not begin for a delivery.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The message was left unacknowledged and will be redelivered.
    #[error("{context}: dispatch of delivery {delivery_tag} failed: {source}")]
    Dispatch {
        context: String,
        delivery_tag: DeliveryTag,
        #[source]
        source: DispatchError,
    },

    #[error("broker operation '{operation}' failed: {source}")]
    Broker {
        operation: &'static str,
        #[source]
        source: BrokerError,
    },

    #[error("{0}")]
    ChannelFault(ChannelFault),

    #[error("consumer already started with tag {0}")]
    AlreadyStarted(String),

    #[error("unknown consumer tag {0}")]
    UnknownConsumer(String),

    #[error("consumer is shutting down")]
    ShuttingDown,

    #[error("invalid consumer settings: {0}")]
    InvalidSettings(String),

    #[error("unable to read settings from {path}: {source}")]
    SettingsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings JSON in {path}: {source}")]
    SettingsParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConsumerError {
    pub(crate) fn broker(operation: &'static str, source: BrokerError) -> Self {
        ConsumerError::Broker { operation, source }
    }
}
