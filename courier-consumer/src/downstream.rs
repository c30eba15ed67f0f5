use std::future::Future;

use async_trait::async_trait;
use courier_broker::{Delivery, DeliveryTag};

use crate::{
    completion::{Acknowledger, Completer},
    errors::DispatchError,
};

/// Work handed to downstream processing for one delivery.
#[derive(Debug)]
pub struct Job {
    pub delivery: Delivery,
    /// Settle when processing finishes.
    pub completion: Completer,
    /// Present only in `explicit-signal` mode; decides ack or nack on its own.
    pub acknowledger: Option<Acknowledger>,
}

impl Job {
    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery.delivery_tag
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.payload.body
    }
}

/// Downstream processing for deliveries.
///
/// `dispatch` returns once processing has begun. An error means it could not
/// begin at all; the pipeline then leaves the message unacknowledged.
#[async_trait]
pub trait Downstream: Send + Sync + 'static {
    async fn dispatch(&self, job: Job) -> Result<(), DispatchError>;
}

#[async_trait]
impl<F, Fut> Downstream for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    async fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        (self)(job).await
    }
}
