use std::{fmt, sync::Arc};

use courier_broker::{Channel, Delivery, DeliveryTag};
use log::{debug, error, warn};

use crate::{
    completion::{Acknowledger, completion},
    downstream::{Downstream, Job},
    errors::ConsumerError,
    policy::{AcknowledgeMode, Decision, decide},
    tracker::DeliveryTracker,
};

/// Who is consuming, used to label log lines and errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerContext {
    pub consumer: String,
    pub workflow: Option<String>,
    pub queue: String,
}

impl fmt::Display for ConsumerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer '{}'", self.consumer)?;
        if let Some(workflow) = &self.workflow {
            write!(f, " (workflow '{workflow}')")?;
        }
        write!(f, " on queue '{}'", self.queue)
    }
}

/// How a delivery left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked,
    /// No terminal call was issued; the broker redelivers once the channel closes.
    LeftUnacked,
}

/// Per-delivery orchestration: track, dispatch, await completion, settle.
#[derive(Clone)]
pub struct DeliveryPipeline {
    channel: Arc<dyn Channel>,
    tracker: DeliveryTracker,
    downstream: Arc<dyn Downstream>,
    mode: AcknowledgeMode,
    context: Arc<ConsumerContext>,
    requeue_on_nack: bool,
}

impl DeliveryPipeline {
    pub fn new(
        channel: Arc<dyn Channel>,
        tracker: DeliveryTracker,
        downstream: Arc<dyn Downstream>,
        mode: AcknowledgeMode,
        context: ConsumerContext,
    ) -> Self {
        Self {
            channel,
            tracker,
            downstream,
            mode,
            context: Arc::new(context),
            requeue_on_nack: false,
        }
    }

    pub fn with_requeue_on_nack(mut self, requeue: bool) -> Self {
        self.requeue_on_nack = requeue;
        self
    }

    pub fn mode(&self) -> AcknowledgeMode {
        self.mode
    }

    pub fn context(&self) -> &ConsumerContext {
        &self.context
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub async fn on_delivery(&self, delivery: Delivery) -> Result<Settlement, ConsumerError> {
        if self.mode == AcknowledgeMode::Immediate {
            return self.ack_then_dispatch(delivery).await;
        }
        self.admit(&delivery);
        self.settle(delivery).await
    }

    /// Register a delivery as outstanding without dispatching it.
    ///
    /// Callers that hand [`DeliveryPipeline::settle`] to another task admit
    /// first, so a drain never sees the tracker idle while a received
    /// delivery is still on its way downstream.
    pub fn admit(&self, delivery: &Delivery) {
        let tag = delivery.delivery_tag;
        if !self.tracker.record(tag) {
            warn!("{}: delivery {} was already outstanding", self.context, tag);
        }
        debug!("{}: registered delivery {}", self.context, tag);
    }

    /// Dispatch an admitted delivery, wait for its outcome and settle it.
    pub async fn settle(&self, delivery: Delivery) -> Result<Settlement, ConsumerError> {
        let tag = delivery.delivery_tag;
        let (completer, pipeline_done) = completion();
        let (acknowledger, explicit_signal) = if self.mode == AcknowledgeMode::ExplicitSignal {
            let (completer, handle) = completion();
            (Some(Acknowledger::new(completer)), Some(handle))
        } else {
            (None, None)
        };
        let job = Job {
            delivery,
            completion: completer,
            acknowledger,
        };

        if let Err(source) = self.downstream.dispatch(job).await {
            self.clear(tag);
            return Err(ConsumerError::Dispatch {
                context: self.context.to_string(),
                delivery_tag: tag,
                source,
            });
        }

        // In explicit-signal mode pipeline completion is not awaited at all.
        let settled = match explicit_signal {
            Some(handle) => handle.wait().await,
            None => pipeline_done.wait().await,
        };
        let Some(outcome) = settled else {
            error!(
                "{}: delivery {} was abandoned without a completion signal; leaving it unacknowledged",
                self.context, tag
            );
            self.clear(tag);
            return Ok(Settlement::LeftUnacked);
        };

        let result = match decide(self.mode, outcome) {
            Decision::Ack => self
                .channel
                .ack(tag)
                .await
                .map(|_| Settlement::Acked)
                .map_err(|err| ConsumerError::broker("ack", err)),
            Decision::Nack => self
                .channel
                .nack(tag, self.requeue_on_nack)
                .await
                .map(|_| Settlement::Nacked)
                .map_err(|err| ConsumerError::broker("nack", err)),
            // A settled handle never carries a pending outcome.
            Decision::Defer => Ok(Settlement::LeftUnacked),
        };
        self.clear(tag);
        if let Ok(settlement) = &result {
            debug!("{}: delivery {} settled as {:?}", self.context, tag, settlement);
        }
        result
    }

    async fn ack_then_dispatch(&self, delivery: Delivery) -> Result<Settlement, ConsumerError> {
        let tag = delivery.delivery_tag;
        self.channel
            .ack(tag)
            .await
            .map_err(|err| ConsumerError::broker("ack", err))?;

        let (completer, _) = completion();
        let job = Job {
            delivery,
            completion: completer,
            acknowledger: None,
        };
        if let Err(err) = self.downstream.dispatch(job).await {
            error!(
                "{}: dispatch of already acknowledged delivery {} failed: {}",
                self.context, tag, err
            );
        }
        Ok(Settlement::Acked)
    }

    fn clear(&self, tag: DeliveryTag) {
        if self.tracker.clear(tag) {
            debug!("{}: cleared delivery {}", self.context, tag);
        } else {
            debug!("{}: delivery {} was not outstanding", self.context, tag);
        }
    }
}
