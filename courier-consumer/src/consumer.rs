use std::sync::Arc;

use courier_broker::{Channel, ChannelFault, Connection, Delivery};
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};

use crate::{
    downstream::Downstream,
    drain::{DrainCoordinator, DrainReport, ShutdownState},
    errors::ConsumerError,
    in_flight::InFlight,
    pipeline::{ConsumerContext, DeliveryPipeline},
    policy::AcknowledgeMode,
    settings::ConsumerSettings,
    tracker::DeliveryTracker,
};

/// One subscription on one channel, with its own tracker and drain.
pub struct Consumer {
    settings: ConsumerSettings,
    channel: Arc<dyn Channel>,
    tracker: DeliveryTracker,
    in_flight: InFlight,
    drain: DrainCoordinator,
    consumer_tag: Mutex<Option<String>>,
    fault: Arc<watch::Sender<Option<ChannelFault>>>,
}

impl Consumer {
    pub fn new(
        connection: Arc<dyn Connection>,
        channel: Arc<dyn Channel>,
        settings: ConsumerSettings,
    ) -> Self {
        let tracker = DeliveryTracker::new();
        let in_flight = InFlight::new();
        let drain = DrainCoordinator::new(
            tracker.clone(),
            in_flight.clone(),
            Arc::clone(&channel),
            connection,
            settings.drain_settings(),
        );
        let (fault, _) = watch::channel(None);
        Self {
            settings,
            channel,
            tracker,
            in_flight,
            drain,
            consumer_tag: Mutex::new(None),
            fault: Arc::new(fault),
        }
    }

    /// Open a dedicated channel on `connection` and build a consumer over it.
    pub async fn open(
        connection: Arc<dyn Connection>,
        settings: ConsumerSettings,
    ) -> Result<Self, ConsumerError> {
        settings.validate()?;
        let channel = connection
            .open_channel()
            .await
            .map_err(|err| ConsumerError::broker("channel.open", err))?;
        Ok(Self::new(connection, channel, settings))
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.drain.state()
    }

    pub fn consumer_tag(&self) -> Option<String> {
        self.consumer_tag.lock().clone()
    }

    /// Fault reported by the broker for this consumer's channel, if any.
    pub fn fault(&self) -> Option<ChannelFault> {
        self.fault.borrow().clone()
    }

    /// Resolve once the broker reports a channel fault.
    pub async fn wait_for_fault(&self) -> ConsumerError {
        let mut fault = self.fault.subscribe();
        let reported = match fault.wait_for(Option::is_some).await {
            Ok(reported) => reported.clone(),
            Err(_) => None,
        };
        match reported {
            Some(reported) => ConsumerError::ChannelFault(reported),
            None => ConsumerError::ShuttingDown,
        }
    }

    /// Subscribe to `queue` and start handing deliveries to `downstream`.
    pub async fn start_consumer(
        &self,
        queue: &str,
        mode: AcknowledgeMode,
        downstream: Arc<dyn Downstream>,
    ) -> Result<String, ConsumerError> {
        if self.drain.state() != ShutdownState::Running {
            return Err(ConsumerError::ShuttingDown);
        }
        if let Some(tag) = self.consumer_tag() {
            return Err(ConsumerError::AlreadyStarted(tag));
        }

        if self.settings.prefetch > 0 {
            self.channel
                .set_prefetch(self.settings.prefetch)
                .await
                .map_err(|err| ConsumerError::broker("prefetch", err))?;
        }
        let faults = self.channel.faults();
        let subscription = self
            .channel
            .consume(queue)
            .await
            .map_err(|err| ConsumerError::broker("consume", err))?;
        let consumer_tag = subscription.consumer_tag.clone();

        let context = ConsumerContext {
            consumer: self.settings.name.clone(),
            workflow: self.settings.workflow.clone(),
            queue: queue.to_string(),
        };
        let pipeline = DeliveryPipeline::new(
            Arc::clone(&self.channel),
            self.tracker.clone(),
            downstream,
            mode,
            context,
        )
        .with_requeue_on_nack(self.settings.requeue_on_nack);

        let delivery_loop = tokio::spawn(run_delivery_loop(
            pipeline,
            subscription.deliveries,
            faults,
            self.drain.subscribe(),
            self.in_flight.clone(),
            Arc::clone(&self.fault),
        ));

        let mut active = self.consumer_tag.lock();
        if let Some(existing) = active.as_ref() {
            // Lost a race with a concurrent start; keep the first subscription.
            delivery_loop.abort();
            return Err(ConsumerError::AlreadyStarted(existing.clone()));
        }
        self.drain.attach(delivery_loop);
        *active = Some(consumer_tag.clone());
        info!(
            "Consumer '{}' subscribed to '{}' as {} ({} mode)",
            self.settings.name, queue, consumer_tag, mode
        );
        Ok(consumer_tag)
    }

    /// Stop the subscription and wait until drained or the drain ceiling passes.
    pub async fn stop_consumer(&self, consumer_tag: &str) -> Result<DrainReport, ConsumerError> {
        match self.consumer_tag() {
            Some(active) if active == consumer_tag => {}
            _ => return Err(ConsumerError::UnknownConsumer(consumer_tag.to_string())),
        }

        self.drain.begin_drain(consumer_tag).await
    }
}

async fn run_delivery_loop(
    pipeline: DeliveryPipeline,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    mut faults: broadcast::Receiver<ChannelFault>,
    mut shutdown: watch::Receiver<ShutdownState>,
    in_flight: InFlight,
    fault_slot: Arc<watch::Sender<Option<ChannelFault>>>,
) {
    // The state only moves forward, so any change means a drain has begun.
    if *shutdown.borrow_and_update() != ShutdownState::Running {
        return;
    }
    let mut watching_faults = true;
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                debug!("{}: drain requested; no longer taking deliveries", pipeline.context());
                break;
            }
            fault = faults.recv(), if watching_faults => {
                match fault {
                    Ok(fault) => {
                        report_fault(&pipeline, &fault_slot, fault);
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => watching_faults = false,
                }
            }
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else {
                    if let Ok(fault) = faults.try_recv() {
                        report_fault(&pipeline, &fault_slot, fault);
                    } else {
                        debug!("{}: subscription ended", pipeline.context());
                    }
                    break;
                };
                if pipeline.mode() == AcknowledgeMode::Immediate {
                    if let Err(err) = pipeline.on_delivery(delivery).await {
                        error!("{}", err);
                    }
                } else {
                    pipeline.admit(&delivery);
                    let pipeline = pipeline.clone();
                    in_flight.spawn(async move {
                        if let Err(err) = pipeline.settle(delivery).await {
                            error!("{}", err);
                        }
                    });
                }
            }
        }
    }
}

fn report_fault(
    pipeline: &DeliveryPipeline,
    fault_slot: &watch::Sender<Option<ChannelFault>>,
    fault: ChannelFault,
) {
    error!("{}: {}; failing consumer", pipeline.context(), fault);
    fault_slot.send_replace(Some(fault));
}
