use std::{sync::Arc, time::Duration};

use courier_broker::{Channel, Connection, DeliveryTag};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};

use crate::{errors::ConsumerError, in_flight::InFlight, tracker::DeliveryTracker};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_POLLS: u32 = 300;

/// Lifecycle of a consumer's channel. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownState {
    Running,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSettings {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
        }
    }
}

impl DrainSettings {
    /// Longest time a drain waits before forcing the channel closed.
    pub fn ceiling(&self) -> Duration {
        self.poll_interval * self.max_polls
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReport {
    /// Every outstanding delivery settled; `polls` intervals were waited.
    Drained { polls: u32 },
    /// The ceiling was reached; these deliveries go back to the broker.
    TimedOut { abandoned: Vec<DeliveryTag> },
    /// Another caller already started the drain; returned once it closed.
    AlreadyRequested,
}

/// Graceful shutdown for one consumer channel.
///
/// `begin_drain` cancels the subscription and waits for the attached delivery
/// loop to stop pulling. It then polls the tracker until it is idle or the
/// ceiling is hit, and closes the channel followed by the connection.
/// Deliveries the loop never took stay unacked and are redelivered.
pub struct DrainCoordinator {
    state: watch::Sender<ShutdownState>,
    delivery_loop: Mutex<Option<JoinHandle<()>>>,
    tracker: DeliveryTracker,
    in_flight: InFlight,
    channel: Arc<dyn Channel>,
    connection: Arc<dyn Connection>,
    settings: DrainSettings,
}

impl DrainCoordinator {
    pub fn new(
        tracker: DeliveryTracker,
        in_flight: InFlight,
        channel: Arc<dyn Channel>,
        connection: Arc<dyn Connection>,
        settings: DrainSettings,
    ) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            state,
            delivery_loop: Mutex::new(None),
            tracker,
            in_flight,
            channel,
            connection,
            settings,
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Hand over the task pulling deliveries. It must stop once the state
    /// leaves `Running`; the drain joins it before polling.
    pub fn attach(&self, delivery_loop: JoinHandle<()>) {
        if let Some(previous) = self.delivery_loop.lock().replace(delivery_loop) {
            previous.abort();
        }
    }

    pub async fn begin_drain(&self, consumer_tag: &str) -> Result<DrainReport, ConsumerError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });
        if !started {
            let mut state = self.state.subscribe();
            let _ = state
                .wait_for(|state| *state == ShutdownState::Closed)
                .await;
            return Ok(DrainReport::AlreadyRequested);
        }

        info!(
            "Draining consumer {}: {} deliveries outstanding",
            consumer_tag,
            self.tracker.outstanding_count()
        );
        if let Err(err) = self.channel.cancel(consumer_tag).await {
            warn!("Failed to cancel consumer {}: {}", consumer_tag, err);
        }
        self.join_delivery_loop(consumer_tag).await;

        let report = match self.wait_until_idle().await {
            Some(polls) => DrainReport::Drained { polls },
            None => {
                let aborted = self.in_flight.abort_all();
                let abandoned = self.tracker.snapshot();
                for tag in &abandoned {
                    self.tracker.clear(*tag);
                }
                warn!(
                    "Consumer {} did not drain within {:?}; forcing close with {} deliveries outstanding ({} tasks aborted)",
                    consumer_tag,
                    self.settings.ceiling(),
                    abandoned.len(),
                    aborted
                );
                DrainReport::TimedOut { abandoned }
            }
        };

        let closed = self.close().await;
        self.state.send_replace(ShutdownState::Closed);
        info!("Consumer {} closed", consumer_tag);
        closed.map(|_| report)
    }

    async fn join_delivery_loop(&self, consumer_tag: &str) {
        let delivery_loop = self.delivery_loop.lock().take();
        if let Some(delivery_loop) = delivery_loop {
            if let Err(err) = delivery_loop.await {
                if !err.is_cancelled() {
                    warn!("Delivery loop for {} ended abnormally: {}", consumer_tag, err);
                }
            }
        }
    }

    /// Number of polls waited until idle, or `None` once the ceiling is hit.
    async fn wait_until_idle(&self) -> Option<u32> {
        let mut polls = 0;
        while polls < self.settings.max_polls {
            if self.tracker.is_idle() {
                return Some(polls);
            }
            tokio::time::sleep(self.settings.poll_interval).await;
            polls += 1;
            debug!(
                "Drain poll {}/{}: {} outstanding",
                polls,
                self.settings.max_polls,
                self.tracker.outstanding_count()
            );
        }
        self.tracker.is_idle().then_some(polls)
    }

    async fn close(&self) -> Result<(), ConsumerError> {
        let channel = self.channel.close().await;
        let connection = self.connection.close().await;
        channel.map_err(|err| ConsumerError::broker("channel.close", err))?;
        connection.map_err(|err| ConsumerError::broker("connection.close", err))
    }
}
