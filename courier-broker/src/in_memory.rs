use crate::{
    BrokerError, Channel, ChannelFault, Connection, ConnectionConfig, Connector, Delivery,
    DeliveryTag, ExchangeKind, ExchangeSpec, Payload, QueueSpec, Subscription,
};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Name of the exchange that routes straight to the queue named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

const FAULT_BUFFER: usize = 16;

/// Channel-affecting operations in the order the broker accepted them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Ack { channel: u64, delivery_tag: DeliveryTag },
    Nack { channel: u64, delivery_tag: DeliveryTag, requeue: bool },
    Cancel { channel: u64, consumer_tag: String },
    ChannelClosed { channel: u64 },
    ConnectionClosed { connection: u64 },
}

#[derive(Debug, Clone)]
struct Message {
    payload: Payload,
    redelivered: bool,
}

struct ExchangeState {
    spec: ExchangeSpec,
    bindings: Vec<(String, String)>,
}

struct QueueState {
    ready: VecDeque<Message>,
    consumers: VecDeque<String>,
}

struct Unacked {
    queue: String,
    message: Message,
}

struct ConsumerState {
    queue: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    next_tag: DeliveryTag,
    unacked: HashMap<DeliveryTag, Unacked>,
    consumers: HashMap<String, ConsumerState>,
    faults: broadcast::Sender<ChannelFault>,
}

impl ChannelState {
    fn has_credit(&self) -> bool {
        self.open && (self.prefetch == 0 || self.unacked.len() < self.prefetch as usize)
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, bool>,
    consumer_channels: HashMap<String, u64>,
    next_channel_id: u64,
    next_connection_id: u64,
    dead_letters: Vec<Delivery>,
    events: Vec<BrokerEvent>,
}

/// Process-local broker used by tests and the worker's `in-memory` backend.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection without going through the [`Connector`] trait.
    pub fn connect_in_memory(&self) -> Arc<InMemoryConnection> {
        let mut guard = self.state.lock();
        guard.next_connection_id += 1;
        let id = guard.next_connection_id;
        guard.connections.insert(id, true);
        Arc::new(InMemoryConnection {
            id,
            broker: self.clone(),
        })
    }

    /// Route a message through `exchange`. Returns how many queues received it.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Payload,
    ) -> Result<usize, BrokerError> {
        let mut guard = self.state.lock();
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if !guard.queues.contains_key(routing_key) {
                return Err(BrokerError::UnknownQueue(routing_key.to_string()));
            }
            vec![routing_key.to_string()]
        } else {
            let state = guard
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
            state
                .bindings
                .iter()
                .filter(|(_, key)| match state.spec.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Direct => key == routing_key,
                })
                .map(|(queue, _)| queue.clone())
                .collect()
        };

        for queue in &targets {
            if let Some(state) = guard.queues.get_mut(queue) {
                state.ready.push_back(Message {
                    payload: payload.clone(),
                    redelivered: false,
                });
            }
            dispatch(&mut guard, queue);
        }
        Ok(targets.len())
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().events.clone()
    }

    pub fn dead_letters(&self) -> Vec<Delivery> {
        self.state.lock().dead_letters.clone()
    }

    /// Messages waiting in `queue` that have not been handed to a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|state| state.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries handed out across all channels and not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    pub fn is_connection_open(&self, connection: u64) -> bool {
        self.state
            .lock()
            .connections
            .get(&connection)
            .copied()
            .unwrap_or(false)
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>, BrokerError> {
        debug!(
            "Opening in-memory connection for {}:{}{}",
            config.host, config.port, config.vhost
        );
        Ok(self.connect_in_memory())
    }
}

pub struct InMemoryConnection {
    id: u64,
    broker: InMemoryBroker,
}

impl InMemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Open a channel and keep its concrete type, e.g. to inject faults.
    pub fn open_in_memory_channel(&self) -> Result<Arc<InMemoryChannel>, BrokerError> {
        let mut guard = self.broker.state.lock();
        if !guard.connections.get(&self.id).copied().unwrap_or(false) {
            return Err(BrokerError::ConnectionClosed);
        }
        guard.next_channel_id += 1;
        let id = guard.next_channel_id;
        let (faults, _) = broadcast::channel(FAULT_BUFFER);
        guard.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                next_tag: 1,
                unacked: HashMap::new(),
                consumers: HashMap::new(),
                faults,
            },
        );
        Ok(Arc::new(InMemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        Ok(self.open_in_memory_channel()?)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut guard = self.broker.state.lock();
        if !guard.connections.get(&self.id).copied().unwrap_or(false) {
            return Ok(());
        }
        let channel_ids: Vec<u64> = guard
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channel_ids {
            close_channel(&mut guard, channel_id);
        }
        guard.connections.insert(self.id, false);
        guard
            .events
            .push(BrokerEvent::ConnectionClosed { connection: self.id });
        Ok(())
    }
}

pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

impl InMemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.broker
            .state
            .lock()
            .channels
            .get(&self.id)
            .map(|channel| channel.open)
            .unwrap_or(false)
    }

    /// Close the channel from the broker side and broadcast the fault.
    pub fn inject_fault(&self, code: u16, reason: impl Into<String>) {
        let mut guard = self.broker.state.lock();
        let fault = ChannelFault {
            code,
            reason: reason.into(),
        };
        // Subscribers see the fault before their delivery streams end.
        if let Some(channel) = guard.channels.get(&self.id) {
            let _ = channel.faults.send(fault);
        }
        close_channel(&mut guard, self.id);
    }

    fn with_open_channel<T>(
        &self,
        operation: impl FnOnce(&mut BrokerState) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let mut guard = self.broker.state.lock();
        let open = guard
            .channels
            .get(&self.id)
            .map(|channel| channel.open)
            .unwrap_or(false);
        if !open {
            return Err(BrokerError::ChannelClosed);
        }
        operation(&mut *guard)
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.with_open_channel(|state| {
            state
                .exchanges
                .entry(exchange.name.clone())
                .or_insert_with(|| ExchangeState {
                    spec: exchange.clone(),
                    bindings: Vec::new(),
                });
            Ok(())
        })
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        self.with_open_channel(|state| {
            state
                .queues
                .entry(queue.name.clone())
                .or_insert_with(|| QueueState {
                    ready: VecDeque::new(),
                    consumers: VecDeque::new(),
                });
            Ok(())
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.with_open_channel(|state| {
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }
            let exchange_state = state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
            let binding = (queue.to_string(), routing_key.to_string());
            if !exchange_state.bindings.contains(&binding) {
                exchange_state.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let id = self.id;
        self.with_open_channel(|state| {
            if let Some(channel) = state.channels.get_mut(&id) {
                channel.prefetch = count;
            }
            Ok(())
        })
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, BrokerError> {
        let id = self.id;
        self.with_open_channel(|state| {
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }
            let consumer_tag = format!("ctag-{}", Uuid::new_v4());
            let (sender, deliveries) = mpsc::unbounded_channel();
            if let Some(channel) = state.channels.get_mut(&id) {
                channel.consumers.insert(
                    consumer_tag.clone(),
                    ConsumerState {
                        queue: queue.to_string(),
                        sender,
                    },
                );
            }
            state.consumer_channels.insert(consumer_tag.clone(), id);
            if let Some(queue_state) = state.queues.get_mut(queue) {
                queue_state.consumers.push_back(consumer_tag.clone());
            }
            dispatch(state, queue);
            Ok(Subscription {
                consumer_tag,
                deliveries,
            })
        })
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        let id = self.id;
        self.with_open_channel(|state| {
            let unacked = take_unacked(state, id, delivery_tag)?;
            state.events.push(BrokerEvent::Ack {
                channel: id,
                delivery_tag,
            });
            dispatch(state, &unacked.queue);
            Ok(())
        })
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let id = self.id;
        self.with_open_channel(|state| {
            let Unacked { queue, message } = take_unacked(state, id, delivery_tag)?;
            if requeue {
                if let Some(queue_state) = state.queues.get_mut(&queue) {
                    queue_state.ready.push_front(Message {
                        redelivered: true,
                        ..message
                    });
                }
            } else {
                state.dead_letters.push(Delivery {
                    delivery_tag,
                    consumer_tag: String::new(),
                    queue: queue.clone(),
                    redelivered: message.redelivered,
                    payload: message.payload,
                });
            }
            state.events.push(BrokerEvent::Nack {
                channel: id,
                delivery_tag,
                requeue,
            });
            dispatch(state, &queue);
            Ok(())
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let id = self.id;
        self.with_open_channel(|state| {
            let consumer = state
                .channels
                .get_mut(&id)
                .and_then(|channel| channel.consumers.remove(consumer_tag))
                .ok_or_else(|| BrokerError::UnknownConsumer(consumer_tag.to_string()))?;
            state.consumer_channels.remove(consumer_tag);
            if let Some(queue_state) = state.queues.get_mut(&consumer.queue) {
                queue_state.consumers.retain(|tag| tag != consumer_tag);
            }
            state.events.push(BrokerEvent::Cancel {
                channel: id,
                consumer_tag: consumer_tag.to_string(),
            });
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut guard = self.broker.state.lock();
        close_channel(&mut guard, self.id);
        Ok(())
    }

    fn faults(&self) -> broadcast::Receiver<ChannelFault> {
        match self.broker.state.lock().channels.get(&self.id) {
            Some(channel) => channel.faults.subscribe(),
            None => broadcast::channel(FAULT_BUFFER).1,
        }
    }
}

fn take_unacked(
    state: &mut BrokerState,
    channel_id: u64,
    delivery_tag: DeliveryTag,
) -> Result<Unacked, BrokerError> {
    state
        .channels
        .get_mut(&channel_id)
        .and_then(|channel| channel.unacked.remove(&delivery_tag))
        .ok_or(BrokerError::UnknownDelivery(delivery_tag))
}

/// Hand ready messages of `queue_name` to consumers with prefetch credit, round-robin.
fn dispatch(state: &mut BrokerState, queue_name: &str) {
    let BrokerState {
        queues,
        channels,
        consumer_channels,
        ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() {
        let mut chosen = None;
        for _ in 0..queue.consumers.len() {
            let Some(consumer_tag) = queue.consumers.pop_front() else {
                break;
            };
            queue.consumers.push_back(consumer_tag.clone());
            let has_credit = consumer_channels
                .get(&consumer_tag)
                .and_then(|channel_id| channels.get(channel_id))
                .map(ChannelState::has_credit)
                .unwrap_or(false);
            if has_credit {
                chosen = Some(consumer_tag);
                break;
            }
        }

        let Some(consumer_tag) = chosen else {
            break;
        };
        let Some(channel) = consumer_channels
            .get(&consumer_tag)
            .and_then(|channel_id| channels.get_mut(channel_id))
        else {
            break;
        };
        let Some(message) = queue.ready.pop_front() else {
            break;
        };

        let delivery_tag = channel.next_tag;
        channel.next_tag += 1;
        let delivery = Delivery {
            delivery_tag,
            consumer_tag: consumer_tag.clone(),
            queue: queue_name.to_string(),
            redelivered: message.redelivered,
            payload: message.payload.clone(),
        };

        let sent = channel
            .consumers
            .get(&consumer_tag)
            .map(|consumer| consumer.sender.send(delivery).is_ok())
            .unwrap_or(false);
        if sent {
            channel.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    message,
                },
            );
        } else {
            // Receiver went away; retire the consumer and keep the message.
            queue.ready.push_front(message);
            channel.consumers.remove(&consumer_tag);
            consumer_channels.remove(&consumer_tag);
            queue.consumers.retain(|tag| tag != &consumer_tag);
        }
    }
}

/// Close a channel: end its subscriptions and requeue its unacknowledged deliveries.
fn close_channel(state: &mut BrokerState, channel_id: u64) {
    let Some(channel) = state.channels.get_mut(&channel_id) else {
        return;
    };
    if !channel.open {
        return;
    }
    channel.open = false;
    let consumers: Vec<(String, ConsumerState)> = channel.consumers.drain().collect();
    let mut unacked: Vec<(DeliveryTag, Unacked)> = channel.unacked.drain().collect();
    unacked.sort_by(|a, b| b.0.cmp(&a.0));

    let mut touched = Vec::new();
    for (consumer_tag, consumer) in consumers {
        state.consumer_channels.remove(&consumer_tag);
        if let Some(queue_state) = state.queues.get_mut(&consumer.queue) {
            queue_state.consumers.retain(|tag| tag != &consumer_tag);
        }
    }
    for (_, Unacked { queue, message }) in unacked {
        if let Some(queue_state) = state.queues.get_mut(&queue) {
            queue_state.ready.push_front(Message {
                redelivered: true,
                ..message
            });
        }
        if !touched.contains(&queue) {
            touched.push(queue);
        }
    }
    state
        .events
        .push(BrokerEvent::ChannelClosed { channel: channel_id });
    for queue in touched {
        dispatch(state, &queue);
    }
}
