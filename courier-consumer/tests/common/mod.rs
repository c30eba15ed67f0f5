#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use courier_broker::{
    Channel, DeliveryTag, Payload, QueueSpec,
    in_memory::{BrokerEvent, DEFAULT_EXCHANGE, InMemoryBroker, InMemoryChannel, InMemoryConnection},
};
use courier_consumer::{Consumer, ConsumerSettings};

pub const QUEUE: &str = "orders";

pub struct Harness {
    pub broker: InMemoryBroker,
    pub connection: Arc<InMemoryConnection>,
    pub channel: Arc<InMemoryChannel>,
    pub consumer: Consumer,
}

pub async fn harness(settings: ConsumerSettings) -> Harness {
    let broker = InMemoryBroker::new();
    let connection = broker.connect_in_memory();
    let channel = connection.open_in_memory_channel().unwrap();
    channel.declare_queue(&QueueSpec::new(QUEUE)).await.unwrap();
    let consumer = Consumer::new(connection.clone(), channel.clone(), settings);
    Harness {
        broker,
        connection,
        channel,
        consumer,
    }
}

pub fn publish(broker: &InMemoryBroker, body: &str) {
    broker
        .publish(DEFAULT_EXCHANGE, QUEUE, Payload::new(body))
        .unwrap();
}

pub fn acked(events: &[BrokerEvent]) -> Vec<DeliveryTag> {
    events
        .iter()
        .filter_map(|event| match event {
            BrokerEvent::Ack { delivery_tag, .. } => Some(*delivery_tag),
            _ => None,
        })
        .collect()
}

pub fn nacked(events: &[BrokerEvent]) -> Vec<DeliveryTag> {
    events
        .iter()
        .filter_map(|event| match event {
            BrokerEvent::Nack { delivery_tag, .. } => Some(*delivery_tag),
            _ => None,
        })
        .collect()
}

pub fn position(events: &[BrokerEvent], predicate: impl Fn(&BrokerEvent) -> bool) -> usize {
    events
        .iter()
        .position(predicate)
        .expect("event not found")
}

/// Poll `condition` every millisecond for up to ten seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met in time");
}
