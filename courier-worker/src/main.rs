mod config;
mod handler;

use std::sync::Arc;

use config::{Config, parse_config};
use courier_broker::{
    BrokerError, Channel, Connector, ExchangeSpec, Payload, QueueSpec,
    in_memory::InMemoryBroker,
};
use courier_consumer::{Consumer, DrainReport};
use courier_utilities::{
    errors::{RuntimeError, SendableError},
    startup,
};
use handler::{WorkItem, WorkItemHandler};
use log::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let config = parse_config()?;
    startup::startup("Courier Worker", config.log_level, config.log_file.as_deref())?;
    info!("Worker ID: {}", config.worker_id);

    let (connector, local_broker) = build_connector(&config)?;
    let connection = connector
        .connect(&config.connection)
        .await
        .map_err(|err| broker_error("connect", err))?;

    let setup = connection
        .open_channel()
        .await
        .map_err(|err| broker_error("channel", err))?;
    declare_topology(setup.as_ref(), &config).await?;
    setup
        .close()
        .await
        .map_err(|err| broker_error("channel.close", err))?;

    if let Some(broker) = &local_broker {
        publish_demo_messages(broker, &config)?;
    }

    let consumer = Consumer::open(connection, config.settings.clone()).await?;
    let consumer_tag = consumer
        .start_consumer(&config.queue, config.settings.mode, Arc::new(WorkItemHandler))
        .await?;

    let fault = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!("Failed to listen for Ctrl+C: {}", err);
            }
            info!("Shutdown signal received. Draining consumer...");
            None
        }
        fault = consumer.wait_for_fault() => {
            error!("Consumer failed: {}", fault);
            Some(fault)
        }
    };

    match consumer.stop_consumer(&consumer_tag).await? {
        DrainReport::Drained { polls } => {
            info!("Consumer drained after {} polls", polls)
        }
        DrainReport::TimedOut { abandoned } => warn!(
            "Drain timed out; {} deliveries will be redelivered: {:?}",
            abandoned.len(),
            abandoned
        ),
        DrainReport::AlreadyRequested => info!("Consumer was already draining"),
    }

    match fault {
        Some(fault) => Err(Box::new(fault) as SendableError),
        None => Ok(()),
    }
}

fn build_connector(
    config: &Config,
) -> Result<(Arc<dyn Connector>, Option<InMemoryBroker>), SendableError> {
    match config.backend.as_str() {
        "in-memory" => {
            let broker = InMemoryBroker::new();
            Ok((Arc::new(broker.clone()), Some(broker)))
        }
        "rabbitmq" => Err(RuntimeError::boxed(
            "worker.broker.backend_not_ready",
            format!("Broker backend '{}' is not implemented yet", config.backend),
        )),
        other => Err(RuntimeError::boxed(
            "worker.broker.unknown_backend",
            format!("Unknown broker backend '{other}'"),
        )),
    }
}

async fn declare_topology(channel: &dyn Channel, config: &Config) -> Result<(), SendableError> {
    channel
        .declare_exchange(&ExchangeSpec::direct(&config.exchange))
        .await
        .map_err(|err| broker_error("declare_exchange", err))?;
    channel
        .declare_queue(&QueueSpec::new(&config.queue))
        .await
        .map_err(|err| broker_error("declare_queue", err))?;
    channel
        .bind_queue(&config.queue, &config.exchange, &config.routing_key)
        .await
        .map_err(|err| broker_error("bind_queue", err))?;
    info!(
        "Declared queue '{}' bound to '{}' with key '{}'",
        config.queue, config.exchange, config.routing_key
    );
    Ok(())
}

fn publish_demo_messages(broker: &InMemoryBroker, config: &Config) -> Result<(), SendableError> {
    for id in 0..u64::from(config.demo_messages) {
        let item = WorkItem {
            id,
            duration_ms: 250 * (id % 4),
            fail: id % 5 == 4,
        };
        let payload = Payload::json(&item)?.with_header("work-item-id", id.to_string());
        broker
            .publish(&config.exchange, &config.routing_key, payload)
            .map_err(|err| broker_error("publish", err))?;
    }
    if config.demo_messages > 0 {
        info!("Published {} demo messages", config.demo_messages);
    }
    Ok(())
}

fn broker_error(context: &'static str, err: BrokerError) -> SendableError {
    RuntimeError::boxed(format!("worker.broker.{context}"), err.to_string())
}
