use std::path::PathBuf;

use clap::Parser;
use courier_broker::ConnectionConfig;
use courier_consumer::{AcknowledgeMode, ConsumerSettings, load_settings};
use courier_utilities::{errors::SendableError, logger::parse_level};
use log::LevelFilter;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub worker_id: Uuid,
    pub backend: String,
    pub connection: ConnectionConfig,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub settings: ConsumerSettings,
    pub demo_messages: u32,
    pub log_level: LevelFilter,
    pub log_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    #[arg(long, default_value = "in-memory")]
    backend: String,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 5672)]
    port: u16,

    #[arg(long, default_value = "/")]
    vhost: String,

    #[arg(long, default_value = "courier.work")]
    exchange: String,

    #[arg(long, default_value = "courier.jobs")]
    queue: String,

    #[arg(long, default_value = "jobs")]
    routing_key: String,

    /// JSON file with consumer settings; flags below override it.
    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long)]
    mode: Option<AcknowledgeMode>,

    #[arg(long)]
    prefetch: Option<u16>,

    #[arg(long)]
    workflow: Option<String>,

    #[arg(long, default_value_t = 0)]
    demo_messages: u32,

    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: LevelFilter,

    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    worker_id: Option<String>,
}

pub fn parse_config() -> Result<Config, SendableError> {
    build_config(CliArgs::try_parse()?)
}

fn build_config(args: CliArgs) -> Result<Config, SendableError> {
    let worker_id = match args.worker_id {
        Some(ref value) if !value.is_empty() => Uuid::parse_str(value)?,
        _ => Uuid::new_v4(),
    };

    let mut settings = match &args.settings {
        Some(path) => load_settings(path)?,
        None => ConsumerSettings {
            name: format!("courier-worker-{worker_id}"),
            ..ConsumerSettings::default()
        },
    };
    if let Some(mode) = args.mode {
        settings.mode = mode;
    }
    if let Some(prefetch) = args.prefetch {
        settings.prefetch = prefetch;
    }
    if args.workflow.is_some() {
        settings.workflow = args.workflow;
    }
    settings.validate()?;

    Ok(Config {
        worker_id,
        backend: args.backend,
        connection: ConnectionConfig {
            host: args.host,
            port: args.port,
            vhost: args.vhost,
            connection_name: Some(format!("courier-worker-{worker_id}")),
        },
        exchange: args.exchange,
        queue: args.queue,
        routing_key: args.routing_key,
        settings,
        demo_messages: args.demo_messages,
        log_level: args.log_level,
        log_file: args.log_file,
    })
}
