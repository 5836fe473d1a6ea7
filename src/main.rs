//! CLI for topicbus
//!
//! Subcommands:
//! - `listen`: print every message routed to the given patterns until Ctrl-C
//! - `push`: publish one JSON payload under a routing key

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use topicbus::config::{Settings, load_config};
use topicbus::utils::logging;
use topicbus::{AmqpConnection, Connection, DispatchConfig, MessageBroker};

#[derive(Parser)]
#[command(name = "topicbus", about = "Publish to and listen on an AMQP topic exchange")]
struct Cli {
    /// Broker URL, overrides `broker.url` from the configuration
    #[arg(long)]
    url: Option<String>,

    /// Exchange name, overrides `broker.exchange` from the configuration
    #[arg(long)]
    exchange: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bind to the given routing-key patterns and log every message received
    Listen {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Publish a payload; text that is not valid JSON is sent as a JSON string
    Push { routing_key: String, payload: String },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    logging::init(&settings.log.level);

    if let Some(url) = cli.url {
        settings.broker.url = url;
    }
    if let Some(exchange) = cli.exchange {
        settings.broker.exchange = exchange;
    }

    if let Err(e) = run(cli.command, settings).await {
        error!("topicbus failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command, settings: Settings) -> topicbus::Result<()> {
    let connection =
        Arc::new(AmqpConnection::connect(&settings.broker.url, settings.broker.max_attempts).await?);

    let mut broker = MessageBroker::new(
        connection.clone(),
        settings.broker.exchange.as_str(),
        settings.broker.queue.as_str(),
    )
    .with_dispatch(DispatchConfig {
        workers: settings.dispatch.workers,
        capacity: settings.dispatch.capacity,
    });
    if let Some(timeout) = settings.publish.timeout() {
        broker = broker.with_publish_timeout(timeout);
    }

    let outcome = match command {
        Command::Listen { patterns } => listen(&broker, &patterns).await,
        Command::Push {
            routing_key,
            payload,
        } => {
            let value = serde_json::from_str::<serde_json::Value>(&payload)
                .unwrap_or(serde_json::Value::String(payload));
            broker.push_to_queue(&routing_key, &value).await.map(|()| {
                info!(exchange = %broker.exchange(), routing_key = %routing_key, "message pushed");
            })
        }
    };

    if let Err(e) = connection.close().await {
        error!("Failed to close broker connection: {}", e);
    }
    outcome
}

async fn listen(broker: &MessageBroker<AmqpConnection>, patterns: &[String]) -> topicbus::Result<()> {
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received. Exiting gracefully.");
            on_signal.cancel();
        }
    });

    let handler = |routing_key: String, payload: Vec<u8>| async move {
        info!(
            routing_key = %routing_key,
            payload = %String::from_utf8_lossy(&payload),
            "message received"
        );
    };

    broker
        .listen_for_updates_until(patterns, handler, shutdown)
        .await
}
