use anyhow::Context;
use catalog_sync::broker::{AmqpTransport, ConnectionManager, ConsumerOptions, EventConsumer, EventPublisher};
use catalog_sync::replica::{InMemoryReplica, ReplicaStore, SnapshotStore};
use catalog_sync::{BookSnapshot, Config, EventKind, ReplicaService};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "catalog-sync")]
#[command(about = "Replicates inventory changes into a catalog over AMQP", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the catalog replica until interrupted
    Consume,
    /// Publish a single book event
    Publish {
        #[arg(short, long, help = "created, updated or deleted")]
        kind: EventKind,
        #[arg(short, long, help = "Book snapshot as JSON")]
        book: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Consume => consume(config).await,
        Command::Publish { kind, book } => publish(config, kind, &book).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn consume(config: Config) -> anyhow::Result<()> {
    info!(
        exchange = %config.broker.exchange,
        ack_mode = %config.consumer.ack_mode,
        snapshot = ?config.replica.snapshot_path,
        "Starting catalog replica"
    );

    let snapshots = config.replica.snapshot_path.as_ref().map(SnapshotStore::new);
    let replica = match &snapshots {
        Some(store) => match store.load().await? {
            Some(snapshot) => InMemoryReplica::from_entries(snapshot.entries),
            None => InMemoryReplica::new(),
        },
        None => InMemoryReplica::new(),
    };
    let replica = Arc::new(replica);

    let transport = AmqpTransport::from_config(&config.broker);
    let connections = Arc::new(ConnectionManager::from_config(transport, &config));
    let consumer = EventConsumer::new(
        connections,
        replica.clone(),
        ConsumerOptions::from(&config.consumer),
    );

    let mut service = ReplicaService::new(consumer);
    if let Some(store) = snapshots {
        service = service.with_snapshots(store, config.replica.snapshot_interval());
    }

    let signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    };

    service
        .run(signal)
        .await
        .context("Consumer stopped with a fatal error")?;
    info!(entries = replica.len()?, "Catalog replica exited");
    Ok(())
}

async fn publish(config: Config, kind: EventKind, book: &str) -> anyhow::Result<()> {
    let book: BookSnapshot = serde_json::from_str(book).context("Invalid book JSON")?;

    let transport = AmqpTransport::from_config(&config.broker);
    let connections = Arc::new(ConnectionManager::from_config(transport, &config));
    let publisher =
        EventPublisher::new(connections.clone()).with_persistence(config.publisher.persistent);

    let result = publisher.publish(kind, &book).await;
    connections.close().await;

    result?;
    info!(event_type = %kind, book_id = book.id, "Event published");
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("catalog_sync=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("catalog_sync=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
