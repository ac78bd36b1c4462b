//! RPC responder entry point
//!
//! Usage:
//!   rpc-responder <simulation-id>
//!   rpc-responder <simulation-id> --config config/responder.toml --log-format json

mod startup;

use anyhow::{Context, Result};
use clap::Parser;
use rpc_config::{ConfigLoader, LogFormat, LoggingSettings, ResponderConfig};
use rpc_core::{
    spawn_error_sink, BusPublisher, FinalMessagePolicy, ProcessorLoop, QueueNames,
    RequestHandler, SenderMode, TracingErrorSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rpc-responder")]
#[command(about = "Answers simulation requests from a message queue")]
#[command(version)]
struct Args {
    /// Simulation id; requests are read from `<id>_requests`
    simulation_id: String,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Vault holding the bus connection string
    #[arg(long)]
    vault: Option<String>,

    /// Maximum concurrently handled requests
    #[arg(long)]
    concurrency: Option<usize>,

    /// Stop after the message flagged as final
    #[arg(long)]
    stop_on_final: bool,

    /// Reuse one connection for all replies
    #[arg(long)]
    pooled: bool,

    /// Log format (text, json)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Default log filter when RUST_LOG is unset
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    /// Command-line flags win over file and environment
    fn apply(&self, config: &mut ResponderConfig) {
        if let Some(vault) = &self.vault {
            config.responder.vault_name = vault.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.responder.concurrency_limit = concurrency;
        }
        if self.stop_on_final {
            config.responder.final_message_policy = FinalMessagePolicy::Stop;
        }
        if self.pooled {
            config.responder.sender_mode = SenderMode::Pooled;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loader = match &args.config {
        Some(path) => ConfigLoader::new().with_file(path),
        None => ConfigLoader::new(),
    };
    let sources = loader.sources();
    let mut config = loader.load().context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if args.print_config {
        println!("{}", config.to_redacted_toml()?);
        return Ok(());
    }

    init_logging(&config.logging)?;
    info!("Configuration sources: {}", sources.join(" < "));
    run(&args.simulation_id, config).await
}

async fn run(simulation_id: &str, config: ResponderConfig) -> Result<()> {
    let queues = QueueNames::for_simulation(simulation_id);

    info!("Starting RPC responder");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Request queue: {}", queues.requests);
    info!("Response queue: {}", queues.responses);
    info!("Configuration loaded: {:?}", config.responder);

    let resolver = startup::build_resolver(&config)?;
    let descriptor = Arc::new(
        resolver
            .resolve(&config.responder.vault_name)
            .await
            .with_context(|| {
                format!(
                    "Failed to resolve bus connection from vault {}",
                    config.responder.vault_name
                )
            })?,
    );
    info!("Bus endpoint: {}", descriptor);

    let transport = startup::build_transport(&config, &descriptor, &queues)?;
    if let Some(broker) = &transport.broker {
        info!(
            "Serving from in-process broker {} (requests are not persisted)",
            broker.namespace()
        );
    }

    let (reporter, sink_task) = spawn_error_sink(Arc::new(TracingErrorSink));
    let publisher = Arc::new(BusPublisher::new(
        Arc::clone(&transport.connector),
        Arc::clone(&descriptor),
        config.publisher_config(),
    ));
    info!("Reply sender mode: {:?}", publisher.mode());
    let handler = Arc::new(RequestHandler::new(publisher.clone()));
    let processor = ProcessorLoop::new(
        Arc::clone(&transport.connector),
        descriptor,
        handler,
        reporter,
        config.processor_config(),
    )?;

    info!("Processor settings: {:?}", processor.config());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    let stats = processor.run(&queues.requests, shutdown_rx).await;

    publisher.close().await;
    drop(processor);
    if let Ok(faults) = sink_task.await {
        info!("Error sink drained ({} faults)", faults);
    }

    let stats = stats.context("Processor loop failed")?;
    info!(
        "Final stats: {}",
        serde_json::to_string(&stats).unwrap_or_else(|_| format!("{:?}", stats))
    );
    Ok(())
}

fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let default_filter = format!(
        "rpc_responder={level},rpc_core={level},warn",
        level = settings.level
    );
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&default_filter))
        .context("Invalid log filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    match settings.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    }
    .context("Failed to install tracing subscriber")
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
