//! Dispatch engine CLI
//!
//! Module structure:
//! - `domain/` - Core types (Coordinate, TechnicianRecord, Assignment, errors)
//! - `io/` - External interfaces (geocoding, routing, caches, fleet file, egress)
//! - `services/` - Business logic (AvailabilityStore, CandidateRanker, DispatchOrchestrator)
//! - `infra/` - Infrastructure (Config, Metrics, AdmissionGate)

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use dispatch_engine::domain::{OrderId, OrderType, StockRequirement, TechnicianId};
use dispatch_engine::infra::{AdmissionGate, Config, Metrics, StoreBackend};
use dispatch_engine::io::{
    FleetFile, GeoCoder, InMemoryAvailabilityCache, JsonlAssignmentSink, NominatimClient,
    OpenRouteServiceClient, RedisAvailabilityCache, RouteProvider,
};
use dispatch_engine::services::{
    AvailabilityCache, AvailabilityStore, CandidateRanker, DispatchOrchestrator, DispatchRequest,
    TechnicianRoster,
};
use futures::{stream, StreamExt};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Dispatch engine - geocode orders, rank by driving time, reserve crews
#[derive(Parser, Debug)]
#[command(name = "dispatch-engine", version, about)]
struct Args {
    /// Path to TOML configuration file (else CONFIG_FILE, else config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dispatch a single order and print the assignment as JSON
    Dispatch {
        #[arg(long)]
        order_id: String,
        #[arg(long)]
        address: String,
        #[arg(long, value_enum, default_value = "installation")]
        order_type: OrderKind,
        /// Equipment model, added to the kit with quantity 1
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 1)]
        crew_size: usize,
        /// Choose the crew only from these technicians (repeatable)
        #[arg(long = "technician")]
        technicians: Vec<String>,
    },
    /// Dispatch every order of a JSON-lines file concurrently
    Batch { file: PathBuf },
    /// Print technician availability
    Technicians,
    /// Release a technician reservation
    Release { technician_id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OrderKind {
    Installation,
    Maintenance,
}

impl From<OrderKind> for OrderType {
    fn from(kind: OrderKind) -> Self {
        match kind {
            OrderKind::Installation => OrderType::Installation,
            OrderKind::Maintenance => OrderType::Maintenance,
        }
    }
}

/// One line of a batch file
#[derive(Debug, Deserialize)]
struct BatchOrder {
    order_id: OrderId,
    address: String,
    order_type: OrderType,
    #[serde(default)]
    equipment_model: Option<String>,
    #[serde(default)]
    crew_size: Option<usize>,
    #[serde(default)]
    technician_ids: Vec<TechnicianId>,
}

impl From<BatchOrder> for DispatchRequest {
    fn from(order: BatchOrder) -> Self {
        let requirement =
            StockRequirement::for_order(order.order_type, order.equipment_model.as_deref());
        DispatchRequest::new(order.order_id, order.address, requirement, order.crew_size.unwrap_or(1))
            .with_preferred_technicians(order.technician_ids)
    }
}

struct Engine {
    orchestrator: DispatchOrchestrator,
    metrics: Arc<Metrics>,
}

async fn build_store(config: &Config, metrics: &Arc<Metrics>) -> anyhow::Result<Arc<AvailabilityStore>> {
    let store_config = config.store();
    let cache: Arc<dyn AvailabilityCache> = match store_config.backend {
        StoreBackend::Memory => Arc::new(InMemoryAvailabilityCache::new()),
        StoreBackend::Redis => Arc::new(
            RedisAvailabilityCache::connect(&store_config.redis_url, &store_config.key_prefix)
                .await
                .with_context(|| format!("Failed to connect to {}", store_config.redis_url))?,
        ),
    };
    Ok(Arc::new(AvailabilityStore::new(cache, store_config).with_metrics(Arc::clone(metrics))))
}

async fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    let metrics = Arc::new(Metrics::new());
    let fleet = Arc::new(FleetFile::load(&config.fleet().file)?);

    let store = build_store(config, &metrics).await?;
    let roster = fleet.technicians().await.context("Failed to read technician roster")?;
    store.sync_roster(&roster).await.context("Failed to seed availability store")?;

    let geocoder_config = config.geocoder();
    let gate = Arc::new(AdmissionGate::from_millis(
        geocoder_config.admission_max_wait_ms,
        geocoder_config.min_interval_ms,
    ));
    let provider = NominatimClient::new(geocoder_config).context("Failed to build geocoding client")?;
    let geocoder = Arc::new(
        GeoCoder::new(Arc::new(provider), gate, geocoder_config).with_metrics(Arc::clone(&metrics)),
    );

    let router: Arc<dyn RouteProvider> = Arc::new(
        OpenRouteServiceClient::new(config.routing())
            .context("Failed to build routing client")?
            .with_metrics(Arc::clone(&metrics)),
    );
    let ranker = Arc::new(CandidateRanker::new(
        fleet,
        Arc::clone(&store),
        router,
        config.ranking(),
    ));

    let mut orchestrator =
        DispatchOrchestrator::new(geocoder, ranker, store, config.dispatch())
            .with_metrics(Arc::clone(&metrics));
    if config.egress().enabled {
        orchestrator = orchestrator.with_sink(Arc::new(JsonlAssignmentSink::new(&config.egress().file)));
    }

    Ok(Engine { orchestrator, metrics })
}

/// Periodic metrics log plus the optional Prometheus endpoint
fn start_reporting(config: &Config, metrics: &Arc<Metrics>, shutdown: watch::Receiver<bool>) {
    let prometheus_port = config.metrics().prometheus_port;
    if prometheus_port > 0 {
        let prom_metrics = Arc::clone(metrics);
        let site_id = config.site_id().to_string();
        let prom_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatch_engine::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                site_id,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    let metrics = Arc::clone(metrics);
    let interval_secs = config.metrics().interval_secs.max(1);
    let mut shutdown = shutdown;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics.report().log(),
                _ = shutdown.changed() => break,
            }
        }
    });
}

fn failure_line(order_id: &OrderId, e: &dispatch_engine::domain::DispatchError) -> String {
    serde_json::json!({
        "order_id": order_id,
        "error_kind": e.kind(),
        "retryable": e.is_retryable(),
        "error": e.to_string(),
    })
    .to_string()
}

async fn run_batch(engine: &Engine, file: &Path, concurrency: usize) -> anyhow::Result<(usize, usize)> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read batch file {}", file.display()))?;

    let requests = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| -> anyhow::Result<DispatchRequest> {
            let order: BatchOrder = serde_json::from_str(line)
                .with_context(|| format!("{}:{}", file.display(), i + 1))?;
            Ok(order.into())
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    info!(file = %file.display(), orders = requests.len(), concurrency, "batch_started");

    let results: Vec<bool> = stream::iter(requests)
        .map(|request| async move {
            match engine.orchestrator.dispatch_request(&request).await {
                Ok(assignment) => {
                    println!("{}", assignment.to_json());
                    true
                }
                Err(e) => {
                    println!("{}", failure_line(&request.order_id, &e));
                    false
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let ok = results.iter().filter(|ok| **ok).count();
    Ok((ok, results.len() - ok))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "dispatch_engine_starting");

    let config = Config::load(args.config.as_deref());
    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        store_backend = ?config.store().backend,
        fleet_file = %config.fleet().file,
        geocoder = %config.geocoder().base_url,
        routing = %config.routing().base_url,
        "config_loaded"
    );

    match args.command {
        Command::Dispatch { order_id, address, order_type, model, crew_size, technicians } => {
            let engine = build_engine(&config).await?;
            let order_id = OrderId::new(order_id);
            let requirement = StockRequirement::for_order(order_type.into(), model.as_deref());
            let request = DispatchRequest::new(order_id.clone(), address, requirement, crew_size)
                .with_preferred_technicians(technicians.into_iter().map(TechnicianId::new).collect());

            match engine.orchestrator.dispatch_request(&request).await {
                Ok(assignment) => println!("{}", assignment.to_json()),
                Err(e) => {
                    println!("{}", failure_line(&order_id, &e));
                    return Err(anyhow::Error::new(e).context(format!("dispatch of {order_id} failed")));
                }
            }
        }
        Command::Batch { file } => {
            let engine = build_engine(&config).await?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            start_reporting(&config, &engine.metrics, shutdown_rx);

            let concurrency = config.dispatch().max_concurrent_orders;
            tokio::select! {
                outcome = run_batch(&engine, &file, concurrency) => {
                    let (ok, failed) = outcome?;
                    info!(ok, failed, "batch_finished");
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("shutdown_signal_received");
                    // In-flight dispatches release their reservations from spawned tasks
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }

            engine.metrics.report().log();
            let _ = shutdown_tx.send(true);
        }
        Command::Technicians => {
            let metrics = Arc::new(Metrics::new());
            let store = build_store(&config, &metrics).await?;
            if config.store().backend == StoreBackend::Memory {
                let fleet = FleetFile::load(&config.fleet().file)?;
                store.sync_roster(fleet.technician_records()).await?;
            }
            for record in store.get_all().await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Release { technician_id } => {
            if config.store().backend == StoreBackend::Memory {
                anyhow::bail!(
                    "release of {technician_id} needs a shared store; {} uses the in-process memory backend",
                    config.config_file()
                );
            }
            let metrics = Arc::new(Metrics::new());
            let store = build_store(&config, &metrics).await?;
            store.release(&TechnicianId::new(technician_id)).await?;
        }
    }

    info!("dispatch_engine_done");
    Ok(())
}
