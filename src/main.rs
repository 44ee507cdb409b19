//! Distributed content-addressed file storage coordinator.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use stratafs::config::Config;
use stratafs::control::ControlPlane;
use stratafs::db;
use stratafs::storage::backend_client::S3BackendClient;
use stratafs::storage::BackendHandle;

#[derive(Parser)]
#[command(name = "stratafs")]
#[command(about = "Distributed content-addressed file storage coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Register a backend node
    RegisterBackend {
        /// S3-compatible endpoint URL
        url: String,
    },
    /// List backends and their health/load
    Status,
    /// Probe every backend once and apply health-state transitions
    HealthSweep,
    /// Recompute every backend's load/storage_usage from the association table
    MetricsSweep,
    /// Run the reconciler (replica top-up, load balancing, long-offline evacuation)
    Reconcile {
        /// Also run the load-balancing pass
        #[arg(long)]
        balance_load: bool,
        /// Report what would change without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Administratively mark a backend offline (suppresses auto-recovery)
    MarkOffline {
        backend_id: Uuid,
    },
    /// Administratively mark a backend online (probes once before transitioning)
    MarkOnline {
        backend_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratafs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => run_migrations(&config).await,
        Commands::RegisterBackend { url } => register_backend(&config, &url).await,
        Commands::Status => show_status(&config).await,
        Commands::HealthSweep => health_sweep(&config).await,
        Commands::MetricsSweep => metrics_sweep(&config).await,
        Commands::Reconcile {
            balance_load,
            dry_run,
        } => reconcile(&config, balance_load, dry_run).await,
        Commands::MarkOffline { backend_id } => mark_offline(&config, backend_id).await,
        Commands::MarkOnline { backend_id } => mark_online(&config, backend_id).await,
    }
}

async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    println!("running migrations...");
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    println!("migrations complete");
    Ok(())
}

async fn register_backend(config: &Config, url: &str) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    let control = ControlPlane::new(pool, config.clone());
    let backend = control.register_backend(url).await?;
    println!("registered backend {} ({})", backend.id, backend.url);
    Ok(())
}

async fn show_status(config: &Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    let control = ControlPlane::new(pool, config.clone());

    let stats = control.stats().await?;
    println!("files:            {}", stats.total_files);
    println!("chunks:           {}", stats.total_chunks);
    println!(
        "backends:         {} online / {} total",
        stats.online_backends, stats.total_backends
    );
    println!("stored bytes:     {}", stats.total_stored_bytes);

    println!();
    for backend in control.list_backends().await? {
        println!(
            "  {} {} status={:?} load={} usage={:.1}%",
            backend.id,
            backend.url,
            backend.status,
            backend.load,
            backend.capacity_used_percent()
        );
    }

    Ok(())
}

/// Builds a `BackendHandle` per registered backend, connecting an
/// `S3BackendClient` to each one's endpoint URL.
async fn build_handles(config: &Config, pool: &db::DbPool) -> anyhow::Result<Vec<BackendHandle>> {
    let backends = db::backends::list_backends(pool).await?;
    let mut handles = Vec::with_capacity(backends.len());

    for backend in backends {
        let client = S3BackendClient::new(&backend.url, &backend.url).await?;
        handles.push(BackendHandle {
            backend,
            client: Arc::new(client),
        });
    }

    let _ = &config.primary_bucket;
    Ok(handles)
}

async fn health_sweep(config: &Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    let handles = build_handles(config, &pool).await?;
    let control = ControlPlane::new(pool, config.clone());

    let outcomes = control.health_sweep(&handles).await?;
    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    Ok(())
}

async fn metrics_sweep(config: &Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    let handles = build_handles(config, &pool).await?;
    let control = ControlPlane::new(pool, config.clone());

    control.metrics_sweep(&handles).await?;
    println!("metrics sweep complete for {} backends", handles.len());
    Ok(())
}

async fn reconcile(config: &Config, balance_load: bool, dry_run: bool) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    let handles = build_handles(config, &pool).await?;
    let control = ControlPlane::new(pool, config.clone());

    let report = control.reconcile(&handles, balance_load, dry_run).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn mark_offline(config: &Config, backend_id: Uuid) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    let control = ControlPlane::new(pool, config.clone());

    let backend = control.mark_offline(backend_id).await?;
    println!("backend {} marked offline", backend.id);
    Ok(())
}

async fn mark_online(config: &Config, backend_id: Uuid) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    let handles = build_handles(config, &pool).await?;
    let control = ControlPlane::new(pool, config.clone());

    let Some(handle) = handles.into_iter().find(|h| h.backend.id == backend_id) else {
        anyhow::bail!("unknown backend {backend_id}");
    };

    let backend = control.mark_online(&handle).await?;
    println!("backend {} marked online", backend.id);
    Ok(())
}
