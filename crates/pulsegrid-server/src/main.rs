//! PulseGrid server
//!
//! Serves the realtime gateway (`/ws`), the tenant event API (`/api/*`),
//! operator endpoints (`/admin/*`) and health probes from one process, and
//! carries the database maintenance commands.
//!
//! Usage:
//! ```bash
//! # Start the server (default command)
//! pulsegrid-server --config pulsegrid.yaml
//!
//! # Environment variables override the file
//! PULSEGRID_DATABASE_URL=postgres://localhost/pulsegrid \
//! PULSEGRID_JWT_SECRET=change-me pulsegrid-server
//!
//! # Database maintenance
//! pulsegrid-server init-schema
//! pulsegrid-server migrate --target 20240301000000
//! pulsegrid-server rollback
//! pulsegrid-server migration-status
//! pulsegrid-server create-partitions --days 14
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use pulsegrid_core::cache::SessionCache;
use pulsegrid_observability::{Metrics, PerformanceMonitor, spawn_monitor_task};
use pulsegrid_realtime::{
    BroadcastHub, EventPipeline, MemorySessionCache, RealtimeAuthGate, RedisSessionCache,
    spawn_sweep_task,
};
use pulsegrid_server::config::LoggingConfig;
use pulsegrid_server::{AppState, ServerConfig, ServiceReadiness, Storage, build_router};
use pulsegrid_store_postgres::{
    ConnectionGateway, MigrationManager, PartitionManager, PostgresStore, StoreMetrics,
    initialize_database, spawn_maintenance_task,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// PulseGrid Server - multi-tenant event storage and realtime distribution
#[derive(Parser)]
#[command(name = "pulsegrid-server")]
#[command(about = "PulseGrid storage and realtime gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (YAML or TOML)
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "PULSEGRID_CONFIG",
        global = true
    )]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default)
    Serve,

    /// Apply pending migrations
    Migrate {
        /// Stop after this version
        #[arg(long)]
        target: Option<String>,
    },

    /// Roll back applied migrations (the latest one when no target is given)
    Rollback {
        /// Roll back every migration newer than this version
        #[arg(long)]
        target: Option<String>,
    },

    /// Show applied and pending migrations
    MigrationStatus,

    /// Check migration files against the applied history
    ValidateMigrations,

    /// Create tables, time-series objects and row-level-security policies
    InitSchema,

    /// Pre-create audit partitions
    CreatePartitions {
        /// Days ahead to cover (defaults to partitions.days_ahead)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.merge_env();

    init_tracing(&config.logging)?;
    match &cli.config {
        Some(path) => info!("📁 Loaded configuration from: {}", path),
        None => info!("📁 Using default configuration"),
    }

    match cli.command {
        Some(Commands::Serve) | None => serve(config).await,
        Some(Commands::Migrate { target }) => {
            let migrations = migration_manager(&config).await?;
            let applied = migrations.migrate(target.as_deref()).await?;
            if applied.is_empty() {
                info!("Database is up to date");
            }
            for version in applied {
                info!("✅ Applied {}", version);
            }
            Ok(())
        }
        Some(Commands::Rollback { target }) => {
            let migrations = migration_manager(&config).await?;
            let rolled_back = migrations.rollback(target.as_deref()).await?;
            if rolled_back.is_empty() {
                info!("Nothing to roll back");
            }
            for version in rolled_back {
                info!("↩️  Rolled back {}", version);
            }
            Ok(())
        }
        Some(Commands::MigrationStatus) => {
            let status = migration_manager(&config).await?.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Some(Commands::ValidateMigrations) => {
            let issues = migration_manager(&config)
                .await?
                .validate_migrations()
                .await?;
            if issues.is_empty() {
                info!("✅ Migrations are consistent");
                return Ok(());
            }
            println!("{}", serde_json::to_string_pretty(&issues)?);
            anyhow::bail!("{} migration issue(s) found", issues.len())
        }
        Some(Commands::InitSchema) => {
            let gateway = connect(&config).await?;
            let report = initialize_database(&gateway, config.timeseries_config()).await?;
            info!(
                timescale = report.timescale_enabled,
                hypertable = report.hypertable,
                compression = report.compression,
                retention = report.retention,
                "✅ Schema initialized"
            );
            Ok(())
        }
        Some(Commands::CreatePartitions { days }) => {
            let gateway = connect(&config).await?;
            let partitions =
                PartitionManager::new(gateway.pool().clone(), config.partition_config())?;
            let created = partitions
                .pre_create_partitions(days.unwrap_or(config.partitions.days_ahead))
                .await?;
            info!("✅ Created {} partition(s)", created.len());
            for name in created {
                info!("   - {}", name);
            }
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = match logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::new(format!("{}", log_level));

    // sqlx logs every statement at debug; keep it quiet unless asked
    if !logging.log_sql_queries {
        match "sqlx=warn".parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Failed to set sqlx log filter: {}", e),
        }
    }

    if logging.json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

async fn connect(config: &ServerConfig) -> anyhow::Result<ConnectionGateway> {
    let url = config.database_url()?;
    let gateway = ConnectionGateway::connect(url, config.pool_config())
        .await
        .context("Failed to connect to PostgreSQL")?;
    Ok(gateway)
}

async fn migration_manager(config: &ServerConfig) -> anyhow::Result<MigrationManager> {
    let gateway = connect(config).await?;
    info!(
        "📂 Migrations directory: {}",
        config.migrations.directory.display()
    );
    Ok(MigrationManager::new(
        gateway.pool().clone(),
        &config.migrations.directory,
    ))
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    config.validate()?;

    info!("📊 Initializing observability (metrics, health endpoints)");
    let metrics = Arc::new(Metrics::new()?);
    let store_metrics = StoreMetrics::new()?;

    info!("🗄️  Connecting to PostgreSQL");
    let gateway = connect(&config).await?.with_metrics(store_metrics);
    if config.database.initialize_on_startup {
        let report = initialize_database(&gateway, config.timeseries_config()).await?;
        if !report.timescale_enabled {
            warn!("TimescaleDB is not installed; events are stored in a plain table");
        }
    }

    let storage = Arc::new(Storage::new(gateway.clone(), &config)?);
    if config.migrations.run_on_startup {
        let applied = storage.migrations.migrate(None).await?;
        info!("📂 Applied {} migration(s) on startup", applied.len());
    }
    let store = Arc::new(PostgresStore::new(gateway.clone()));

    let (cache, redis): (Arc<dyn SessionCache>, Option<Arc<RedisSessionCache>>) =
        match &config.redis.url {
            Some(url) => {
                info!("🔑 Session cache: Redis");
                let redis = Arc::new(
                    RedisSessionCache::connect(url)
                        .await
                        .context("Failed to connect to Redis")?
                        .with_counter_ttl(Duration::from_secs(config.auth.session_ttl_secs)),
                );
                (redis.clone(), Some(redis))
            }
            None => {
                warn!("🔑 Session cache: in-process memory (sessions are not shared between instances)");
                (Arc::new(MemorySessionCache::new()), None)
            }
        };

    let gate = Arc::new(
        RealtimeAuthGate::new(config.auth_gate_config(), store.clone(), cache)
            .with_audit_sink(store.clone())
            .with_metrics(metrics.clone()),
    );
    let hub = BroadcastHub::default();
    let pipeline =
        EventPipeline::new(store.clone(), Arc::new(hub.clone())).with_metrics(metrics.clone());

    let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()).with_metrics(metrics.clone()));
    let monitor_task = spawn_monitor_task(monitor.clone());
    let maintenance_task = spawn_maintenance_task(storage.partitions.clone());
    let sweep_task = spawn_sweep_task(gate.clone());

    let readiness = Arc::new(ServiceReadiness::new(Some(gateway.clone()), redis));
    let state = AppState::new(gate, pipeline, hub, monitor, metrics)
        .with_storage(storage)
        .with_readiness_checker(readiness);
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!("");
    info!("✅ PulseGrid listening on http://{}", addr);
    info!("   Realtime:");
    info!("   - WebSocket:          ws://{}/ws", addr);
    info!("   API:");
    info!("   - Events:             http://{}/api/events", addr);
    info!("   - Rollups:            http://{}/api/rollups", addr);
    info!("   Observability:");
    info!("   - Health check:       http://{}/healthz", addr);
    info!("   - Readiness check:    http://{}/readyz", addr);
    info!("   - Prometheus metrics: http://{}/metrics", addr);
    info!("");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    monitor_task.shutdown().await;
    maintenance_task.shutdown().await;
    sweep_task.shutdown().await;
    info!("Background tasks stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
