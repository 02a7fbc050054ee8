use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use trafficwatch::capture::CaptureBackend;
use trafficwatch::config::{CaptureConfig, ClickHouseConfig, Config, ConfigProvider, YamlFileProvider};
use trafficwatch::error::PipelineError;
use trafficwatch::export::health::HealthMetrics;
use trafficwatch::migrate::{self, ClickHouseMigrator, Migrator};
use trafficwatch::report::{ErrorReporter, TracingReporter};
use trafficwatch::session::CaptureSession;
use trafficwatch::store::clickhouse::build_dsn;
use trafficwatch::store::ClickHouseStore;

/// Network traffic capture agent: flags oversized packets and batches
/// packet metadata into ClickHouse.
#[derive(Parser)]
#[command(name = "trafficwatch", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// List capture devices and their descriptions.
    Devices,
    /// Manage the ClickHouse schema and exit.
    Migrate {
        /// `up` creates the database and applies pending migrations, `down`
        /// rolls back the latest one, `status` prints the current version.
        #[arg(value_enum, default_value_t = MigrateAction::Up)]
        action: MigrateAction,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum MigrateAction {
    Up,
    Down,
    Status,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::Version) => {
            println!("trafficwatch {}", version::full());
            return Ok(());
        }
        Some(Command::Devices) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"))?;
            return list_devices();
        }
        _ => {}
    }

    let config_path = cli
        .config
        .as_ref()
        .context("--config is required (use --help for usage)")?;

    let cfg = match YamlFileProvider::new(config_path).load() {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"))?;
            let err = PipelineError::Configuration(format!("{e:#}"));
            TracingReporter::default().report(&err);
            return Err(err.into());
        }
    };

    init_tracing(cli.log_level.as_deref().unwrap_or(&cfg.log_level))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    if let Some(Command::Migrate { action }) = cli.command {
        return rt.block_on(run_migrations(&cfg.store.clickhouse, action));
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting trafficwatch",
    );

    rt.block_on(run(cfg))
}

fn init_tracing(level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let health =
        Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health
        .start()
        .await
        .context("starting health metrics server")?;

    if cfg.store.clickhouse.migrations.enabled {
        run_migrations(&cfg.store.clickhouse, MigrateAction::Up).await?;
    }

    let store = ClickHouseStore::connect(&cfg.store.clickhouse, Some(Arc::clone(&health)))
        .await
        .context("connecting to ClickHouse")?;

    let reporter = Arc::new(TracingReporter::new(Some(Arc::clone(&health))));
    let backend = capture_backend(&cfg.capture)?;

    let mut session = CaptureSession::new(
        cfg.capture.clone(),
        cfg.batch.clone(),
        backend,
        Arc::new(store),
        reporter,
    )
    .with_health(Arc::clone(&health));

    session
        .start()
        .await
        .context("starting capture session")?;

    let device_lost = session.device_lost();
    let lost = tokio::select! {
        signal = shutdown_signal() => {
            let signal = signal?;
            tracing::info!(signal, "shutting down");
            false
        }
        _ = device_lost.cancelled() => {
            tracing::info!("shutting down after capture device loss");
            true
        }
    };

    // Blocks until the final partial batch has been handed to the store.
    session.stop().await;

    health.stop().await?;

    if lost {
        bail!("capture device failed");
    }

    tracing::info!("trafficwatch stopped");

    Ok(())
}

async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for SIGINT")?;
                Ok("SIGINT")
            }
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        Ok("ctrl-c")
    }
}

async fn run_migrations(cfg: &ClickHouseConfig, action: MigrateAction) -> Result<()> {
    tracing::info!(
        endpoint = %cfg.endpoint,
        database = %cfg.database,
        ?action,
        "running ClickHouse migrations"
    );

    if action == MigrateAction::Up {
        migrate::ensure_database(cfg).await?;
    }

    let pool = clickhouse_rs::Pool::new(build_dsn(cfg, &cfg.database));
    let migrator = ClickHouseMigrator::new(pool, cfg.table.as_str());

    match action {
        MigrateAction::Up => migrator
            .up()
            .await
            .context("applying ClickHouse migrations")?,
        MigrateAction::Down => migrator
            .down()
            .await
            .context("rolling back ClickHouse migration")?,
        MigrateAction::Status => {}
    }

    let (version, dirty) = migrator.status().await?;

    tracing::info!(version, dirty, "ClickHouse schema status");

    Ok(())
}

fn list_devices() -> Result<()> {
    let backend = capture_backend(&CaptureConfig::default())?;
    let devices = backend
        .list_devices()
        .context("listing capture devices")?;

    if devices.is_empty() {
        println!("no capture devices found (insufficient permissions?)");
    }

    for device in devices {
        println!("{}\t{}", device.name, device.description);
    }

    Ok(())
}

#[cfg(feature = "pcap")]
fn capture_backend(cfg: &CaptureConfig) -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(trafficwatch::capture::pcap::PcapBackend::new(cfg)))
}

#[cfg(not(feature = "pcap"))]
fn capture_backend(_cfg: &CaptureConfig) -> Result<Box<dyn CaptureBackend>> {
    bail!("trafficwatch was built without live capture support; rebuild with --features pcap")
}
