use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use cairnstore::config::{Config, Rollups};
use cairnstore::health::HealthMetrics;
use cairnstore::index::resolver::PathResolver;
use cairnstore::index::writer::IndexWriter;
use cairnstore::store::{self, schema, timer, StoreChannels, StoreManager};
use cairnstore::{api, listener};

/// Carbon-compatible metrics rollup service.
#[derive(Parser)]
#[command(name = "cairnstore", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
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

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("cairnstore {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the main service run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting cairnstore",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    // Self-metrics first so probes respond during the store bootstrap.
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health.start().await.context("starting health metrics server")?;

    let rollups = Arc::new(Rollups::compile(&cfg).context("compiling rollup definitions")?);

    // Backing store: connect and ensure the schema. Both are fatal.
    let session = Arc::new(store::connect(&cfg.store).await?);
    schema::bootstrap(&session, &cfg.store, &rollups)
        .await
        .context("bootstrapping store schema")?;
    tracing::info!(keyspace = %cfg.store.keyspace, "store schema ready");

    // Path index connection, shared by the resolver and index writer.
    let index_client =
        redis::Client::open(cfg.index.url.as_str()).context("opening index client")?;
    let index_connection = index_client
        .get_multiplexed_tokio_connection()
        .await
        .context("connecting to path index")?;
    tracing::info!(url = %cfg.index.url, "path index ready");

    // Channels tying the components together.
    let (samples_tx, samples_rx) = mpsc::channel(4096);
    let (index_tx, index_rx) = mpsc::channel(1024);
    let (queries_tx, queries_rx) = mpsc::channel(64);
    let (paths_tx, paths_rx) = mpsc::channel(64);
    let (reload_tx, reload_rx) = mpsc::channel::<oneshot::Sender<()>>(1);

    let (set_timeout, timeout_rx) = timer::start(cancel.clone());

    let mut tasks = Vec::new();

    let manager = StoreManager::new(
        &cfg.store,
        Arc::clone(&rollups),
        session,
        Arc::clone(&health),
        StoreChannels {
            samples_rx,
            queries_rx,
            reload_rx,
            index_tx,
        },
        set_timeout,
        timeout_rx,
        cancel.clone(),
    );
    tasks.push(tokio::spawn(manager.run()));

    let resolver = PathResolver::new(
        index_connection.clone(),
        cfg.index.path_key.clone(),
        Arc::clone(&health),
    );
    tasks.push(tokio::spawn(resolver.run(paths_rx, cancel.clone())));

    let index_writer = IndexWriter::new(
        index_connection,
        cfg.index.path_key.clone(),
        Arc::clone(&health),
    );
    tasks.push(tokio::spawn(index_writer.run(index_rx, cancel.clone())));

    tasks.push(
        listener::start_tcp(
            &cfg.listener.tcp,
            samples_tx.clone(),
            Arc::clone(&health),
            cancel.clone(),
        )
        .await?,
    );

    if let Some(udp_addr) = &cfg.listener.udp {
        tasks.push(
            listener::start_udp(udp_addr, samples_tx, Arc::clone(&health), cancel.clone()).await?,
        );
    }

    tasks.push(api::start(&cfg.api, paths_tx, queries_tx, cancel.clone()).await?);

    // Signal handling: SIGINT/SIGTERM terminate, SIGHUP flushes and
    // resets rollup state.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("registering SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, flushing and resetting rollup state");
                let (ack_tx, ack_rx) = oneshot::channel();
                if reload_tx.send(ack_tx).await.is_ok() {
                    let _ = ack_rx.await;
                }
                tracing::info!("reconfiguration complete");
            }
        }
    }

    // Graceful shutdown: the store manager performs its terminating
    // flush before its task completes.
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    health.stop().await?;

    tracing::info!("cairnstore stopped");

    Ok(())
}
