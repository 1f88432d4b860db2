//! confsync — render local configuration files from backend key/value data.
//!
//! # Usage
//!
//! ```text
//! confsync --onetime                       # process everything once and exit
//! confsync --interval 60                   # poll the backend every 60s
//! confsync --watch                         # long-poll the backend for changes
//! confsync --noop --onetime                # report pending changes only
//! confsync --backend env --confdir ./etc   # pick backend and config root
//! ```
//!
//! Flags override the settings file (`--config-file`), which overrides
//! built-in defaults. Most flags can also be set via `CONFSYNC_*`
//! environment variables.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::broadcast;

use confsync_backends::new_client;
use confsync_core::{Overrides, Settings};
use confsync_daemon::{error_channel, IntervalProcessor, WatchProcessor};
use confsync_template::{process_once, Decrypt, EnvelopeDecrypter};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "confsync",
    version,
    about = "Keep local configuration files in sync with a key/value backend",
    long_about = None,
)]
struct Cli {
    /// Settings file (YAML).
    #[arg(long, env = "CONFSYNC_CONFIG_FILE", default_value = "/etc/confsync/confsync.yaml")]
    config_file: PathBuf,

    /// Backend to pull values from (env, mem).
    #[arg(long, env = "CONFSYNC_BACKEND")]
    backend: Option<String>,

    /// Backend node address; repeat for multiple nodes.
    #[arg(long = "node", env = "CONFSYNC_NODE")]
    nodes: Option<Vec<String>>,

    /// Root configuration directory holding conf.d/ and templates/.
    #[arg(long, env = "CONFSYNC_CONFDIR")]
    confdir: Option<PathBuf>,

    /// Backend polling interval, in seconds.
    #[arg(long, env = "CONFSYNC_INTERVAL")]
    interval: Option<u64>,

    /// Key prefix overriding the per-resource prefixes.
    #[arg(long, env = "CONFSYNC_PREFIX")]
    prefix: Option<String>,

    /// Long-poll the backend for changes instead of interval polling.
    #[arg(long)]
    watch: bool,

    /// Report pending changes without modifying any destination.
    #[arg(long)]
    noop: bool,

    /// Apply files without running check or reload commands.
    #[arg(long)]
    sync_only: bool,

    /// Process all resources once and exit.
    #[arg(long)]
    onetime: bool,

    /// Keep staged files after each cycle, for inspection.
    #[arg(long)]
    keep_stage_file: bool,

    /// Secret keyring enabling encrypted-value template functions.
    #[arg(long, env = "CONFSYNC_SECRET_KEYRING")]
    secret_keyring: Option<PathBuf>,

    /// Default log verbosity when RUST_LOG is unset.
    #[arg(long, env = "CONFSYNC_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Flags become overrides; boolean flags only override when set, so the
    /// settings file can still turn them on.
    fn overrides(&self) -> Overrides {
        Overrides {
            backend: self.backend.clone(),
            nodes: self.nodes.clone(),
            confdir: self.confdir.clone(),
            interval: self.interval,
            prefix: self.prefix.clone(),
            watch: self.watch.then_some(true),
            noop: self.noop.then_some(true),
            sync_only: self.sync_only.then_some(true),
            onetime: self.onetime.then_some(true),
            keep_stage_file: self.keep_stage_file.then_some(true),
            secret_keyring: self.secret_keyring.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::build(&cli.config_file, cli.overrides())
        .context("failed to build settings")?;
    init_tracing(&settings.log_level);

    tracing::info!(
        backend = %settings.backend,
        confdir = %settings.confdir.display(),
        "starting confsync"
    );

    let client = new_client(&settings.backend, &settings.nodes)
        .context("failed to construct backend client")?;

    let decrypter: Option<Arc<dyn Decrypt>> = match &settings.secret_keyring {
        Some(path) => {
            let d = EnvelopeDecrypter::from_keyring_file(path)
                .with_context(|| format!("failed to load keyring {}", path.display()))?;
            Some(Arc::new(d))
        }
        None => None,
    };

    if settings.onetime {
        if let Err(err) = process_once(&settings, client, decrypter).await {
            bail!("one or more resources failed: {err}");
        }
        return Ok(());
    }

    run_scheduler(settings, client, decrypter).await
}

/// Run the interval or watch scheduler until ctrl-c.
async fn run_scheduler(
    settings: Settings,
    client: Arc<dyn confsync_backends::StoreClient>,
    decrypter: Option<Arc<dyn Decrypt>>,
) -> Result<()> {
    let (err_tx, mut err_rx) = error_channel();
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler = {
        let settings = settings.clone();
        let shutdown_tx = shutdown_tx.clone();
        if settings.watch {
            let processor = WatchProcessor::new(settings, client, decrypter, err_tx);
            tokio::spawn(async move { processor.run(shutdown_tx).await })
        } else {
            let processor = IntervalProcessor::new(settings, client, decrypter, err_tx);
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move { processor.run(shutdown_rx).await })
        }
    };

    // Drain failure reports until ctrl-c; each is already logged at error
    // level by the scheduler, so the drain only keeps the channel moving.
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("ctrl-c handler failed")?;
                tracing::info!("received ctrl-c, shutting down");
                let _ = shutdown_tx.send(());
                break;
            }
            failure = err_rx.recv() => {
                if failure.is_none() {
                    // Scheduler dropped its sender; it is exiting on its own.
                    break;
                }
            }
        }
    }

    scheduler
        .await
        .context("scheduler task panicked")?
        .context("scheduler failed")?;
    Ok(())
}

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
