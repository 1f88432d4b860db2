//! Long-running schedulers: interval polling and backend watch.
//!
//! Both schedulers push per-resource failures onto a bounded error channel
//! instead of stopping; the caller decides how to surface them. Shutdown is a
//! broadcast: every task selects against its receiver and exits promptly,
//! dropping any in-flight backend wait.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use confsync_backends::StoreClient;
use confsync_core::Settings;
use confsync_template::{load_resources, Decrypt, ResourceError, TemplateResource};

use crate::error::DaemonError;

/// Capacity of the failure channel. When the drain falls behind, newer
/// failures are dropped with a warning rather than blocking a scheduler.
pub const ERROR_QUEUE_DEPTH: usize = 64;

/// Backoff applied by a watch monitor after a failed cycle, so a persistent
/// error cannot spin the loop.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// One failed processing cycle, attributed to its resource.
#[derive(Debug)]
pub struct ResourceFailure {
    pub dest: PathBuf,
    pub error: ResourceError,
}

/// Create the failure channel shared by a scheduler and its drain.
pub fn error_channel() -> (mpsc::Sender<ResourceFailure>, mpsc::Receiver<ResourceFailure>) {
    mpsc::channel(ERROR_QUEUE_DEPTH)
}

fn report_failure(err_tx: &mpsc::Sender<ResourceFailure>, dest: PathBuf, error: ResourceError) {
    error!(dest = %dest.display(), error = %error, "resource cycle failed");
    if let Err(mpsc::error::TrySendError::Full(dropped)) =
        err_tx.try_send(ResourceFailure { dest, error })
    {
        warn!(dest = %dropped.dest.display(), "error queue full, dropping failure report");
    }
}

// ---------------------------------------------------------------------------
// Interval scheduler
// ---------------------------------------------------------------------------

/// Polls every resource on a fixed interval.
///
/// Declarations are re-enumerated at the top of each tick, so dropping a new
/// file into `conf.d` takes effect on the next cycle without a restart.
pub struct IntervalProcessor {
    settings: Settings,
    client: Arc<dyn StoreClient>,
    decrypter: Option<Arc<dyn Decrypt>>,
    err_tx: mpsc::Sender<ResourceFailure>,
}

impl IntervalProcessor {
    pub fn new(
        settings: Settings,
        client: Arc<dyn StoreClient>,
        decrypter: Option<Arc<dyn Decrypt>>,
        err_tx: mpsc::Sender<ResourceFailure>,
    ) -> Self {
        IntervalProcessor {
            settings,
            client,
            decrypter,
            err_tx,
        }
    }

    /// Run until shutdown. The first pass starts immediately.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
        let interval = Duration::from_secs(self.settings.interval);
        info!(interval_secs = self.settings.interval, "interval scheduler started");

        loop {
            self.run_pass().await;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("interval scheduler stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Process every currently declared resource, sequentially.
    async fn run_pass(&self) {
        let loaded = match load_resources(
            &self.settings,
            self.client.clone(),
            self.decrypter.clone(),
        ) {
            Ok(loaded) => loaded,
            Err(err) => {
                report_failure(&self.err_tx, self.settings.config_dir(), err);
                return;
            }
        };

        for (path, err) in loaded.failures {
            report_failure(&self.err_tx, path, err);
        }
        let mut resources = loaded.resources;
        debug!(resources = resources.len(), "interval pass");
        for resource in &mut resources {
            if let Err(err) = resource.process().await {
                report_failure(&self.err_tx, resource.dest().to_path_buf(), err);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Watch scheduler
// ---------------------------------------------------------------------------

/// Runs one long-poll monitor per resource.
///
/// Each monitor blocks on the backend's watch until a subscribed key changes,
/// then runs one pipeline cycle. The resource set is fixed at startup; new
/// declarations need a restart (or the interval scheduler).
pub struct WatchProcessor {
    settings: Settings,
    client: Arc<dyn StoreClient>,
    decrypter: Option<Arc<dyn Decrypt>>,
    err_tx: mpsc::Sender<ResourceFailure>,
}

impl WatchProcessor {
    pub fn new(
        settings: Settings,
        client: Arc<dyn StoreClient>,
        decrypter: Option<Arc<dyn Decrypt>>,
        err_tx: mpsc::Sender<ResourceFailure>,
    ) -> Self {
        WatchProcessor {
            settings,
            client,
            decrypter,
            err_tx,
        }
    }

    /// Spawn the monitors and run until shutdown.
    pub async fn run(self, shutdown_tx: broadcast::Sender<()>) -> Result<(), DaemonError> {
        let loaded = load_resources(
            &self.settings,
            self.client.clone(),
            self.decrypter.clone(),
        )?;
        for (path, err) in loaded.failures {
            report_failure(&self.err_tx, path, err);
        }

        info!(resources = loaded.resources.len(), "watch scheduler started");

        let mut monitors = JoinSet::new();
        for resource in loaded.resources {
            let err_tx = self.err_tx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            monitors.spawn(monitor(resource, err_tx, shutdown_rx));
        }

        while let Some(joined) = monitors.join_next().await {
            if let Err(err) = joined {
                return Err(DaemonError::Join(err.to_string()));
            }
        }
        info!("watch scheduler stopping");
        Ok(())
    }
}

/// Watch-and-process loop for one resource.
async fn monitor(
    mut resource: TemplateResource,
    err_tx: mpsc::Sender<ResourceFailure>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        // First iteration fires immediately (stored index starts at 0).
        let waited = tokio::select! {
            _ = shutdown_rx.recv() => return,
            waited = resource.wait_for_change() => waited,
        };

        let result = match waited {
            Ok(()) => resource.process().await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            report_failure(&err_tx, resource.dest().to_path_buf(), err);
            // Back off so a persistently failing backend or template does
            // not busy-loop the monitor.
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
            }
        }
    }
}
