//! Scheduler tests against the in-memory backend and a temp filesystem.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use confsync_backends::MemClient;
use confsync_core::{Overrides, Settings};
use confsync_daemon::{error_channel, IntervalProcessor, WatchProcessor};

struct Fixture {
    root: TempDir,
    settings: Settings,
    client: Arc<MemClient>,
    dest: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let confdir = root.path().join("confsync");
        fs::create_dir_all(confdir.join("conf.d")).unwrap();
        fs::create_dir_all(confdir.join("templates")).unwrap();
        let dest = root.path().join("out/app.conf");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();

        fs::write(
            confdir.join("templates/app.conf.tmpl"),
            "port={{ getv(key=\"/db/port\") }}\n",
        )
        .unwrap();
        write_decl(&confdir, "app.yaml", "app.conf.tmpl", &dest);

        let settings = Settings::build(
            &root.path().join("no-settings.yaml"),
            Overrides {
                confdir: Some(confdir),
                interval: Some(1),
                ..Overrides::default()
            },
        )
        .unwrap();

        let client = Arc::new(MemClient::new());
        client.set("/app/db/port", "5432");

        Fixture {
            root,
            settings,
            client,
            dest,
        }
    }
}

fn write_decl(confdir: &Path, name: &str, src: &str, dest: &Path) {
    fs::write(
        confdir.join("conf.d").join(name),
        format!(
            "template:\n  src: {src}\n  dest: {}\n  keys:\n    - db/port\n  prefix: /app\n",
            dest.display()
        ),
    )
    .unwrap();
}

/// Poll until `pred` holds or five seconds pass.
async fn wait_until(mut pred: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition not reached within timeout");
}

fn contains(path: &Path, needle: &str) -> bool {
    fs::read_to_string(path).is_ok_and(|s| s.contains(needle))
}

// ---------------------------------------------------------------------------
// Watch scheduler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn watch_applies_initial_state_and_subsequent_changes() {
    let fx = Fixture::new();
    let (err_tx, _err_rx) = error_channel();
    let (shutdown_tx, _) = broadcast::channel(4);

    let processor = WatchProcessor::new(fx.settings.clone(), fx.client.clone(), None, err_tx);
    let handle = tokio::spawn(processor.run(shutdown_tx.clone()));

    // First watch fires immediately, so the destination appears unprompted.
    wait_until(|| contains(&fx.dest, "port=5432")).await;

    fx.client.set("/app/db/port", "6000");
    wait_until(|| contains(&fx.dest, "port=6000")).await;

    shutdown_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("watch scheduler did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn watch_ignores_unsubscribed_keys() {
    let fx = Fixture::new();
    let (err_tx, _err_rx) = error_channel();
    let (shutdown_tx, _) = broadcast::channel(4);

    let processor = WatchProcessor::new(fx.settings.clone(), fx.client.clone(), None, err_tx);
    let handle = tokio::spawn(processor.run(shutdown_tx.clone()));
    wait_until(|| contains(&fx.dest, "port=5432")).await;

    let before = fs::metadata(&fx.dest).unwrap().modified().unwrap();
    fx.client.set("/other/key", "x");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fs::metadata(&fx.dest).unwrap().modified().unwrap(), before);

    shutdown_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn watch_reports_failures_and_keeps_running() {
    let fx = Fixture::new();
    // Break the template so every cycle fails.
    fs::write(
        fx.settings.template_dir().join("app.conf.tmpl"),
        "{{ getv(key=\"/absent\") }}",
    )
    .unwrap();

    let (err_tx, mut err_rx) = error_channel();
    let (shutdown_tx, _) = broadcast::channel(4);

    let processor = WatchProcessor::new(fx.settings.clone(), fx.client.clone(), None, err_tx);
    let handle = tokio::spawn(processor.run(shutdown_tx.clone()));

    let failure = timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .expect("no failure reported")
        .expect("error channel closed");
    assert_eq!(failure.dest, fx.dest);

    shutdown_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Interval scheduler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interval_polls_and_picks_up_value_changes() {
    let fx = Fixture::new();
    let (err_tx, _err_rx) = error_channel();
    let (shutdown_tx, _) = broadcast::channel(4);

    let processor = IntervalProcessor::new(fx.settings.clone(), fx.client.clone(), None, err_tx);
    let handle = tokio::spawn(processor.run(shutdown_tx.subscribe()));

    wait_until(|| contains(&fx.dest, "port=5432")).await;
    fx.client.set("/app/db/port", "7000");
    wait_until(|| contains(&fx.dest, "port=7000")).await;

    shutdown_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn interval_reenumerates_declarations_each_tick() {
    let fx = Fixture::new();
    let (err_tx, _err_rx) = error_channel();
    let (shutdown_tx, _) = broadcast::channel(4);

    let processor = IntervalProcessor::new(fx.settings.clone(), fx.client.clone(), None, err_tx);
    let handle = tokio::spawn(processor.run(shutdown_tx.subscribe()));
    wait_until(|| fx.dest.exists()).await;

    // A declaration dropped in after startup is processed on a later tick.
    let second = fx.root.path().join("out/second.conf");
    write_decl(&fx.settings.confdir, "second.yaml", "app.conf.tmpl", &second);
    wait_until(|| contains(&second, "port=5432")).await;

    shutdown_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
}
