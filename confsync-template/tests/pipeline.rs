//! End-to-end pipeline tests against the in-memory backend, driving real
//! templates, destinations, and check/reload commands on a temp filesystem.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use confsync_backends::{MemClient, StoreClient};
use confsync_core::{Overrides, Settings};
use confsync_template::{load_resources, process_once, ResourceError};

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    _root: TempDir,
    settings: Settings,
    client: Arc<MemClient>,
    dest: PathBuf,
}

impl Fixture {
    /// One declaration (`app.conf`), its template, and a seeded mem backend.
    fn new(template_body: &str, decl_extra: &str) -> Self {
        let root = TempDir::new().unwrap();
        let confdir = root.path().join("confsync");
        fs::create_dir_all(confdir.join("conf.d")).unwrap();
        fs::create_dir_all(confdir.join("templates")).unwrap();
        let dest = root.path().join("out").join("app.conf");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();

        fs::write(confdir.join("templates/app.conf.tmpl"), template_body).unwrap();
        fs::write(
            confdir.join("conf.d/app.yaml"),
            format!(
                "template:\n  src: app.conf.tmpl\n  dest: {}\n  keys:\n    - db/host\n    - db/port\n  prefix: /app\n{}",
                dest.display(),
                decl_extra
            ),
        )
        .unwrap();

        let settings = Settings::build(
            &root.path().join("no-settings.yaml"),
            Overrides {
                confdir: Some(confdir),
                ..Overrides::default()
            },
        )
        .unwrap();

        let client = Arc::new(MemClient::new());
        client.set("/app/db/host", "10.0.0.1");
        client.set("/app/db/port", "5432");

        Fixture {
            _root: root,
            settings,
            client,
            dest,
        }
    }

    fn client(&self) -> Arc<dyn StoreClient> {
        self.client.clone()
    }

    async fn run(&self) -> Result<(), ResourceError> {
        process_once(&self.settings, self.client(), None).await
    }
}

const TEMPLATE: &str =
    "host={{ getv(key=\"/db/host\") }}\nport={{ getv(key=\"/db/port\") }}\n";

fn mtime(path: &Path) -> std::time::SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

#[cfg(unix)]
fn mode_bits(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

// ---------------------------------------------------------------------------
// Apply semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn renders_destination_from_backend_values() {
    let fx = Fixture::new(TEMPLATE, "");
    fx.run().await.unwrap();
    assert_eq!(
        fs::read_to_string(&fx.dest).unwrap(),
        "host=10.0.0.1\nport=5432\n"
    );
}

#[tokio::test]
async fn unchanged_destination_is_left_alone() {
    let fx = Fixture::new(TEMPLATE, "");
    fx.run().await.unwrap();
    let first = mtime(&fx.dest);

    // Same values: the second cycle must not rewrite the file.
    std::thread::sleep(std::time::Duration::from_millis(20));
    fx.run().await.unwrap();
    assert_eq!(mtime(&fx.dest), first);
}

#[tokio::test]
async fn value_change_is_applied_on_next_cycle() {
    let fx = Fixture::new(TEMPLATE, "");
    fx.run().await.unwrap();

    fx.client.set("/app/db/port", "5433");
    fx.run().await.unwrap();
    assert!(fs::read_to_string(&fx.dest).unwrap().contains("port=5433"));
}

#[tokio::test]
#[cfg(unix)]
async fn declared_mode_is_applied() {
    let fx = Fixture::new(TEMPLATE, "  mode: \"0600\"\n");
    fx.run().await.unwrap();
    assert_eq!(mode_bits(&fx.dest), 0o600);
}

#[tokio::test]
#[cfg(unix)]
async fn mode_only_drift_counts_as_changed() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new(TEMPLATE, "  mode: \"0644\"\n");
    fx.run().await.unwrap();

    fs::set_permissions(&fx.dest, fs::Permissions::from_mode(0o600)).unwrap();
    fx.run().await.unwrap();
    assert_eq!(mode_bits(&fx.dest), 0o644);
}

#[tokio::test]
async fn deleted_upstream_key_fails_render() {
    let fx = Fixture::new(TEMPLATE, "");
    fx.run().await.unwrap();

    // The store is purged and repopulated each cycle; the stale value must
    // not survive the upstream delete.
    fx.client.remove("/app/db/port");
    let err = fx.run().await.unwrap_err();
    assert!(matches!(err, ResourceError::Template { .. }));
    // The destination keeps its last good content.
    assert!(fs::read_to_string(&fx.dest).unwrap().contains("port=5432"));
}

#[tokio::test(flavor = "multi_thread")]
async fn dns_lookup_renders_inside_the_runtime() {
    // The resolver must not panic when the render runs on a tokio worker
    // thread; an unresolvable host still renders as an empty list.
    let fx = Fixture::new(
        "ips=[{{ lookup_ip(host=\"definitely-not-a-real-host.invalid\") | join(sep=\",\") }}]\n",
        "",
    );
    fx.run().await.unwrap();
    assert_eq!(fs::read_to_string(&fx.dest).unwrap(), "ips=[]\n");
}

// ---------------------------------------------------------------------------
// noop / sync_only / stage retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn noop_reports_but_never_writes() {
    let mut fx = Fixture::new(TEMPLATE, "");
    fx.settings.noop = true;
    fx.run().await.unwrap();
    assert!(!fx.dest.exists());
}

#[tokio::test]
#[cfg(unix)]
async fn sync_only_skips_check_and_reload() {
    // Both commands would fail loudly if run.
    let mut fx = Fixture::new(TEMPLATE, "  check_cmd: \"false\"\n  reload_cmd: \"false\"\n");
    fx.settings.sync_only = true;
    fx.run().await.unwrap();
    assert!(fx.dest.exists());
}

#[tokio::test]
async fn stage_files_are_removed_by_default() {
    let fx = Fixture::new(TEMPLATE, "");
    fx.run().await.unwrap();
    assert_eq!(stage_files(&fx.dest).len(), 0);
}

#[tokio::test]
async fn keep_stage_file_retains_the_staged_copy() {
    let mut fx = Fixture::new(TEMPLATE, "");
    fx.settings.keep_stage_file = true;
    fx.settings.noop = true; // stage is not renamed away in noop mode
    fx.run().await.unwrap();

    let stages = stage_files(&fx.dest);
    assert_eq!(stages.len(), 1);
    assert_eq!(
        fs::read_to_string(&stages[0]).unwrap(),
        "host=10.0.0.1\nport=5432\n"
    );
}

fn stage_files(dest: &Path) -> Vec<PathBuf> {
    fs::read_dir(dest.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(".app.conf"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Check and reload commands
// ---------------------------------------------------------------------------

#[tokio::test]
#[cfg(unix)]
async fn failed_check_leaves_destination_untouched() {
    let fx = Fixture::new(TEMPLATE, "  check_cmd: \"grep -q bogus {{ src }}\"\n");
    let err = fx.run().await.unwrap_err();
    assert!(matches!(err, ResourceError::CheckFailed { .. }));
    assert!(!fx.dest.exists());
}

#[tokio::test]
#[cfg(unix)]
async fn check_sees_the_staged_file() {
    let fx = Fixture::new(TEMPLATE, "  check_cmd: \"grep -q 10.0.0.1 {{ src }}\"\n");
    fx.run().await.unwrap();
    assert!(fx.dest.exists());
}

#[tokio::test]
#[cfg(unix)]
async fn reload_runs_once_per_applied_change() {
    let root = TempDir::new().unwrap();
    let marker = root.path().join("reloads");
    let fx = Fixture::new(
        TEMPLATE,
        &format!("  reload_cmd: \"echo x >> {}\"\n", marker.display()),
    );

    // Cycle 1: initial apply fires the reload.
    fx.run().await.unwrap();
    // Cycle 2: no change, no reload.
    fx.run().await.unwrap();
    // Cycle 3: port change fires it again.
    fx.client.set("/app/db/port", "6000");
    fx.run().await.unwrap();

    assert_eq!(fs::read_to_string(&marker).unwrap().lines().count(), 2);
}

#[tokio::test]
#[cfg(unix)]
async fn failed_reload_does_not_revert_the_destination() {
    let fx = Fixture::new(TEMPLATE, "  reload_cmd: \"false\"\n");
    let err = fx.run().await.unwrap_err();
    assert!(matches!(err, ResourceError::ReloadFailed { .. }));
    assert!(fs::read_to_string(&fx.dest).unwrap().contains("10.0.0.1"));
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broken_declaration_does_not_block_siblings() {
    let fx = Fixture::new(TEMPLATE, "");
    fs::write(
        fx.settings.config_dir().join("broken.yaml"),
        "template: [not, a, mapping]\n",
    )
    .unwrap();

    // The good resource still applies; the pass reports the failure.
    let result = fx.run().await;
    assert!(result.is_err());
    assert!(fx.dest.exists());
}

#[tokio::test]
async fn load_resources_reports_binding_failures() {
    let fx = Fixture::new(TEMPLATE, "");
    let loaded = load_resources(&fx.settings, fx.client(), None).unwrap();
    assert_eq!(loaded.resources.len(), 1);
    assert!(loaded.failures.is_empty());
    assert_eq!(loaded.resources[0].keys(), ["/app/db/host", "/app/db/port"]);
    assert_eq!(loaded.resources[0].prefix(), "/app");
}

#[tokio::test]
async fn global_prefix_overrides_declared_prefix() {
    let mut fx = Fixture::new(TEMPLATE, "");
    fx.settings.prefix = Some("/prod".to_string());
    fx.client.set("/prod/db/host", "10.9.9.9");
    fx.client.set("/prod/db/port", "7000");

    fx.run().await.unwrap();
    assert_eq!(
        fs::read_to_string(&fx.dest).unwrap(),
        "host=10.9.9.9\nport=7000\n"
    );
}
