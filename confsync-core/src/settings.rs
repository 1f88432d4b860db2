//! Process-wide settings, constructed once at startup.
//!
//! Sources merge in priority order: built-in defaults < settings file <
//! flags/environment. The merged [`Settings`] value is passed explicitly into
//! every component; nothing reads configuration ambiently.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{io_err, ConfigError};

/// Default backend polling interval, in seconds.
pub const DEFAULT_INTERVAL_SECS: u64 = 600;

/// Fully resolved process-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Backend name (`env`, `mem`).
    pub backend: String,
    /// Backend node addresses, where the backend needs them.
    pub nodes: Vec<String>,
    /// Root configuration directory (`conf.d/` and `templates/` live below it).
    pub confdir: PathBuf,
    /// Polling interval for the interval scheduler, in seconds.
    pub interval: u64,
    /// Process-wide key prefix overriding per-resource prefixes.
    pub prefix: Option<String>,
    /// Use the long-poll watch scheduler instead of interval polling.
    pub watch: bool,
    /// Log pending changes without applying them.
    pub noop: bool,
    /// Skip check and reload commands.
    pub sync_only: bool,
    /// Process all resources once and exit.
    pub onetime: bool,
    /// Keep stage files after each cycle instead of deleting them.
    pub keep_stage_file: bool,
    /// Path to the secret keyring enabling encrypted-value lookups.
    pub secret_keyring: Option<PathBuf>,
    /// Default log verbosity when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Settings {
    /// Directory holding the resource declarations.
    pub fn config_dir(&self) -> PathBuf {
        self.confdir.join("conf.d")
    }

    /// Directory holding the source templates.
    pub fn template_dir(&self) -> PathBuf {
        self.confdir.join("templates")
    }

    /// Build settings from an optional YAML file and flag/env overrides.
    ///
    /// The file is optional: a missing path is skipped with a debug log, the
    /// way a freshly provisioned node runs before any file is dropped in.
    pub fn build(config_file: &Path, overrides: Overrides) -> Result<Self, ConfigError> {
        let file = FileSettings::load(config_file)?;

        Ok(Settings {
            backend: overrides
                .backend
                .or(file.backend)
                .unwrap_or_else(|| "env".to_string()),
            nodes: overrides.nodes.or(file.nodes).unwrap_or_default(),
            confdir: overrides
                .confdir
                .or(file.confdir)
                .unwrap_or_else(|| PathBuf::from("/etc/confsync")),
            interval: overrides
                .interval
                .or(file.interval)
                .unwrap_or(DEFAULT_INTERVAL_SECS),
            prefix: overrides.prefix.or(file.prefix),
            watch: overrides.watch.or(file.watch).unwrap_or(false),
            noop: overrides.noop.or(file.noop).unwrap_or(false),
            sync_only: overrides.sync_only.or(file.sync_only).unwrap_or(false),
            onetime: overrides.onetime.unwrap_or(false),
            keep_stage_file: overrides
                .keep_stage_file
                .or(file.keep_stage_file)
                .unwrap_or(false),
            secret_keyring: overrides.secret_keyring.or(file.secret_keyring),
            log_level: overrides
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Flag/environment overrides; `None` means "not given on the command line".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend: Option<String>,
    pub nodes: Option<Vec<String>>,
    pub confdir: Option<PathBuf>,
    pub interval: Option<u64>,
    pub prefix: Option<String>,
    pub watch: Option<bool>,
    pub noop: Option<bool>,
    pub sync_only: Option<bool>,
    pub onetime: Option<bool>,
    pub keep_stage_file: Option<bool>,
    pub secret_keyring: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Settings-file shape: every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    backend: Option<String>,
    nodes: Option<Vec<String>>,
    confdir: Option<PathBuf>,
    interval: Option<u64>,
    prefix: Option<String>,
    watch: Option<bool>,
    noop: Option<bool>,
    sync_only: Option<bool>,
    keep_stage_file: Option<bool>,
    secret_keyring: Option<PathBuf>,
    log_level: Option<String>,
}

impl FileSettings {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no settings file; using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
