//! Resource declarations — one YAML file per managed destination.
//!
//! A declaration lives in `<confdir>/conf.d/` and maps a set of backend keys
//! onto one rendered destination file:
//!
//! ```yaml
//! template:
//!   src: nginx.conf.tmpl
//!   dest: /etc/nginx/nginx.conf
//!   keys:
//!     - db/host
//!     - db/port
//!   prefix: /app
//!   mode: "0644"
//!   check_cmd: "nginx -t -c {{ src }}"
//!   reload_cmd: "systemctl reload nginx"
//! ```
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};

// ---------------------------------------------------------------------------
// ResourceDecl
// ---------------------------------------------------------------------------

/// One template-resource declaration, as parsed from a `conf.d` YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Source template, relative to the template directory until resolved.
    pub src: PathBuf,
    /// Destination file the rendered output is applied to.
    pub dest: PathBuf,
    /// Keys to fetch, relative to the prefix.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Key path prefix; normalised to a leading `/` before use.
    #[serde(default)]
    pub prefix: String,
    /// Octal file mode string, e.g. `"0644"`. Inherited from the destination
    /// when absent.
    #[serde(default)]
    pub mode: Option<String>,
    /// Owning uid applied to the staged file; skipped when absent.
    #[serde(default)]
    pub uid: Option<u32>,
    /// Owning gid applied to the staged file; skipped when absent.
    #[serde(default)]
    pub gid: Option<u32>,
    /// Validation command template, rendered with `src` = staged path.
    #[serde(default)]
    pub check_cmd: Option<String>,
    /// Reload command template, run after a successful replace.
    #[serde(default)]
    pub reload_cmd: Option<String>,
    /// Path of the declaration file itself, recorded at load time.
    #[serde(skip)]
    pub decl_path: PathBuf,
}

/// Top-level shape of a declaration file: everything under a `template:` key.
#[derive(Debug, Deserialize)]
struct DeclFile {
    template: ResourceDecl,
}

impl ResourceDecl {
    /// The prefix this resource queries under, after applying the optional
    /// process-wide override and normalising to a leading `/`.
    pub fn effective_prefix(&self, global: Option<&str>) -> String {
        let raw = global.unwrap_or(self.prefix.as_str());
        normalize_prefix(raw)
    }

    /// The declared keys, joined under `prefix` with exactly one `/` between
    /// segments. These are the keys sent to the backend.
    pub fn prefixed_keys(&self, global: Option<&str>) -> Vec<String> {
        let prefix = self.effective_prefix(global);
        self.keys
            .iter()
            .map(|k| join_key(&prefix, k))
            .collect()
    }

    /// Parse the declared mode string (octal, e.g. `"0644"`).
    pub fn parse_mode(&self) -> Result<Option<u32>, ConfigError> {
        match &self.mode {
            None => Ok(None),
            Some(mode) => {
                let digits = mode.trim_start_matches("0o");
                u32::from_str_radix(digits, 8)
                    .map(Some)
                    .map_err(|_| ConfigError::BadFileMode {
                        path: self.decl_path.clone(),
                        mode: mode.clone(),
                    })
            }
        }
    }
}

/// Normalise a key prefix to begin with `/` and not end with one.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Join a prefix and a relative key with a single `/`.
pub fn join_key(prefix: &str, key: &str) -> String {
    let key = key.trim_start_matches('/');
    if prefix == "/" {
        format!("/{key}")
    } else {
        format!("{prefix}/{key}")
    }
}

// ---------------------------------------------------------------------------
// Declaration loading
// ---------------------------------------------------------------------------

/// Result of enumerating a `conf.d` directory.
///
/// A malformed declaration never prevents the others from loading; it is
/// recorded in `failures` for the caller to report.
#[derive(Debug, Default)]
pub struct LoadedDeclarations {
    pub decls: Vec<ResourceDecl>,
    pub failures: Vec<(PathBuf, ConfigError)>,
}

/// Recursively load every `*.yaml` declaration under `config_dir`.
///
/// A missing directory yields an empty set with a warning, matching the
/// behavior of an agent deployed before its declarations.
pub fn load_declarations(config_dir: &Path) -> Result<LoadedDeclarations, ConfigError> {
    let mut loaded = LoadedDeclarations::default();

    if !config_dir.exists() {
        tracing::warn!(
            dir = %config_dir.display(),
            "declaration directory does not exist; no resources to process"
        );
        return Ok(loaded);
    }

    let mut files = Vec::new();
    collect_yaml_files(config_dir, &mut files)?;
    files.sort();

    if files.is_empty() {
        tracing::warn!(dir = %config_dir.display(), "no declarations found");
    }

    for path in files {
        match load_declaration(&path) {
            Ok(decl) => {
                tracing::debug!(decl = %path.display(), "loaded declaration");
                loaded.decls.push(decl);
            }
            Err(err) => {
                tracing::error!(decl = %path.display(), error = %err, "skipping declaration");
                loaded.failures.push((path, err));
            }
        }
    }

    Ok(loaded)
}

/// Load and validate a single declaration file.
pub fn load_declaration(path: &Path) -> Result<ResourceDecl, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let file: DeclFile = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut decl = file.template;
    decl.decl_path = path.to_path_buf();

    if decl.src.as_os_str().is_empty() {
        return Err(ConfigError::EmptySrc {
            path: path.to_path_buf(),
        });
    }

    // Surface a bad mode string at load time rather than mid-pipeline.
    decl.parse_mode()?;
    Ok(decl)
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let meta = entry.metadata().map_err(|e| io_err(&path, e))?;
        if meta.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if meta.is_file() && has_yaml_extension(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn has_yaml_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
