//! One template resource: the fetch / render / stage / apply pipeline.
//!
//! `process` runs the full cycle for a single destination file:
//!
//!   1. determine the target file mode
//!   2. fetch backend values into the resource's store
//!   3. render the template into a staged temp file next to the destination
//!   4. compare staged content and mode against the destination
//!   5. if changed: check command, atomic rename, reload command
//!
//! The pipeline stops at the first failure; later stages never run on a
//! failed earlier stage. A reload failure is the one exception to "failure
//! means nothing happened": the destination has already been replaced and
//! stays replaced.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use confsync_backends::StoreClient;
use confsync_core::{ResourceDecl, Settings};
use confsync_store::Store;

use crate::command::run_command;
use crate::context::{render_command, RenderContext, SharedStore};
use crate::error::{io_err, ResourceError};
use crate::secrets::Decrypt;

/// Default mode for a destination that does not exist yet and declares none.
const DEFAULT_FILE_MODE: u32 = 0o644;

// ---------------------------------------------------------------------------
// TemplateResource
// ---------------------------------------------------------------------------

/// A declaration bound to a backend client and ready to process.
pub struct TemplateResource {
    decl: ResourceDecl,
    /// Absolute path of the source template.
    src: PathBuf,
    /// Key prefix after applying the process-wide override.
    prefix: String,
    /// Fully prefixed keys sent to the backend.
    keys: Vec<String>,
    /// Target mode bits, resolved per cycle.
    file_mode: u32,
    /// Wait index carried between watch cycles; 0 until the first watch.
    last_index: u64,
    store: SharedStore,
    context: RenderContext,
    client: Arc<dyn StoreClient>,
    noop: bool,
    sync_only: bool,
    keep_stage_file: bool,
}

impl TemplateResource {
    /// Bind a loaded declaration to the runtime configuration.
    pub fn new(
        decl: ResourceDecl,
        settings: &Settings,
        client: Arc<dyn StoreClient>,
        decrypter: Option<Arc<dyn Decrypt>>,
    ) -> Result<Self, ResourceError> {
        let src = settings.template_dir().join(&decl.src);
        let src = std::path::absolute(&src).map_err(|e| io_err(&src, e))?;

        let global = settings.prefix.as_deref();
        let prefix = decl.effective_prefix(global);
        let keys = decl.prefixed_keys(global);

        let store: SharedStore = Arc::new(RwLock::new(Store::new()));
        let context = RenderContext::new(store.clone(), decrypter);

        Ok(TemplateResource {
            decl,
            src,
            prefix,
            keys,
            file_mode: DEFAULT_FILE_MODE,
            last_index: 0,
            store,
            context,
            client,
            noop: settings.noop,
            sync_only: settings.sync_only,
            keep_stage_file: settings.keep_stage_file,
        })
    }

    /// The prefix this resource watches under.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The fully prefixed keys this resource subscribes to.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn set_last_index(&mut self, index: u64) {
        self.last_index = index;
    }

    /// Destination path, for logging and error reporting.
    pub fn dest(&self) -> &Path {
        &self.decl.dest
    }

    /// Block until a subscribed key changes past the stored index, then
    /// remember the new index. First call returns immediately.
    pub async fn wait_for_change(&mut self) -> Result<(), ResourceError> {
        let index = self
            .client
            .watch_prefix(&self.prefix, &self.keys, self.last_index)
            .await?;
        self.last_index = index;
        Ok(())
    }

    /// Run one full pipeline cycle.
    pub async fn process(&mut self) -> Result<(), ResourceError> {
        self.set_file_mode()?;
        self.fetch_values().await?;
        let staged = self.create_stage_file()?;
        let result = self.sync(&staged).await;
        self.cleanup_stage(&staged);
        result
    }

    // -- stage 1: file mode --------------------------------------------------

    /// Declared mode wins; otherwise inherit the destination's current
    /// permission bits; otherwise fall back to 0644.
    fn set_file_mode(&mut self) -> Result<(), ResourceError> {
        if let Some(mode) = self.decl.parse_mode()? {
            self.file_mode = mode;
            return Ok(());
        }
        self.file_mode = match fs::metadata(&self.decl.dest) {
            #[cfg(unix)]
            Ok(meta) => {
                use std::os::unix::fs::PermissionsExt;
                meta.permissions().mode() & 0o7777
            }
            #[cfg(not(unix))]
            Ok(_) => DEFAULT_FILE_MODE,
            Err(_) => DEFAULT_FILE_MODE,
        };
        Ok(())
    }

    // -- stage 2: fetch ------------------------------------------------------

    /// Purge the store and repopulate it from the backend. Keys come back
    /// re-rooted under `/` with the prefix stripped, so templates address
    /// them the same way regardless of deployment prefix.
    async fn fetch_values(&mut self) -> Result<(), ResourceError> {
        let values = self.client.get_values(&self.keys).await?;
        debug!(
            dest = %self.decl.dest.display(),
            fetched = values.len(),
            "fetched backend values"
        );

        let mut store = self.store.write().expect("store lock poisoned");
        store.purge();
        for (key, value) in values {
            store.set(strip_prefix(&key, &self.prefix), value);
        }
        Ok(())
    }

    // -- stage 3: render and stage -------------------------------------------

    /// Render the template into a temp file in the destination's directory,
    /// with target mode and ownership already applied. The temp file is
    /// removed automatically if any step before `keep` fails.
    fn create_stage_file(&mut self) -> Result<PathBuf, ResourceError> {
        let body = fs::read_to_string(&self.src).map_err(|e| io_err(&self.src, e))?;

        let name = self.src.display().to_string();
        self.context
            .add_template(&name, &body)
            .map_err(|e| ResourceError::Template {
                name: name.clone(),
                source: e,
            })?;
        let rendered = self
            .context
            .render(&name)
            .map_err(|e| ResourceError::Template { name, source: e })?;

        let dest_dir = self
            .decl
            .dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let dest_name = self
            .decl
            .dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("stage");

        // Staged in the destination directory so the final rename cannot
        // cross a filesystem boundary in the common case.
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{dest_name}"))
            .tempfile_in(dest_dir)
            .map_err(|e| io_err(dest_dir, e))?;
        tmp.write_all(rendered.as_bytes())
            .map_err(|e| io_err(tmp.path(), e))?;

        self.apply_attributes(tmp.path())?;

        let path = tmp.path().to_path_buf();
        tmp.keep().map_err(|e| io_err(&path, e.error))?;
        Ok(path)
    }

    /// Set mode bits and, when declared, ownership on the staged file.
    fn apply_attributes(&self, path: &Path) -> Result<(), ResourceError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(self.file_mode))
                .map_err(|e| io_err(path, e))?;
            if self.decl.uid.is_some() || self.decl.gid.is_some() {
                std::os::unix::fs::chown(path, self.decl.uid, self.decl.gid)
                    .map_err(|e| io_err(path, e))?;
            }
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }

    // -- stage 4/5: compare and apply ----------------------------------------

    async fn sync(&self, staged: &Path) -> Result<(), ResourceError> {
        if !self.is_changed(staged)? {
            debug!(dest = %self.decl.dest.display(), "destination is current");
            return Ok(());
        }

        if self.noop {
            warn!(
                dest = %self.decl.dest.display(),
                "noop mode: destination is stale and will not be modified"
            );
            return Ok(());
        }

        info!(dest = %self.decl.dest.display(), "destination is stale, applying");

        if !self.sync_only {
            self.run_check(staged).await?;
        }
        self.replace(staged)?;
        if !self.sync_only {
            self.run_reload().await?;
        }

        info!(dest = %self.decl.dest.display(), "destination updated");
        Ok(())
    }

    /// Stale when the destination is missing, content digests differ, or the
    /// permission bits differ from the staged file.
    fn is_changed(&self, staged: &Path) -> Result<bool, ResourceError> {
        let dest = &self.decl.dest;
        let dest_meta = match fs::metadata(dest) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(io_err(dest, e)),
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let staged_meta = fs::metadata(staged).map_err(|e| io_err(staged, e))?;
            if dest_meta.permissions().mode() & 0o7777
                != staged_meta.permissions().mode() & 0o7777
            {
                return Ok(true);
            }
        }
        #[cfg(not(unix))]
        let _ = dest_meta;

        Ok(file_digest(staged)? != file_digest(dest)?)
    }

    /// Run the validation command against the staged file.
    async fn run_check(&self, staged: &Path) -> Result<(), ResourceError> {
        let Some(template) = &self.decl.check_cmd else {
            return Ok(());
        };
        let cmd = render_command(template, &[("src", &staged.display().to_string())])
            .map_err(|e| ResourceError::Template {
                name: template.clone(),
                source: e,
            })?;

        let out = run_command(&cmd)
            .await
            .map_err(|e| io_err(PathBuf::from(&cmd), e))?;
        if !out.success() {
            return Err(ResourceError::CheckFailed {
                command: cmd,
                status: out.status_code(),
                output: out.output,
            });
        }
        debug!(command = %cmd, "check passed");
        Ok(())
    }

    /// Atomically move the staged file over the destination. When rename is
    /// refused (busy mount, cross-device), fall back to rewriting the
    /// destination in place with the same content and attributes.
    fn replace(&self, staged: &Path) -> Result<(), ResourceError> {
        let dest = &self.decl.dest;
        match fs::rename(staged, dest) {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ResourceBusy | std::io::ErrorKind::CrossesDevices
                ) =>
            {
                debug!(
                    dest = %dest.display(),
                    reason = %e,
                    "rename refused, rewriting destination in place"
                );
                rewrite_in_place(staged, dest, self.file_mode, self.decl.uid, self.decl.gid)
            }
            Err(e) => Err(ResourceError::Replace {
                dest: dest.clone(),
                source: e,
            }),
        }
    }

    /// Run the reload command. The destination has already been replaced;
    /// a failure here is reported but never reverted.
    async fn run_reload(&self) -> Result<(), ResourceError> {
        let Some(template) = &self.decl.reload_cmd else {
            return Ok(());
        };
        let cmd = render_command(
            template,
            &[("dest", &self.decl.dest.display().to_string())],
        )
        .map_err(|e| ResourceError::Template {
            name: template.clone(),
            source: e,
        })?;

        let out = run_command(&cmd)
            .await
            .map_err(|e| io_err(PathBuf::from(&cmd), e))?;
        if !out.success() {
            return Err(ResourceError::ReloadFailed {
                command: cmd,
                status: out.status_code(),
                output: out.output,
            });
        }
        debug!(command = %cmd, "reload succeeded");
        Ok(())
    }

    /// Remove the staged file unless it was renamed away or retention is on.
    fn cleanup_stage(&self, staged: &Path) {
        if self.keep_stage_file {
            if staged.exists() {
                info!(stage = %staged.display(), "keeping stage file");
            }
            return;
        }
        let _ = fs::remove_file(staged);
    }
}

/// Non-atomic fallback for destinations that refuse rename (busy mount,
/// cross-device): rewrite the destination in place with the staged content
/// and attributes.
fn rewrite_in_place(
    staged: &Path,
    dest: &Path,
    mode: u32,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<(), ResourceError> {
    let contents = fs::read(staged).map_err(|e| io_err(staged, e))?;
    fs::write(dest, contents).map_err(|e| ResourceError::Replace {
        dest: dest.to_path_buf(),
        source: e,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dest, fs::Permissions::from_mode(mode))
            .map_err(|e| io_err(dest, e))?;
        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::chown(dest, uid, gid).map_err(|e| io_err(dest, e))?;
        }
    }
    #[cfg(not(unix))]
    let _ = (mode, uid, gid);
    Ok(())
}

/// Strip the deployment prefix from a backend key, keeping the result rooted.
fn strip_prefix(key: &str, prefix: &str) -> String {
    if prefix == "/" {
        return key.to_string();
    }
    match key.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some(rest) => format!("/{rest}"),
        None => key.to_string(),
    }
}

/// SHA-256 digest of a file's contents, hex-encoded.
fn file_digest(path: &Path) -> Result<String, ResourceError> {
    let contents = fs::read(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
