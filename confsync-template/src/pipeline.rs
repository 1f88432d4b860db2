//! Resource enumeration and the one-shot pass.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::error;

use confsync_backends::StoreClient;
use confsync_core::{load_declarations, Settings};

use crate::error::ResourceError;
use crate::resource::TemplateResource;
use crate::secrets::Decrypt;

/// Result of enumerating and binding every declaration in `conf.d`.
///
/// A declaration that fails to load or bind never blocks its siblings; it is
/// recorded in `failures` for reporting.
#[derive(Default)]
pub struct LoadedResources {
    pub resources: Vec<TemplateResource>,
    pub failures: Vec<(PathBuf, ResourceError)>,
}

/// Load every declaration and bind each to the backend client.
pub fn load_resources(
    settings: &Settings,
    client: Arc<dyn StoreClient>,
    decrypter: Option<Arc<dyn Decrypt>>,
) -> Result<LoadedResources, ResourceError> {
    let loaded = load_declarations(&settings.config_dir())?;

    let mut out = LoadedResources::default();
    for (path, err) in loaded.failures {
        out.failures.push((path, err.into()));
    }
    for decl in loaded.decls {
        let decl_path = decl.decl_path.clone();
        match TemplateResource::new(decl, settings, client.clone(), decrypter.clone()) {
            Ok(resource) => out.resources.push(resource),
            Err(err) => out.failures.push((decl_path, err)),
        }
    }
    Ok(out)
}

/// Process every resource once, in declaration order.
///
/// Every resource runs regardless of earlier failures. Each failure is logged
/// against its resource; the last one is returned so a one-shot run can exit
/// non-zero.
pub async fn process_once(
    settings: &Settings,
    client: Arc<dyn StoreClient>,
    decrypter: Option<Arc<dyn Decrypt>>,
) -> Result<(), ResourceError> {
    let mut loaded = load_resources(settings, client, decrypter)?;

    let mut last_err = None;
    for (path, err) in loaded.failures {
        error!(decl = %path.display(), error = %err, "failed to load resource");
        last_err = Some(err);
    }
    for resource in &mut loaded.resources {
        if let Err(err) = resource.process().await {
            error!(dest = %resource.dest().display(), error = %err, "failed to process resource");
            last_err = Some(err);
        }
    }

    match last_err {
        None => Ok(()),
        Some(err) => Err(err),
    }
}
