//! Template resources: the fetch / render / stage / apply pipeline.
//!
//! Each `conf.d` declaration becomes a [`TemplateResource`] owning a private
//! key/value store and a rendering context. Processing a resource pulls the
//! subscribed keys from the backend, renders the template, and applies the
//! result to the destination atomically, gated by optional check and reload
//! commands.

pub mod command;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod resource;
pub mod secrets;

pub use context::RenderContext;
pub use error::ResourceError;
pub use pipeline::{load_resources, process_once, LoadedResources};
pub use resource::TemplateResource;
pub use secrets::{Decrypt, DecryptError, EnvelopeDecrypter};
