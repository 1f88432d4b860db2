//! Confsync core library — settings, resource declarations, errors.
//!
//! Public API surface:
//! - [`settings`] — process-wide [`Settings`], built once at startup
//! - [`types`] — [`ResourceDecl`] and declaration loading
//! - [`error`] — [`ConfigError`]

pub mod error;
pub mod settings;
pub mod types;

pub use error::ConfigError;
pub use settings::{Overrides, Settings};
pub use types::{load_declarations, LoadedDeclarations, ResourceDecl};
