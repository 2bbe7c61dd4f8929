//! Configuration loading, validation, env substitution, and the shared
//! reloadable handle.
//!
//! Config files: `warden.toml`, `warden.yaml`, `warden.yml` or `warden.json`,
//! searched in `./` then the user config directory (`~/.config/warden/`).
//!
//! Supports `${ENV_VAR}` substitution anywhere in the file.

pub mod env_subst;
pub mod error;
pub mod handle;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    handle::ConfigHandle,
    loader::{config_dir, data_dir, default_store_path, discover_and_load, load_config},
    schema::{
        ClientConfig, ClientEntry, ClientOptions, ExtensionSpec, LoggingConfig, WardenConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
