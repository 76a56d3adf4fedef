//! Layered configuration for Foreman.
//!
//! Defaults are overlaid by `.foreman/config.yaml`, `.foreman/local.yaml` and
//! `FOREMAN_*` environment variables, then checked by [`ConfigLoader::validate`].

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
