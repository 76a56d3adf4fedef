//! Infrastructure layer module
//!
//! Process-level concerns that sit outside the domain:
//! - Configuration management (figment layering)
//! - Logging (tracing subscriber setup and log retention)

pub mod config;
pub mod logging;
