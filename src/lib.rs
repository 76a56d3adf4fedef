//! Foreman - resumable multi-agent delivery pipeline
//!
//! Foreman drives a ticket through a fixed sequence of agent steps (ticket
//! analysis, codebase indexing, planning, task breakdown, collaboration
//! drain, task execution, final review), checkpointing after every step so a
//! crashed process can resume where it stopped.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and port traits
//! - **Adapters** (`adapters`): SQLite storage, file checkpoints, completion
//!   providers, ticketing and source-control clients
//! - **Service Layer** (`services`): token governance, deployment dispatch,
//!   the conversation ledger, handoff routing, liveness and the workflow engine
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use foreman::cli::bootstrap::{load_config, Foreman};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let foreman = Foreman::open(load_config(None)?).await?;
//!     let engine = foreman.engine();
//!     let run = engine.create_run("PROJ-42").await?;
//!     let run = engine.run(run.id, false).await?;
//!     println!("{}", run.status);
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{DomainError, DomainResult, GovernanceError};
pub use domain::models::{Config, PipelineStep, Run, RunStatus};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::WorkflowEngine;
