//! Command-line interface.
//!
//! A thin adapter over the services: every command opens the configured
//! database, wires the services through [`bootstrap::Foreman`] and prints
//! either a table or JSON.

pub mod bootstrap;
pub mod commands;
pub mod id_resolver;
pub mod output;

use clap::{Parser, Subcommand};

use commands::deployment::DeploymentArgs;
use commands::ledger::{CallsArgs, MessagesArgs};
use commands::run::{AuditArgs, ListArgs, ResumeArgs, RunIdArgs, StartArgs};

#[derive(Parser, Debug)]
#[command(name = "foreman", version, about = "Resumable multi-agent delivery pipeline")]
pub struct Cli {
    /// Emit JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Load configuration from this file instead of .foreman/
    #[arg(long, global = true, env = "FOREMAN_CONFIG")]
    pub config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a run for a ticket and drive it to completion
    Start(StartArgs),
    /// Continue a run from its last checkpoint
    Resume(ResumeArgs),
    /// List runs
    List(ListArgs),
    /// Show a run with its step log
    Show(RunIdArgs),
    /// Cancel a run
    Cancel(RunIdArgs),
    /// Apply the heartbeat timeout to one run
    Reconcile(RunIdArgs),
    /// Fail every running run whose heartbeat is stale
    Audit(AuditArgs),
    /// List completion calls
    Calls(CallsArgs),
    /// Show the messages of a run's conversations
    Messages(MessagesArgs),
    /// Show the deployment pool and throttling state
    Deployments(DeploymentArgs),
}

/// Print `err` and exit non-zero.
pub fn handle_error(err: anyhow::Error, json: bool) -> ! {
    if json {
        let body = serde_json::json!({
            "error": err.to_string(),
            "chain": err.chain().skip(1).map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err}");
        for cause in err.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
    }
    std::process::exit(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start_with_json() {
        let cli = Cli::try_parse_from(["foreman", "start", "T-1", "--json"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Start(args) => {
                assert_eq!(args.ticket, "T-1");
                assert!(!args.follow);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_follow_on_start_and_resume() {
        let cli = Cli::try_parse_from(["foreman", "start", "T-1", "--follow"]).unwrap();
        match cli.command {
            Commands::Start(args) => assert!(args.follow),
            other => panic!("unexpected command: {other:?}"),
        }
        let cli = Cli::try_parse_from(["foreman", "resume", "abcd", "--follow"]).unwrap();
        match cli.command {
            Commands::Resume(args) => {
                assert_eq!(args.id, "abcd");
                assert!(args.follow);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_calls_filters() {
        let cli = Cli::try_parse_from([
            "foreman", "calls", "--run", "abcd", "--agent", "planner", "--limit", "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Calls(args) => {
                assert_eq!(args.run.as_deref(), Some("abcd"));
                assert_eq!(args.agent.as_deref(), Some("planner"));
                assert_eq!(args.limit, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
