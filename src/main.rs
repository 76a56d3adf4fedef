//! Foreman CLI entry point.

use clap::Parser;

use foreman::cli::bootstrap::{load_config, Foreman};
use foreman::cli::commands::{deployment, ledger, run};
use foreman::cli::{handle_error, Cli, Commands};
use foreman::infrastructure::logging::{prune_old_logs, LogConfig, LoggerImpl};

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let log_config = LogConfig::from(&config.logging);
    let _logger = LoggerImpl::init(&log_config)?;
    if let Some(dir) = &log_config.log_dir {
        if let Err(e) = prune_old_logs(dir, log_config.retention_days).await {
            tracing::warn!(error = %e, "log retention cleanup failed");
        }
    }

    let foreman = Foreman::open(config).await?;
    let json = cli.json;
    match cli.command {
        Commands::Start(args) => run::start(args, &foreman, json).await,
        Commands::Resume(args) => run::resume(args, &foreman, json).await,
        Commands::List(args) => run::list(args, &foreman, json).await,
        Commands::Show(args) => run::show(args, &foreman, json).await,
        Commands::Cancel(args) => run::cancel(args, &foreman, json).await,
        Commands::Reconcile(args) => run::reconcile(args, &foreman, json).await,
        Commands::Audit(args) => run::audit(args, &foreman, json).await,
        Commands::Calls(args) => ledger::calls(args, &foreman, json).await,
        Commands::Messages(args) => ledger::messages(args, &foreman, json).await,
        Commands::Deployments(args) => deployment::execute(args, &foreman, json).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;
    if let Err(err) = execute(cli).await {
        handle_error(err, json);
    }
}
