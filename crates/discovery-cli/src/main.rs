//! Binary entry point for the discovery MCP server (`spec.md` §6).

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => commands::serve().await,
        Command::Plugins { command } => commands::plugins_list(command),
        Command::Cmdb { command } => commands::cmdb_stats(command).await,
    }
}
