//! Argument parsing for the `discovery-mcp-server` binary (`spec.md` §6):
//! `serve` starts the engine, `plugins`/`cmdb` are read-only inspection
//! subcommands against the same on-disk state `serve` would use.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Infrastructure-discovery MCP server.
#[derive(Debug, Parser)]
#[command(name = "discovery-mcp-server", version, about)]
pub struct Cli {
    /// Subcommand to run; defaults to `serve` when omitted.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the MCP engine on the configured transport(s).
    Serve,
    /// Plugin inspection commands.
    Plugins {
        #[command(subcommand)]
        command: PluginsCommand,
    },
    /// CMDB inspection commands.
    Cmdb {
        #[command(subcommand)]
        command: CmdbCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum PluginsCommand {
    /// List installed plugins and whether they pass integrity/policy checks.
    List {
        /// Plugin install directory root; defaults to `$PLUGINS_DIR`.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
pub enum CmdbCommand {
    /// Print row counts for every CMDB table.
    Stats {
        /// CMDB database file; defaults to `$CMDB_PATH`.
        #[arg(long)]
        db: Option<PathBuf>,
        /// CMDB master key file; defaults to `$CMDB_KEY_FILE`.
        #[arg(long)]
        key: Option<PathBuf>,
    },
}
