//! Clap derive structures for `netpolld`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// netpolld -- node status and configuration polling daemon
#[derive(Debug, Parser)]
#[command(
    name = "netpolld",
    version,
    about = "Poll network nodes for reachability, capabilities and interfaces",
    long_about = "Keeps an inventory of network nodes and polls each one on two\n\
        schedules: a status poll (SNMP and agent reachability, interface\n\
        status) and a configuration poll (capability detection, interface\n\
        and subnet reconciliation).",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "NETPOLL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, env = "NETPOLL_LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load state, provision the inventory and poll until interrupted
    Run(RunArgs),

    /// Validate the configuration and print a summary
    Check,

    /// List nodes recorded in the state file
    Nodes(NodesArgs),

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Keep state in memory only
    #[arg(long)]
    pub ephemeral: bool,

    /// State file (overrides `state_file` from the configuration)
    #[arg(long, env = "NETPOLL_STATE_FILE")]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct NodesArgs {
    /// State file (overrides `state_file` from the configuration)
    #[arg(long, env = "NETPOLL_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Print records as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a configuration file populated with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the configuration file path in use
    Path,
}
