mod cli;
mod daemon;
mod error;
mod store;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use netpoll_config::Config;
use netpoll_core::NodeStore;

use crate::cli::{Cli, Command, ConfigCommand, GlobalOpts, LogFormat, NodesArgs};
use crate::error::CliError;
use crate::store::JsonFileStore;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose, cli.global.log_format);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let filter = match verbosity {
        0 => "info",
        1 => "netpolld=debug,netpoll_core=debug,info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().with_current_span(false).init(),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Run(args) => {
            let config = load(&cli.global)?;
            daemon::run(config, &args).await
        }
        Command::Check => check(&cli.global),
        Command::Nodes(args) => nodes(&cli.global, &args),
        Command::Config(ConfigCommand::Path) => {
            println!("{}", config_file(&cli.global).display());
            Ok(())
        }
        Command::Config(ConfigCommand::Init { force }) => init(&cli.global, force),
    }
}

fn config_file(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(netpoll_config::config_path)
}

fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = config_file(global);
    tracing::debug!(path = %path.display(), "loading configuration");
    Ok(netpoll_config::load_config(Some(&path))?)
}

fn check(global: &GlobalOpts) -> Result<(), CliError> {
    let config = load(global)?;
    let poller = config.poller_config()?;
    let inventory = config.inventory()?;
    println!("configuration OK: {}", config_file(global).display());
    println!(
        "  status every {}s, configuration every {}s, {} workers",
        poller.status_interval.as_secs(),
        poller.configuration_interval.as_secs(),
        poller.workers
    );
    println!("  {} inventory nodes, {} OID type rules", inventory.len(), poller.oid_types.len());
    println!("  state file: {}", config.state_path().display());
    Ok(())
}

fn nodes(global: &GlobalOpts, args: &NodesArgs) -> Result<(), CliError> {
    let path = match &args.state_file {
        Some(path) => path.clone(),
        None => load(global)?.state_path(),
    };
    let store = JsonFileStore::open(&path).map_err(|e| CliError::State {
        path: path.display().to_string(),
        source: Box::new(e),
    })?;
    let records = store.load_nodes()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    for record in &records {
        let mut capabilities: Vec<&str> = record.flags.iter_names().map(|(name, _)| name).collect();
        if capabilities.is_empty() {
            capabilities.push("-");
        }
        println!(
            "{:>6}  {:<24} {:<39} {:<10} {}",
            record.id,
            record.name,
            record.primary_ip.to_string(),
            record.status.to_string(),
            capabilities.join(",")
        );
    }
    Ok(())
}

fn init(global: &GlobalOpts, force: bool) -> Result<(), CliError> {
    let path = config_file(global);
    if path.exists() && !force {
        return Err(CliError::ConfigExists {
            path: path.display().to_string(),
        });
    }
    netpoll_config::save_config(&Config::default(), &path)?;
    println!("wrote {}", path.display());
    Ok(())
}
