mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use rpcfleet::Error as FleetError;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(fleet_error) = e.downcast_ref::<FleetError>() {
            eprintln!("Error: {}", fleet_error);
            if let Some(suggestion) = fleet_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(matches!(cli.command, Commands::HostServer { .. }))?;

    // Init needs no config; everything else resolves it first.
    if let Commands::Init { template, force } = &cli.command {
        return commands::run_init(cli.config.clone(), template, *force);
    }

    let parser = rpcfleet::Parser::new();
    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => parser.find_config_file()?,
    };
    let config = parser.load_config(&config_path)?;
    config.validate()?;

    match cli.command {
        Commands::Host { stop } => {
            commands::run_host(&config, &config_path, stop).await?;
        }
        Commands::Start { app } => {
            commands::run_start(&config, &config_path, app.as_deref()).await?;
        }
        Commands::Stop { app } => {
            commands::run_stop(&config, &config_path, app.as_deref()).await?;
        }
        Commands::Reload { app } => {
            commands::run_reload(&config, &config_path, app.as_deref()).await?;
        }
        Commands::Restart { app } => {
            commands::run_restart(&config, &config_path, app.as_deref()).await?;
        }
        Commands::List => {
            commands::run_list(&config, &config_path).await?;
        }
        Commands::HostServer { standalone } => {
            commands::run_host_server(&config, &config_path, standalone).await?;
        }
        Commands::Init { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn init_tracing(is_daemon: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if is_daemon {
        // The daemon's stdout/stderr are already redirected to host.log by
        // the CLI that spawned it; keep timestamps, drop ANSI.
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}
