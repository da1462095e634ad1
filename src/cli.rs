use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rpcfleet", version)]
#[command(about = "Run a fleet of cooperating RPC services as local processes")]
pub struct Cli {
    /// Config file path (defaults to rpcfleet.json in the current directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scaffold a new project config
    Init {
        /// Template to scaffold from
        #[arg(long, default_value = "default")]
        template: String,

        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },
    /// Start (or stop) the host daemon in standalone mode
    Host {
        /// Stop the daemon instead of starting it
        #[arg(long)]
        stop: bool,
    },
    /// Start an app, or every served app when none is named
    Start {
        /// App name
        app: Option<String>,
    },
    /// Stop an app, or every app and then the daemon
    Stop {
        /// App name
        app: Option<String>,
    },
    /// Hot-reload an app or all apps (recompiles typed-source entries)
    Reload {
        /// App name
        app: Option<String>,
    },
    /// Restart an app or all apps
    Restart {
        /// App name
        app: Option<String>,
    },
    /// List the fleet: app, url, status, pid, uptime, memory, cpu
    #[command(alias = "ls")]
    List,
    /// Run the host daemon in the foreground (used internally by `host`
    /// and `start`, which daemonize it)
    #[command(hide = true, name = "host-server")]
    HostServer {
        /// Forward commands only; never revive crashed guests
        #[arg(long)]
        standalone: bool,
    },
}
