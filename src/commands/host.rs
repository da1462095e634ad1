use rpcfleet::output::{CliOutput, UserOutput};
use rpcfleet::pm::rendezvous;
use rpcfleet::{Config, ControlClient, Host};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// `rpcfleet host [--stop]`: start or stop the daemon in standalone mode.
pub async fn run_host(config: &Config, config_path: &Path, stop: bool) -> anyhow::Result<()> {
    let out = CliOutput;

    if stop {
        if !rendezvous::is_host_online(config_path).await {
            out.status("host server is not running");
            return Ok(());
        }

        let mut client = ControlClient::connect(config.clone(), config_path).await?;
        client.stop_host(&out).await?;
        out.status("host server shut down");
    } else if rendezvous::is_host_online(config_path).await {
        out.status("host server is already running");
    } else {
        start_host_daemon(config_path, true).await?;
    }

    Ok(())
}

/// The hidden `host-server` subcommand: run the daemon in the foreground
/// as the process keeper.
pub async fn run_host_server(
    config: &Config,
    config_path: &Path,
    standalone: bool,
) -> anyhow::Result<()> {
    let host = Host::new(config, config_path, standalone);
    host.start(true).await?;
    Ok(())
}

/// Daemonize the host: re-invoke this binary as `host-server`, detached,
/// with its output appended to `host.log`.
pub async fn start_host_daemon(config_path: &Path, standalone: bool) -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;

    let log = rpcfleet::pm::spawn::open_for_append("host.log")?;
    let log_err = log.try_clone()?;

    let mut cmd = tokio::process::Command::new(exe);
    cmd.arg("--config")
        .arg(config_path)
        .arg("host-server")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(false);

    if standalone {
        cmd.arg("--standalone");
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or_default();

    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    // Give the daemon a moment to bind before anyone dials it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    CliOutput.status(&format!("host server started (pid: {})", pid));

    Ok(())
}

/// Start the daemon (supervising mode) when it is not already live.
pub(crate) async fn ensure_host_running(config_path: &Path) -> anyhow::Result<()> {
    if !rendezvous::is_host_online(config_path).await {
        start_host_daemon(config_path, false).await?;
    }

    Ok(())
}
