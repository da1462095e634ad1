use rpcfleet::output::CliOutput;
use rpcfleet::{Config, ControlClient};
use std::path::Path;

/// `rpcfleet start [app]`: ensure the daemon is up, spawn one or all
/// served apps, and wait for each to report online.
pub async fn run_start(config: &Config, config_path: &Path, app: Option<&str>) -> anyhow::Result<()> {
    super::ensure_host_running(config_path).await?;

    let mut client = ControlClient::connect(config.clone(), config_path).await?;
    client.start_apps(app, &CliOutput).await?;
    client.leave().await;

    Ok(())
}
