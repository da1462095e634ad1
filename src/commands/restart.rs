use rpcfleet::output::CliOutput;
use rpcfleet::pm::control::print_reply;
use rpcfleet::pm::wire::{Cmd, ControlMessage};
use rpcfleet::{Config, ControlClient};
use std::path::Path;

/// `rpcfleet restart [app]`: stop, then start over the same connection.
pub async fn run_restart(
    config: &Config,
    config_path: &Path,
    app: Option<&str>,
) -> anyhow::Result<()> {
    let out = CliOutput;

    super::ensure_host_running(config_path).await?;

    let mut client = ControlClient::connect(config.clone(), config_path).await?;

    // "no app is running" is fine here; the point is the start that follows.
    client
        .send_and_wait(
            ControlMessage {
                cmd: Cmd::Stop,
                app: app.unwrap_or("").to_string(),
                ..ControlMessage::default()
            },
            |reply| print_reply(reply, &out),
        )
        .await?;

    client.start_apps(app, &out).await?;
    client.leave().await;

    Ok(())
}
