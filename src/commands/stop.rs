use rpcfleet::output::{CliOutput, UserOutput};
use rpcfleet::pm::control::print_reply;
use rpcfleet::pm::wire::{Cmd, ControlMessage};
use rpcfleet::{Config, ControlClient};
use std::path::Path;

/// `rpcfleet stop [app]`: stop one app, or every app and then the daemon.
pub async fn run_stop(config: &Config, config_path: &Path, app: Option<&str>) -> anyhow::Result<()> {
    let out = CliOutput;

    let mut client = ControlClient::connect(config.clone(), config_path).await?;

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

    if app.is_none() {
        // After all the apps have been stopped, stop the daemon as well.
        client.stop_host(&out).await?;
        out.status("host server shut down");
    } else {
        client.leave().await;
    }

    Ok(())
}
