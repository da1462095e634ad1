use rpcfleet::output::CliOutput;
use rpcfleet::pm::control::{load_ts_config, print_reply};
use rpcfleet::pm::spawn;
use rpcfleet::pm::wire::{Cmd, ControlMessage};
use rpcfleet::{Config, ControlClient};
use std::path::Path;

/// `rpcfleet reload [app]`: recompile typed-source entries, then ask one
/// or all guests to hot-reload. Guests that cannot reload decline politely
/// and keep running.
pub async fn run_reload(
    config: &Config,
    config_path: &Path,
    app: Option<&str>,
) -> anyhow::Result<()> {
    let out = CliOutput;

    // One batch compile before anyone is told to reload.
    let ts_app = match app {
        Some(name) => config
            .find_app(name)
            .filter(|a| a.entry.ends_with(".ts")),
        None => config.apps.iter().find(|a| a.entry.ends_with(".ts")),
    };

    if let Some(ts_app) = ts_app {
        let ts_cfg = load_ts_config(config);
        let (out_dir, _) = spawn::resolve_ts_entry(&ts_app.entry, &ts_cfg);
        spawn::compile_ts(&ts_cfg, &out_dir).await?;
    }

    let mut client = ControlClient::connect(config.clone(), config_path).await?;

    client
        .send_and_wait(
            ControlMessage {
                cmd: Cmd::Reload,
                app: app.unwrap_or("").to_string(),
                ..ControlMessage::default()
            },
            |reply| print_reply(reply, &out),
        )
        .await?;

    client.leave().await;

    Ok(())
}
