//! The CLI side of the control plane.
//!
//! Commands talk to the host through an ephemeral guest connection under
//! the pseudo-name `:cli`, which the host excludes from broadcasts and
//! revival. Fan-in is driven entirely by the `fin` flag: a command is
//! complete when the final relayed reply (or the host's goodbye) arrives,
//! never when the transport closes.

use crate::config::{App, Config, TsConfig};
use crate::error::{Error, Result};
use crate::output::UserOutput;
use crate::pm::guest::Guest;
use crate::pm::spawn;
use crate::pm::wire::{Cmd, ControlMessage, GuestInfo};
use crate::pm::CLI_APP;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct ControlClient {
    guest: Guest,
    replies: mpsc::UnboundedReceiver<ControlMessage>,
    config: Config,
    ts_cfg: TsConfig,
}

impl ControlClient {
    /// Connect to the host as `:cli`. Fails when no daemon is listening.
    pub async fn connect(config: Config, config_path: &Path) -> Result<ControlClient> {
        let cli_app = App {
            name: CLI_APP.to_string(),
            ..App::default()
        };

        let guest = Guest::new(&cli_app, config_path, Arc::new(|_| {}));
        let replies = guest.subscribe();
        guest.connect().await?;

        let ts_cfg = load_ts_config(&config);

        Ok(ControlClient {
            guest,
            replies,
            config,
            ts_cfg,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ts_config(&self) -> &TsConfig {
        &self.ts_cfg
    }

    /// Send one command and drain replies until `fin`, handing each reply
    /// to `visit` as it arrives (so multi-app output streams in).
    pub async fn send_and_wait(
        &mut self,
        msg: ControlMessage,
        mut visit: impl FnMut(&ControlMessage),
    ) -> Result<()> {
        self.guest.send(&[msg])?;

        while let Some(reply) = self.replies.recv().await {
            // The host's own goodbye also terminates a wait: it only sends
            // one mid-command when it is shutting down underneath us.
            let done = reply.fin || reply.cmd == Cmd::Goodbye;
            visit(&reply);

            if done {
                return Ok(());
            }
        }

        Err(Error::Transport(
            "connection closed before the final reply".to_string(),
        ))
    }

    /// Fetch the roster.
    pub async fn list(&mut self) -> Result<Vec<GuestInfo>> {
        let mut guests = Vec::new();

        self.send_and_wait(ControlMessage::new(Cmd::List), |reply| {
            if let Some(list) = &reply.guests {
                guests = list.clone();
            }
        })
        .await?;

        Ok(guests)
    }

    /// Spawn one app or every `serve:true` app, compiling typed-source
    /// entries once beforehand, then wait until each spawned app reports
    /// `online` through the host.
    pub async fn start_apps(&mut self, app_name: Option<&str>, out: &dyn UserOutput) -> Result<()> {
        let mut apps: Vec<App> = Vec::new();

        match app_name {
            None => {
                apps.extend(self.config.apps.iter().filter(|a| a.serve).cloned());
            }
            Some(name) => match self.config.find_app(name) {
                None => {
                    out.error(&format!("app [{}] doesn't exist in the config file", name));
                }
                Some(app) if !app.serve => {
                    out.error(&format!("app [{}] is not intended to be served", name));
                }
                Some(app) => apps.push(app.clone()),
            },
        }

        if apps.is_empty() {
            return Ok(());
        }

        // One batch compile per start, shared by every typed-source entry.
        if let Some(ts_app) = apps.iter().find(|a| a.entry.ends_with(".ts")) {
            let (out_dir, _) = spawn::resolve_ts_entry(&ts_app.entry, &self.ts_cfg);
            spawn::compile_ts(&self.ts_cfg, &out_dir).await?;
        }

        let mut num_started = 0usize;

        for app in &apps {
            match spawn::spawn_app(app, &self.ts_cfg).await {
                Ok(_) => num_started += 1,
                Err(e) => {
                    out.error(&format!(
                        "unable to start app [{}] (reason: {})",
                        app.name, e
                    ));
                }
            }
        }

        if num_started == 0 {
            return Ok(());
        }

        let mut reported = 0usize;

        while let Some(msg) = self.replies.recv().await {
            if msg.cmd == Cmd::Online {
                out.status(&format!("app [{}] started (pid: {})", msg.app, msg.pid));
                reported += 1;

                if reported == num_started {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Ask the host to shut itself down.
    pub async fn stop_host(&mut self, out: &dyn UserOutput) -> Result<()> {
        self.send_and_wait(ControlMessage::new(Cmd::StopHost), |reply| {
            print_reply(reply, out);
        })
        .await
    }

    /// Say goodbye and detach, giving the writer a moment to drain the
    /// goodbye before the CLI process exits.
    pub async fn leave(&self) {
        self.guest.leave("", "");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

/// Standard rendering for command replies: errors and progress text are
/// forwarded verbatim (guest-originated strings included).
pub fn print_reply(reply: &ControlMessage, out: &dyn UserOutput) {
    if !reply.error.is_empty() {
        out.error(&reply.error);
    } else if !reply.text.is_empty() {
        out.status(&reply.text);
    }
}

/// The tsconfig referenced by the fleet config, defaulting quietly.
pub fn load_ts_config(config: &Config) -> TsConfig {
    let path = if config.tsconfig.is_empty() {
        PathBuf::from("tsconfig.json")
    } else {
        PathBuf::from(&config.tsconfig)
    };

    TsConfig::load(&path).unwrap_or_default()
}
