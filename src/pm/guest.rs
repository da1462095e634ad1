//! The guest agent: one per app process (the CLI joins as the pseudo-app
//! `:cli`). Joins the host roster with a handshake, answers control
//! commands, and reconnects with a 1-second backoff when the host goes
//! away — a restarted host re-adopts surviving guests this way.

use crate::config::App;
use crate::error::{Error, Result};
use crate::pm::rendezvous;
use crate::pm::stats::ResourceUsage;
use crate::pm::wire::{self, Cmd, ControlMessage, Frame, StatEntry};
use crate::pm::CLI_APP;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GuestState {
    Disconnected = 0,
    Connected = 1,
    Closed = 2,
}

/// Invoked when the host tells this app to stop. The handler is expected
/// to run the shutdown sequence and answer with `reply{msgId, fin}` once
/// the process has actually stopped (see `Runtime`).
pub type StopHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Optional override for `reload`. Without one the guest politely declines.
pub type ReloadHandler = Arc<dyn Fn(String) + Send + Sync>;

struct GuestInner {
    app_name: String,
    app_url: String,
    config_path: PathBuf,
    state: AtomicU8,
    on_stop: StopHandler,
    on_reload: Mutex<Option<ReloadHandler>>,
    writer: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    /// Waiter channel for `reply`/`online`/`goodbye` traffic (CLI use).
    reply_tx: Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>,
    handshake_tx: Mutex<Option<oneshot::Sender<()>>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Guest {
    inner: Arc<GuestInner>,
}

impl Guest {
    pub fn new(app: &App, config_path: &Path, on_stop: StopHandler) -> Guest {
        Guest {
            inner: Arc::new(GuestInner {
                app_name: app.name.clone(),
                app_url: app.url.clone(),
                config_path: config_path.to_path_buf(),
                state: AtomicU8::new(GuestState::Disconnected as u8),
                on_stop,
                on_reload: Mutex::new(None),
                writer: Mutex::new(None),
                reply_tx: Mutex::new(None),
                handshake_tx: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub fn app_url(&self) -> &str {
        &self.inner.app_url
    }

    pub fn state(&self) -> GuestState {
        match self.inner.state.load(Ordering::SeqCst) {
            1 => GuestState::Connected,
            2 => GuestState::Closed,
            _ => GuestState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == GuestState::Connected
    }

    fn set_state(&self, state: GuestState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    /// Install an override for `reload`. Services that can actually reload
    /// call this before `join`; the default is a decline reply.
    pub fn set_reload_handler(&self, handler: ReloadHandler) {
        *self.inner.on_reload.lock() = Some(handler);
    }

    /// Attach a waiter channel; `reply`, `online` and `goodbye` messages
    /// are forwarded to it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ControlMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.reply_tx.lock() = Some(tx);
        rx
    }

    /// Join the host roster. A failed first attempt moves to a background
    /// reconnect loop ticking every second.
    pub async fn join(&self) {
        if self.connect().await.is_err() {
            let guest = self.clone();
            tokio::spawn(async move {
                guest.reconnect().await;
            });
        }
    }

    /// One connect attempt: dial, handshake, block until the host answers,
    /// then leave the reader loop running.
    pub async fn connect(&self) -> Result<()> {
        let sock_file = rendezvous::socket_file(&self.inner.config_path);

        if !rendezvous::is_host_online(&self.inner.config_path).await {
            return Err(Error::HostOffline);
        }

        let conn = match rendezvous::dial_timeout(&sock_file, Duration::from_secs(1)).await {
            Ok(conn) => conn,
            Err(e) => {
                // The socket file was left by an unclean shutdown; remove it
                // so the name can be bound again.
                let _ = std::fs::remove_file(&sock_file);
                return Err(Error::Transport(e.to_string()));
            }
        };

        let (mut read_half, mut write_half) = tokio::io::split(conn);
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                match frame {
                    Frame::Bytes(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Frame::Close => {
                        let _ = write_half.shutdown().await;
                        break;
                    }
                }
            }
        });

        let (handshake_tx, handshake_rx) = oneshot::channel();
        *self.inner.handshake_tx.lock() = Some(handshake_tx);
        *self.inner.writer.lock() = Some(writer_tx.clone());

        let hello = ControlMessage {
            cmd: Cmd::Handshake,
            app: self.inner.app_name.clone(),
            pid: std::process::id(),
            ..ControlMessage::default()
        };

        writer_tx
            .send(Frame::message(&hello))
            .map_err(|_| Error::Transport("connection closed before handshake".to_string()))?;

        let guest = self.clone();
        tokio::spawn(async move {
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 1024];

            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) => {
                        for msg in wire::decode_messages(&mut buffer, &[], true) {
                            guest.handle_message(msg);
                        }
                        guest.handle_host_disconnection();
                        break;
                    }
                    Ok(n) => {
                        for msg in wire::decode_messages(&mut buffer, &chunk[..n], false) {
                            guest.handle_message(msg);
                        }
                    }
                    Err(_) => {
                        guest.handle_host_disconnection();
                        break;
                    }
                }
            }
        });

        // Block until the host acknowledges the handshake.
        let _ = handshake_rx.await;

        if !self.inner.app_name.is_empty() && self.inner.app_name != CLI_APP {
            tracing::info!(app = %self.inner.app_name, "app has joined the group");
        }

        Ok(())
    }

    /// Leave the roster. With a `reply_id` the goodbye and the final reply
    /// are coalesced into one write so the host parses them together and
    /// the originator is guaranteed to see the acknowledgment.
    pub fn leave(&self, reason: &str, reply_id: &str) -> bool {
        let writer = self.inner.writer.lock().clone();

        if let Some(writer) = writer {
            if !reply_id.is_empty() {
                let frames = wire::encode_batch(&[
                    ControlMessage {
                        cmd: Cmd::Goodbye,
                        app: self.inner.app_name.clone(),
                        ..ControlMessage::default()
                    },
                    ControlMessage {
                        cmd: Cmd::Reply,
                        app: self.inner.app_name.clone(),
                        msg_id: reply_id.to_string(),
                        text: reason.to_string(),
                        fin: true,
                        ..ControlMessage::default()
                    },
                ]);
                let _ = writer.send(Frame::Bytes(frames));
            } else {
                let _ = writer.send(Frame::message(&ControlMessage {
                    cmd: Cmd::Goodbye,
                    app: self.inner.app_name.clone(),
                    fin: true,
                    ..ControlMessage::default()
                }));
            }
        }

        let was_connected = self.state() == GuestState::Connected;
        self.set_state(GuestState::Closed);
        self.inner.cancel.cancel();
        was_connected
    }

    /// Send messages to the host over the established connection.
    pub fn send(&self, msgs: &[ControlMessage]) -> Result<()> {
        let writer = self.inner.writer.lock().clone();

        match writer {
            Some(writer) => writer
                .send(Frame::Bytes(wire::encode_batch(msgs)))
                .map_err(|_| Error::Transport("connection closed".to_string())),
            None => Err(Error::Transport("not connected".to_string())),
        }
    }

    async fn reconnect(&self) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {
                    match self.state() {
                        GuestState::Closed | GuestState::Connected => break,
                        GuestState::Disconnected => {
                            if self.connect().await.is_ok() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// EOF or error on the host connection. A crashed host comes back and
    /// re-adopts surviving guests, so anything not deliberately closed goes
    /// back to the reconnect loop.
    fn handle_host_disconnection(&self) {
        match self.state() {
            GuestState::Disconnected => {}
            GuestState::Closed => {}
            GuestState::Connected => {
                self.set_state(GuestState::Disconnected);
                *self.inner.writer.lock() = None;

                let guest = self.clone();
                tokio::spawn(async move {
                    guest.reconnect().await;
                });
            }
        }
    }

    fn handle_message(&self, msg: ControlMessage) {
        match msg.cmd {
            Cmd::Handshake => {
                self.set_state(GuestState::Connected);

                if let Some(tx) = self.inner.handshake_tx.lock().take() {
                    let _ = tx.send(());
                }
            }
            Cmd::Goodbye => {
                // The host is leaving; close our side and tell any waiter.
                if let Some(writer) = self.inner.writer.lock().take() {
                    let _ = writer.send(Frame::Close);
                }

                self.forward_to_waiter(msg);
            }
            Cmd::Stop => {
                (self.inner.on_stop)(msg.msg_id);
            }
            Cmd::Reload => {
                let handler = self.inner.on_reload.lock().clone();

                match handler {
                    Some(handler) => handler(msg.msg_id),
                    None => {
                        let _ = self.send(&[ControlMessage {
                            cmd: Cmd::Reply,
                            msg_id: msg.msg_id,
                            text: format!(
                                "app [{}] does not support hot-reloading",
                                self.inner.app_name
                            ),
                            ..ControlMessage::default()
                        }]);
                    }
                }
            }
            Cmd::Stat => {
                let guest = self.clone();
                tokio::spawn(async move {
                    let usage = ResourceUsage::query_self().await;
                    let _ = guest.send(&[ControlMessage {
                        cmd: Cmd::Reply,
                        msg_id: msg.msg_id,
                        stats: Some(vec![StatEntry {
                            app: guest.inner.app_name.clone(),
                            pid: std::process::id(),
                            memory: usage.memory_rss_bytes,
                            cpu: usage.cpu_percent,
                        }]),
                        ..ControlMessage::default()
                    }]);
                });
            }
            Cmd::Reply | Cmd::Online => {
                self.forward_to_waiter(msg);
            }
            _ => {}
        }
    }

    fn forward_to_waiter(&self, msg: ControlMessage) {
        let tx = self.inner.reply_tx.lock().clone();

        if let Some(tx) = tx {
            let _ = tx.send(msg);
        }
    }
}
