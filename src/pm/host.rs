//! The host daemon.
//!
//! One host runs per machine (per config file, strictly) and holds a
//! control connection to every app process. The CLI talks to the same
//! socket under the pseudo-name `:cli`. The host routes `stop`/`reload`/
//! `stat` to one or all guests, correlating replies by `msgId` and marking
//! the last relayed reply with `fin`, snapshots the roster for `list`, and
//! revives guests that drop their connection without saying goodbye.

use crate::config::{App, Config, TsConfig};
use crate::error::{Error, Result};
use crate::pm::rendezvous;
use crate::pm::spawn;
use crate::pm::wire::{self, Cmd, ControlMessage, Frame, GuestInfo};
use crate::pm::CLI_APP;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Grace delay before reviving a crashed guest.
const REVIVE_DELAY: Duration = Duration::from_secs(1);

/// How long `Stop` waits for final goodbyes to flush before the listener
/// goes away.
const GOODBYE_FLUSH: Duration = Duration::from_millis(10);

/// A reply callback, invoked at most once for its `msgId` and removed
/// under the pending-replies lock so a late duplicate cannot race the
/// removal. Callbacks only enqueue a single frame on a writer channel.
type ReplyCallback = Box<dyn FnOnce(ControlMessage) + Send>;

#[derive(Clone)]
struct GuestRecord {
    conn_id: u64,
    app: String,
    pid: u32,
    start_time: i64,
    writer: mpsc::UnboundedSender<Frame>,
}

struct HostInner {
    apps: Vec<App>,
    ts_cfg: TsConfig,
    sock_file: PathBuf,
    /// Standalone hosts only forward commands; they never revive guests.
    standalone: bool,
    running: AtomicBool,
    process_keeper: AtomicBool,
    /// Roster. Read-mostly; all mutations take the write lock. Never held
    /// across an await (parking_lot, per the sync-lock rule).
    clients: RwLock<Vec<GuestRecord>>,
    /// Pending replies: msgId -> callback.
    callbacks: Mutex<HashMap<String, ReplyCallback>>,
    shutdown: CancellationToken,
    next_conn_id: AtomicU64,
}

/// The supervisor daemon. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn new(config: &Config, config_path: &Path, standalone: bool) -> Host {
        let ts_path = if config.tsconfig.is_empty() {
            PathBuf::from("tsconfig.json")
        } else {
            PathBuf::from(&config.tsconfig)
        };

        // Fleets without typed-source entries have no tsconfig; that is fine.
        let ts_cfg = TsConfig::load(&ts_path).unwrap_or_default();

        Host {
            inner: Arc::new(HostInner {
                apps: config.apps.clone(),
                ts_cfg,
                sock_file: rendezvous::socket_file(config_path),
                standalone,
                running: AtomicBool::new(false),
                process_keeper: AtomicBool::new(false),
                clients: RwLock::new(Vec::new()),
                callbacks: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn socket_file(&self) -> &Path {
        &self.inner.sock_file
    }

    /// Bind the rendezvous and start serving. With `wait` the host becomes
    /// the process keeper: it blocks until a termination signal, then runs
    /// [`Host::stop`] and exits.
    pub async fn start(&self, wait: bool) -> Result<()> {
        let sock_file = self.inner.sock_file.clone();

        let listener = match rendezvous::listen(&sock_file).await {
            Ok(listener) => listener,
            Err(first_err) => {
                // A file with nobody behind it is a stale leftover; remove
                // it and retry once.
                if sock_file.exists()
                    && rendezvous::dial_timeout(&sock_file, Duration::from_secs(1))
                        .await
                        .is_err()
                {
                    let _ = std::fs::remove_file(&sock_file);
                    rendezvous::listen(&sock_file)
                        .await
                        .map_err(|e| Error::Bind(e.to_string()))?
                } else {
                    return Err(Error::Bind(first_err.to_string()));
                }
            }
        };

        self.inner.running.store(true, Ordering::SeqCst);
        tracing::info!(socket = %sock_file.display(), "host server started");

        let host = self.clone();
        let token = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let mut listener = listener;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok(conn) => {
                                if !host.is_running() {
                                    break;
                                }
                                let host = host.clone();
                                tokio::spawn(async move {
                                    host.handle_guest_connection(conn).await;
                                });
                            }
                            Err(e) => {
                                if !host.is_running() {
                                    break;
                                }
                                tracing::warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        });

        if wait {
            self.wait_for_exit().await;
        }

        Ok(())
    }

    /// Graceful shutdown: final `goodbye{fin}` to everyone (the `:cli`
    /// client included), a short flush pause, then the listener and the
    /// rendezvous file go away. In process-keeper mode this exits.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        let writers: Vec<mpsc::UnboundedSender<Frame>> = {
            let clients = self.inner.clients.read();
            clients.iter().map(|c| c.writer.clone()).collect()
        };

        if !writers.is_empty() {
            let goodbye = ControlMessage {
                cmd: Cmd::Goodbye,
                fin: true,
                ..ControlMessage::default()
            };

            for writer in &writers {
                let _ = writer.send(Frame::message(&goodbye));
            }

            tokio::time::sleep(GOODBYE_FLUSH).await;
        }

        self.inner.shutdown.cancel();
        let _ = std::fs::remove_file(&self.inner.sock_file);
        tracing::info!("host server shut down");

        if self.inner.process_keeper.load(Ordering::SeqCst) {
            std::process::exit(0);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Block until SIGINT/SIGTERM, then stop. Marks this host as the
    /// process keeper so `stop` ends the process.
    pub async fn wait_for_exit(&self) {
        self.inner.process_keeper.store(true, Ordering::SeqCst);
        wait_for_termination().await;
        self.stop().await;
    }

    async fn handle_guest_connection(&self, conn: rendezvous::Conn) {
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
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

        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];

        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) => {
                    for msg in wire::decode_messages(&mut buffer, &[], true) {
                        self.handle_message(conn_id, &writer_tx, msg);
                    }
                    self.handle_guest_disconnection(conn_id);
                    break;
                }
                Ok(n) => {
                    for msg in wire::decode_messages(&mut buffer, &chunk[..n], false) {
                        self.handle_message(conn_id, &writer_tx, msg);
                    }
                }
                Err(_) => {
                    self.handle_guest_disconnection(conn_id);
                    break;
                }
            }
        }
    }

    fn handle_message(
        &self,
        conn_id: u64,
        writer: &mpsc::UnboundedSender<Frame>,
        msg: ControlMessage,
    ) {
        match msg.cmd {
            Cmd::Handshake => self.handle_handshake(conn_id, writer, msg),
            Cmd::Goodbye => self.handle_goodbye(conn_id, writer, msg),
            Cmd::Reply => self.handle_reply(writer, msg),
            Cmd::Stop | Cmd::Reload | Cmd::Stat => self.dispatch_command(writer, msg),
            Cmd::List => self.handle_list(writer),
            Cmd::StopHost => {
                let host = self.clone();
                tokio::spawn(async move { host.stop().await });
            }
            _ => {
                let _ = writer.send(Frame::message(&ControlMessage::reply_error(
                    "invalid message",
                )));
            }
        }
    }

    /// A guest signing in. Store it for broadcast purposes, acknowledge,
    /// and surface non-`:cli` arrivals to a connected CLI as `online`.
    fn handle_handshake(
        &self,
        conn_id: u64,
        writer: &mpsc::UnboundedSender<Frame>,
        msg: ControlMessage,
    ) {
        {
            let mut clients = self.inner.clients.write();
            clients.push(GuestRecord {
                conn_id,
                app: msg.app.clone(),
                pid: msg.pid,
                start_time: Utc::now().timestamp(),
                writer: writer.clone(),
            });
        }

        let _ = writer.send(Frame::message(&ControlMessage::new(Cmd::Handshake)));

        if !msg.app.is_empty() && msg.app != CLI_APP {
            tracing::info!(app = %msg.app, pid = msg.pid, "guest joined");

            if let Some(cli) = self.find_client(|c| c.app == CLI_APP) {
                let _ = cli.writer.send(Frame::message(&ControlMessage {
                    cmd: Cmd::Online,
                    app: msg.app,
                    pid: msg.pid,
                    ..ControlMessage::default()
                }));
            }
        }
    }

    fn handle_goodbye(
        &self,
        conn_id: u64,
        writer: &mpsc::UnboundedSender<Frame>,
        msg: ControlMessage,
    ) {
        self.remove_client(conn_id);

        if msg.fin {
            let _ = writer.send(Frame::Close);
        }
    }

    /// A guest finished a control command; resolve the correlation token.
    fn handle_reply(&self, writer: &mpsc::UnboundedSender<Frame>, msg: ControlMessage) {
        let fin = msg.fin;

        if !msg.msg_id.is_empty() {
            self.run_callback(msg);
        }

        if fin {
            let _ = writer.send(Frame::Close);
        }
    }

    /// Route `stop`/`reload`/`stat` to the named guest or broadcast to all
    /// non-`:cli` guests. Replies flow back through fresh correlation
    /// tokens; the originator sees `fin` exactly once, on the last relay.
    fn dispatch_command(&self, originator: &mpsc::UnboundedSender<Frame>, msg: ControlMessage) {
        if !msg.app.is_empty() {
            let target = self.find_client(|c| c.app == msg.app && c.app != CLI_APP);

            match target {
                Some(target) => {
                    let msg_id = new_msg_id();
                    let _ = target.writer.send(Frame::message(&ControlMessage {
                        cmd: msg.cmd,
                        msg_id: msg_id.clone(),
                        ..ControlMessage::default()
                    }));

                    let originator = originator.clone();
                    self.set_callback(
                        msg_id,
                        Box::new(move |mut reply: ControlMessage| {
                            reply.fin = true;
                            let _ = originator.send(Frame::message(&reply));
                        }),
                    );
                }
                None => {
                    let _ = originator.send(Frame::message(&ControlMessage::reply_error(
                        format!("app [{}] is not running", msg.app),
                    )));
                }
            }
        } else {
            let targets = self.filter_clients(|c| !c.app.is_empty() && c.app != CLI_APP);

            if targets.is_empty() {
                let _ = originator.send(Frame::message(&ControlMessage::reply_error(
                    "no app is running",
                )));
                return;
            }

            let total = targets.len();
            let answered = Arc::new(Mutex::new(0usize));

            for target in targets {
                let msg_id = new_msg_id();
                let _ = target.writer.send(Frame::message(&ControlMessage {
                    cmd: msg.cmd,
                    msg_id: msg_id.clone(),
                    ..ControlMessage::default()
                }));

                let originator = originator.clone();
                let answered = answered.clone();
                self.set_callback(
                    msg_id,
                    Box::new(move |mut reply: ControlMessage| {
                        let mut count = answered.lock();
                        *count += 1;
                        reply.fin = *count == total;
                        let _ = originator.send(Frame::message(&reply));
                    }),
                );
            }
        }
    }

    fn handle_list(&self, writer: &mpsc::UnboundedSender<Frame>) {
        let guests: Vec<GuestInfo> = {
            let clients = self.inner.clients.read();
            clients
                .iter()
                .filter(|c| !c.app.is_empty() && c.app != CLI_APP)
                .map(|c| GuestInfo {
                    app: c.app.clone(),
                    pid: c.pid,
                    start_time: c.start_time,
                })
                .collect()
        };

        let _ = writer.send(Frame::message(&ControlMessage {
            cmd: Cmd::Reply,
            guests: Some(guests),
            fin: true,
            ..ControlMessage::default()
        }));
    }

    /// A connection went away. If the roster entry is still present there
    /// was no goodbye, which means the guest crashed; revive it unless this
    /// host is a standalone command forwarder.
    fn handle_guest_disconnection(&self, conn_id: u64) {
        let Some(client) = self.remove_client(conn_id) else {
            return;
        };

        if client.app.is_empty()
            || client.app == CLI_APP
            || !self.is_running()
            || self.inner.standalone
        {
            return;
        }

        let Some(app) = self
            .inner
            .apps
            .iter()
            .find(|a| a.name == client.app)
            .cloned()
        else {
            return;
        };

        tracing::warn!(app = %app.name, "guest disconnected without goodbye");

        let host = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REVIVE_DELAY).await;

            if !host.is_running() {
                return;
            }

            // The daemon has no log file of its own; note the revival in
            // the app's log so the operator sees it next to the crash.
            if !app.stdout.is_empty() {
                if let Ok(mut file) = spawn::open_for_append(&app.stdout) {
                    let _ = writeln!(
                        file,
                        "{} app [{}] exited accidentally, reviving...",
                        Utc::now().format("%Y/%m/%d %H:%M:%S"),
                        app.name
                    );
                }
            }

            if let Err(e) = spawn::spawn_app(&app, &host.inner.ts_cfg).await {
                tracing::error!(app = %app.name, error = %e, "failed to revive app");
            }
        });
    }

    fn find_client(&self, test: impl Fn(&GuestRecord) -> bool) -> Option<GuestRecord> {
        let clients = self.inner.clients.read();
        clients.iter().find(|c| test(c)).cloned()
    }

    fn filter_clients(&self, test: impl Fn(&GuestRecord) -> bool) -> Vec<GuestRecord> {
        let clients = self.inner.clients.read();
        clients.iter().filter(|c| test(c)).cloned().collect()
    }

    fn remove_client(&self, conn_id: u64) -> Option<GuestRecord> {
        let mut clients = self.inner.clients.write();
        let index = clients.iter().position(|c| c.conn_id == conn_id)?;
        Some(clients.remove(index))
    }

    fn set_callback(&self, msg_id: String, callback: ReplyCallback) {
        self.inner.callbacks.lock().insert(msg_id, callback);
    }

    /// Invoked under the pending-replies lock so a duplicate reply cannot
    /// race the removal. The callback only enqueues one frame.
    fn run_callback(&self, reply: ControlMessage) {
        let mut callbacks = self.inner.callbacks.lock();

        if let Some(callback) = callbacks.remove(&reply.msg_id) {
            callback(reply);
        }
    }
}

fn new_msg_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
