//! The per-process runtime: one named (or anonymous) app, its server
//! transport when it hosts services, the client registry for everything it
//! consumes, and its membership in the host roster.
//!
//! There can only be one app runtime per process; the constructor refuses
//! a second build. The CLI-visible shutdown sequence runs through
//! [`Runtime::stop`]: client channels close, services get their `stop`
//! hook, the server transport goes down, and the guest says goodbye —
//! carrying the originating `msgId` when the stop came over the control
//! plane, so the operator sees the acknowledgment.

use crate::config::{App, Config, Parser};
use crate::error::{Error, Result};
use crate::pm::guest::Guest;
use crate::registry::{Connectable, Peers, Servable, ServiceRegistry, ServiceSet};
use crate::transport::{Channel, ServerTransport, ServiceRegistrar};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Guards the one-app-per-process invariant.
static APP_ACTIVE: AtomicBool = AtomicBool::new(false);

/// The app name is always argv[1] of a spawned service process.
pub fn app_name_from_args() -> Result<String> {
    std::env::args()
        .nth(1)
        .ok_or_else(|| Error::Config("app name is not provided".to_string()))
}

pub struct RuntimeBuilder {
    services: ServiceSet,
}

impl RuntimeBuilder {
    /// Register a client-only service.
    pub fn register<S: Connectable>(mut self, service: Arc<S>) -> Self {
        self.services.register(service);
        self
    }

    /// Register a service this process may also host.
    pub fn register_servable<S: Connectable + Servable>(mut self, service: Arc<S>) -> Self {
        self.services.register_servable(service);
        self
    }

    /// Load the config from disk and start.
    pub async fn start(self, app_name: &str) -> Result<Arc<Runtime>> {
        let parser = Parser::new();
        let config_path = parser.find_config_file()?;
        let config = parser.load_config(&config_path)?;
        self.start_with_config(app_name, config, &config_path).await
    }

    /// Start with an explicit config (tests, embedded use).
    pub async fn start_with_config(
        self,
        app_name: &str,
        config: Config,
        config_path: &Path,
    ) -> Result<Arc<Runtime>> {
        if APP_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        match Runtime::bring_up(self.services, app_name, config, config_path).await {
            Ok(runtime) => Ok(runtime),
            Err(e) => {
                APP_ACTIVE.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Start a temporary anonymous pure-client runtime for scripting. The
    /// returned handle stops the runtime when `done` is awaited.
    pub async fn for_snippet(self) -> Result<Snippet> {
        let runtime = self.start("").await?;
        Ok(Snippet { runtime })
    }
}

/// Scripting handle from [`RuntimeBuilder::for_snippet`].
pub struct Snippet {
    pub runtime: Arc<Runtime>,
}

impl Snippet {
    pub async fn done(self) {
        self.runtime.stop().await;
    }
}

pub struct Runtime {
    app: Option<App>,
    #[allow(dead_code)]
    config_path: PathBuf,
    services: ServiceSet,
    registry: ServiceRegistry,
    channels: Vec<Channel>,
    served: Vec<Arc<dyn Servable>>,
    server: Mutex<Option<ServerTransport>>,
    guest: Mutex<Option<Guest>>,
    on_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    process_keeper: AtomicBool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("app", &self.app.as_ref().map(|a| &a.name))
            .finish()
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            services: ServiceSet::new(),
        }
    }

    async fn bring_up(
        services: ServiceSet,
        app_name: &str,
        config: Config,
        config_path: &Path,
    ) -> Result<Arc<Runtime>> {
        let app = if app_name.is_empty() {
            None
        } else {
            Some(
                config
                    .find_app(app_name)
                    .ok_or_else(|| Error::AppNotConfigured(app_name.to_string()))?
                    .clone(),
            )
        };

        // Server role first, so the app is dialable by the time it joins
        // the roster and the CLI sees it online.
        let mut served: Vec<Arc<dyn Servable>> = Vec::new();
        let mut server = None;

        if let Some(app) = &app {
            if app.serve && !app.services.is_empty() {
                let mut registrar = ServiceRegistrar::new();

                for service_name in &app.services {
                    let registration = services
                        .get(service_name)
                        .ok_or_else(|| Error::ServiceNotRegistered(service_name.clone()))?;

                    let servable = registration.servable.clone().ok_or_else(|| {
                        Error::Protocol(format!(
                            "service [{}] is not servable",
                            service_name
                        ))
                    })?;

                    servable.serve(&mut registrar)?;
                    served.push(servable);
                }

                // Sibling injection: co-hosted services may grab each other
                // directly and skip the transport for local calls.
                let peers = Peers::new(&services);
                for servable in &served {
                    servable.wire(&peers)?;
                }

                server = Some(ServerTransport::serve(app, registrar).await?);
                tracing::info!(
                    app = %app.name,
                    pid = std::process::id(),
                    "app started"
                );
            }
        }

        let (registry, channels) = ServiceRegistry::build(&config.apps, &services)?;

        let runtime = Arc::new(Runtime {
            app,
            config_path: config_path.to_path_buf(),
            services,
            registry,
            channels,
            served,
            server: Mutex::new(server),
            guest: Mutex::new(None),
            on_stop: Mutex::new(None),
            process_keeper: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        // Named apps join the roster; anonymous runtimes stay off-grid.
        if let Some(app) = runtime.app.clone() {
            let weak: Weak<Runtime> = Arc::downgrade(&runtime);
            let guest = Guest::new(
                &app,
                config_path,
                Arc::new(move |msg_id: String| {
                    if let Some(runtime) = weak.upgrade() {
                        tokio::spawn(async move {
                            runtime.stop_with(&msg_id, true).await;
                        });
                    }
                }),
            );

            guest.join().await;
            *runtime.guest.lock() = Some(guest);
        }

        Ok(runtime)
    }

    pub fn app(&self) -> Option<&App> {
        self.app.as_ref()
    }

    pub fn app_name(&self) -> &str {
        self.app.as_ref().map(|a| a.name.as_str()).unwrap_or("")
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn guest(&self) -> Option<Guest> {
        self.guest.lock().clone()
    }

    /// Resolve a typed client for `service`, steered by `route`. See the
    /// registry for the selection rules.
    pub async fn service_client<S: Connectable>(
        &self,
        service: &S,
        route: &str,
    ) -> Result<S::Client> {
        self.registry.client_for(service, route).await
    }

    /// Register a callback to run after the runtime has stopped.
    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_stop.lock() = Some(Box::new(callback));
    }

    /// Graceful stop, not driven by a control command.
    pub async fn stop(&self) {
        self.stop_with("", true).await;
    }

    /// The shutdown sequence. `reply_id` is non-empty when the stop came
    /// from the control plane and an acknowledgment is owed.
    pub async fn stop_with(&self, reply_id: &str, graceful: bool) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        for channel in &self.channels {
            channel.close();
        }

        // Services get their teardown before the transport disappears
        // underneath them.
        for servable in &self.served {
            servable.stop();
        }

        let server = self.server.lock().take();
        if let Some(server) = server {
            server.stop();
        }

        let callback = self.on_stop.lock().take();
        if let Some(callback) = callback {
            callback();
        }

        APP_ACTIVE.store(false, Ordering::SeqCst);

        let message = match &self.app {
            Some(app) => {
                let message = format!("app [{}] stopped", app.name);
                tracing::info!("{}", message);
                message
            }
            None => "app (anonymous) stopped".to_string(),
        };

        let guest = self.guest.lock().clone();
        if let Some(guest) = guest {
            if graceful && guest.is_connected() {
                guest.leave(&message, reply_id);

                if let Some(app) = &self.app {
                    tracing::info!(app = %app.name, "app has left the group");
                }
            } else {
                // Never joined (or a non-graceful teardown): still close the
                // agent so its reconnect loop stops ticking.
                guest.leave("", "");
            }
        }

        if self.process_keeper.load(Ordering::SeqCst) {
            // Let the guest writer drain the goodbye before the process
            // goes away; exiting immediately would drop the buffered frame.
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::process::exit(0);
        }
    }

    /// Keep the process alive until SIGINT/SIGTERM, then run the shutdown
    /// sequence and exit. Server-role binaries call this from `main`.
    pub async fn wait_for_exit(&self) {
        self.process_keeper.store(true, Ordering::SeqCst);

        wait_for_termination().await;
        self.stop_with("", true).await;
    }

    /// Access the registered service set (sibling lookup outside `wire`).
    pub fn peers(&self) -> Peers<'_> {
        Peers::new(&self.services)
    }
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
