//! The seam between the fleet runtime and the RPC stack.
//!
//! This module owns everything the runtime needs to know about a peer:
//! scheme and address resolution, transport-credential material, and a
//! lazily-dialed [`Channel`] whose connectivity state the router filters
//! on. What actually flows over an established connection belongs to the
//! RPC stack that services plug in via their `connect`/`serve` hooks.

use crate::config::App;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Rendezvous timeout for outbound dials.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// URL schemes an app may be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Plaintext,
    Tls,
    Xds,
    Http,
    Https,
}

impl Scheme {
    pub fn parse(s: &str) -> Option<Scheme> {
        match s {
            "plaintext" => Some(Scheme::Plaintext),
            "tls" => Some(Scheme::Tls),
            "xds" => Some(Scheme::Xds),
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Plaintext => "plaintext",
            Scheme::Tls => "tls",
            Scheme::Xds => "xds",
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// An `xds:` URL is connect-only; every other scheme can host a server.
    pub fn is_servable(&self) -> bool {
        !matches!(self, Scheme::Xds)
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Tls | Scheme::Https)
    }
}

/// A parsed app URL.
#[derive(Debug, Clone)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
    /// The original URL, kept verbatim for `xds:` targets which are resolved
    /// by an external resolver rather than by host/port.
    pub raw: String,
}

impl Target {
    pub fn parse(url: &str) -> Result<Target> {
        let (scheme_str, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("invalid url '{}': missing scheme", url)))?;

        let scheme = Scheme::parse(scheme_str)
            .ok_or_else(|| Error::Config(format!("unsupported scheme '{}:'", scheme_str)))?;

        // Authority ends at the first path separator.
        let authority = rest.split('/').next().unwrap_or("");

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    Error::Config(format!("invalid port '{}' in url '{}'", port_str, url))
                })?;
                (host.to_string(), Some(port))
            }
            None => (authority.to_string(), None),
        };

        if host.is_empty() && scheme != Scheme::Xds {
            return Err(Error::Config(format!("invalid url '{}': missing host", url)));
        }

        Ok(Target {
            scheme,
            host,
            port,
            raw: url.to_string(),
        })
    }

    /// The dialable address. Secure schemes default to port 443, insecure
    /// ones to port 80. `xds:` targets pass through verbatim for the
    /// external resolver.
    pub fn address(&self) -> String {
        if self.scheme == Scheme::Xds {
            return self.raw.clone();
        }

        let port = self
            .port
            .unwrap_or(if self.scheme.is_secure() { 443 } else { 80 });

        format!("{}:{}", self.host, port)
    }
}

/// Loaded transport-credential material.
///
/// The credentials are validated and carried to the dial site; session
/// establishment on top of them is the RPC stack's concern.
#[derive(Clone)]
pub enum Credentials {
    Insecure,
    Tls(TlsIdentity),
}

#[derive(Clone)]
pub struct TlsIdentity {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    pub ca: Option<Vec<u8>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Insecure => write!(f, "Insecure"),
            Credentials::Tls(_) => write!(f, "Tls(..)"),
        }
    }
}

/// Build credentials for an app. Secure schemes require cert and key; an
/// app with both configured gets TLS credentials even on an insecure
/// scheme, mirroring how private fleets pin self-signed material.
pub fn credentials_for(app: &App, scheme: Scheme) -> Result<Credentials> {
    let load = |path: &str, what: &str| -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|e| {
            Error::Config(format!(
                "unable to read {} '{}' for app [{}]: {}",
                what, path, app.name, e
            ))
        })
    };

    let build_tls = |app: &App| -> Result<Credentials> {
        let ca = if app.ca.is_empty() {
            None
        } else {
            Some(load(&app.ca, "CA")?)
        };

        Ok(Credentials::Tls(TlsIdentity {
            cert: load(&app.cert, "certificate")?,
            key: load(&app.key, "key")?,
            ca,
        }))
    };

    if scheme.is_secure() {
        if app.cert.is_empty() {
            Err(Error::Config(format!(
                "missing 'cert' config for app [{}]",
                app.name
            )))
        } else if app.key.is_empty() {
            Err(Error::Config(format!(
                "missing 'key' config for app [{}]",
                app.name
            )))
        } else {
            build_tls(app)
        }
    } else if !app.cert.is_empty() && !app.key.is_empty() {
        build_tls(app)
    } else {
        Ok(Credentials::Insecure)
    }
}

/// Observable connectivity of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

struct ChannelInner {
    app: String,
    address: String,
    #[allow(dead_code)]
    credentials: Credentials,
    state: Mutex<ChannelState>,
    // Held across the dial await, so this one is a tokio mutex.
    stream: tokio::sync::Mutex<Option<TcpStream>>,
}

/// A lazily-dialed connection handle to one hosting app.
///
/// Channels are cheap to clone and shared between every service the same
/// app hosts. Nothing is dialed until [`Channel::ensure_connected`] runs,
/// so a caller process may start before its callees.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(app: &str, address: String, credentials: Credentials) -> Channel {
        Channel {
            inner: Arc::new(ChannelInner {
                app: app.to_string(),
                address,
                credentials,
                state: Mutex::new(ChannelState::Idle),
                stream: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn app(&self) -> &str {
        &self.inner.app
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    /// Dial if not already connected. Idempotent; serialized per channel.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.state() == ChannelState::Shutdown {
            return Err(Error::Transport(format!(
                "channel to [{}] is shut down",
                self.inner.app
            )));
        }

        let mut stream = self.inner.stream.lock().await;

        if stream.is_some() && self.state() == ChannelState::Ready {
            return Ok(());
        }

        *self.inner.state.lock() = ChannelState::Connecting;

        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.inner.address)).await {
            Ok(Ok(conn)) => {
                *stream = Some(conn);
                *self.inner.state.lock() = ChannelState::Ready;
                Ok(())
            }
            Ok(Err(e)) => {
                *self.inner.state.lock() = ChannelState::TransientFailure;
                Err(Error::Transport(format!(
                    "failed to connect to [{}] at {}: {}",
                    self.inner.app, self.inner.address, e
                )))
            }
            Err(_) => {
                *self.inner.state.lock() = ChannelState::TransientFailure;
                Err(Error::Transport(format!(
                    "timed out connecting to [{}] at {}",
                    self.inner.app, self.inner.address
                )))
            }
        }
    }

    /// Shut the channel down. Shut-down channels are filtered out by the
    /// router and refuse further dials.
    pub fn close(&self) {
        *self.inner.state.lock() = ChannelState::Shutdown;

        if let Ok(mut stream) = self.inner.stream.try_lock() {
            stream.take();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("app", &self.inner.app)
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Collects the service names a server-role process binds at bootstrap.
#[derive(Debug, Default)]
pub struct ServiceRegistrar {
    services: Vec<String>,
}

impl ServiceRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str) -> Result<()> {
        if self.services.iter().any(|s| s == name) {
            return Err(Error::Protocol(format!(
                "service [{}] is already bound to this server",
                name
            )));
        }

        self.services.push(name.to_string());
        Ok(())
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }
}

/// The listening side of the transport seam.
pub struct ServerTransport {
    address: String,
    shutdown: CancellationToken,
}

impl ServerTransport {
    /// Bind the app's address and start accepting. Accepted connections are
    /// parked until shutdown; dispatching RPCs on them is the plugged-in
    /// stack's job.
    pub async fn serve(app: &App, registrar: ServiceRegistrar) -> Result<ServerTransport> {
        let target = Target::parse(&app.url)?;

        if !target.scheme.is_servable() {
            return Err(Error::Config(format!(
                "app [{}] cannot be served since it uses '{}:' protocol",
                app.name,
                target.scheme.as_str()
            )));
        }

        let _credentials = credentials_for(app, target.scheme)?;
        let address = target.address();

        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| Error::Bind(format!("unable to bind {}: {}", address, e)))?;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let app_name = app.name.clone();

        tracing::debug!(
            app = %app_name,
            address = %address,
            services = ?registrar.services(),
            "server transport listening"
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((conn, peer)) => {
                                tracing::trace!(app = %app_name, peer = %peer, "accepted connection");
                                let token = token.clone();
                                tokio::spawn(async move {
                                    // Park the connection; it is closed when the
                                    // server stops or the peer goes away.
                                    token.cancelled().await;
                                    drop(conn);
                                });
                            }
                            Err(e) => {
                                tracing::warn!(app = %app_name, error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(ServerTransport { address, shutdown })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
