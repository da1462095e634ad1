//! The service registry: the process-wide mapping from a service name to
//! the apps that can host it, with one lazily-dialed channel per host and
//! a typed client built on first use.
//!
//! Registration is explicit: every service supplies a stable string key
//! (e.g. `"services.UserService"`). Nothing here is reflected off type
//! names, and sibling injection happens through an explicit `wire` hook
//! during server bootstrap rather than field walking.

use crate::config::App;
use crate::error::{Error, Result};
use crate::router::{self, EndpointLabel};
use crate::transport::{self, Channel, ChannelState, ServiceRegistrar};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Anything that lives in the registry.
pub trait Service: Send + Sync + 'static {
    /// The stable registry key for this service.
    fn service_name(&self) -> &'static str;
}

/// A service whose typed client can be bound to a channel.
pub trait Connectable: Service {
    type Client: Clone + Send + Sync + 'static;

    /// Build the typed client over an established channel.
    fn connect(&self, channel: Channel) -> Self::Client;
}

/// A service that can be hosted by a server-role app.
pub trait Servable: Service {
    /// Bind handlers to the server transport.
    fn serve(&self, registrar: &mut ServiceRegistrar) -> Result<()>;

    /// Receive co-hosted sibling services. Services that call a sibling
    /// directly (bypassing the transport) fetch it here by name.
    fn wire(&self, _peers: &Peers<'_>) -> Result<()> {
        Ok(())
    }

    /// Optional teardown, run before the server transport stops.
    fn stop(&self) {}
}

/// One registered service: the instance itself (for wiring and typed
/// lookups) plus the servable view when the service can be hosted.
pub(crate) struct Registration {
    pub(crate) instance: Arc<dyn Any + Send + Sync>,
    pub(crate) servable: Option<Arc<dyn Servable>>,
}

/// The set of registered services, keyed by service name. Append-only
/// while the runtime is being built, read-only afterwards.
#[derive(Default)]
pub struct ServiceSet {
    registrations: HashMap<&'static str, Registration>,
}

impl ServiceSet {
    pub fn new() -> ServiceSet {
        ServiceSet::default()
    }

    /// Register a client-only service. Idempotent per name.
    pub fn register<S: Connectable>(&mut self, service: Arc<S>) -> &mut Self {
        let name = service.service_name();
        self.registrations.entry(name).or_insert(Registration {
            instance: service,
            servable: None,
        });
        self
    }

    /// Register a service that can also be hosted by this process.
    pub fn register_servable<S: Connectable + Servable>(&mut self, service: Arc<S>) -> &mut Self {
        let name = service.service_name();
        self.registrations.entry(name).or_insert(Registration {
            instance: service.clone(),
            servable: Some(service),
        });
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Registration> {
        self.registrations.get(name)
    }
}

/// Lookup view handed to `Servable::wire` during server bootstrap.
pub struct Peers<'a> {
    set: &'a ServiceSet,
}

impl<'a> Peers<'a> {
    pub(crate) fn new(set: &'a ServiceSet) -> Peers<'a> {
        Peers { set }
    }

    /// Fetch a co-registered sibling by name, typed.
    pub fn get<S: Service>(&self, name: &str) -> Option<Arc<S>> {
        let registration = self.set.get(name)?;
        registration.instance.clone().downcast::<S>().ok()
    }
}

/// One resolvable endpoint: a hosting app, its channel, and the typed
/// client built over it. Endpoints whose channel has shut down are
/// filtered out at selection time.
pub struct RemoteEndpoint {
    pub app: String,
    pub url: String,
    pub channel: Channel,
    client: Arc<dyn Any + Send + Sync>,
}

struct EndpointDialer {
    app: String,
    url: String,
    channel: Channel,
}

struct EntryState {
    dialers: Vec<EndpointDialer>,
    endpoints: Vec<RemoteEndpoint>,
    counter: u32,
}

/// Per-service-name registry entry. The mutex serializes the whole lookup
/// (cache population, filtering, selection, counter advance); it is a
/// tokio mutex because it is held across the dial await.
struct RegistryEntry {
    state: tokio::sync::Mutex<EntryState>,
}

/// The client-side registry: service name → entry.
pub struct ServiceRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceRegistry {
    /// Build the registry from the config. Every app advertising a service
    /// contributes a lazy dialer for it; apps share one channel. Returns
    /// the registry and the per-app channel table (the runtime closes the
    /// channels on stop).
    pub fn build(apps: &[App], services: &ServiceSet) -> Result<(ServiceRegistry, Vec<Channel>)> {
        let mut entries: HashMap<String, RegistryEntry> = HashMap::new();
        let mut channels: HashMap<String, Channel> = HashMap::new();

        for app in apps {
            if app.services.is_empty() {
                continue;
            }

            let target = transport::Target::parse(&app.url)?;
            let credentials = transport::credentials_for(app, target.scheme)?;

            let channel = channels
                .entry(app.name.clone())
                .or_insert_with(|| Channel::new(&app.name, target.address(), credentials))
                .clone();

            for service_name in &app.services {
                if !services.contains(service_name) {
                    return Err(Error::ServiceNotRegistered(service_name.clone()));
                }

                let entry = entries
                    .entry(service_name.clone())
                    .or_insert_with(|| RegistryEntry {
                        state: tokio::sync::Mutex::new(EntryState {
                            dialers: Vec::new(),
                            endpoints: Vec::new(),
                            counter: 0,
                        }),
                    });

                entry.state.get_mut().dialers.push(EndpointDialer {
                    app: app.name.clone(),
                    url: app.url.clone(),
                    channel: channel.clone(),
                });
            }
        }

        Ok((
            ServiceRegistry { entries },
            channels.into_values().collect(),
        ))
    }

    /// Resolve a typed client for `service`, steered by `route`.
    ///
    /// The first lookup for a name dials every configured host and builds
    /// the clients; connections are deliberately not opened before that,
    /// so a caller process may start before its callees. A dial failure
    /// leaves the cache empty and is retried on the next call.
    pub async fn client_for<S: Connectable>(&self, service: &S, route: &str) -> Result<S::Client> {
        let name = service.service_name();

        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::ServiceNotRegistered(name.to_string()))?;

        let mut state = entry.state.lock().await;

        if state.endpoints.is_empty() {
            let mut endpoints = Vec::with_capacity(state.dialers.len());

            for dialer in &state.dialers {
                // A failed dial abandons the partial cache; the next lookup
                // starts over.
                dialer.channel.ensure_connected().await?;

                endpoints.push(RemoteEndpoint {
                    app: dialer.app.clone(),
                    url: dialer.url.clone(),
                    channel: dialer.channel.clone(),
                    client: Arc::new(service.connect(dialer.channel.clone())),
                });
            }

            state.endpoints = endpoints;
        }

        // Use only the endpoints that have not shut down.
        let live: Vec<usize> = state
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.channel.state() != ChannelState::Shutdown)
            .map(|(i, _)| i)
            .collect();

        if live.is_empty() {
            return Err(Error::ServiceNotAvailable(name.to_string()));
        }

        let labels: Vec<EndpointLabel<'_>> = live
            .iter()
            .map(|&i| EndpointLabel {
                app: &state.endpoints[i].app,
                url: &state.endpoints[i].url,
            })
            .collect();

        let mut counter = state.counter;
        let picked = router::route_index(&labels, route, &mut counter)
            .ok_or_else(|| Error::ServiceNotAvailable(name.to_string()))?;
        state.counter = counter;

        let endpoint = &state.endpoints[live[picked]];

        endpoint
            .client
            .clone()
            .downcast::<S::Client>()
            .map(|client| (*client).clone())
            .map_err(|_| {
                Error::Protocol(format!(
                    "cached client for service {} has an unexpected type",
                    name
                ))
            })
    }

    /// Whether any lookup has populated the cache for `name` yet. Used by
    /// tests asserting the lazy-dial contract.
    pub async fn has_cached_endpoints(&self, name: &str) -> bool {
        match self.entries.get(name) {
            Some(entry) => !entry.state.lock().await.endpoints.is_empty(),
            None => false,
        }
    }
}
