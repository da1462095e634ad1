//! Registry and router behavior over real TCP endpoints.

use rpcfleet::config::App;
use rpcfleet::registry::{Connectable, Service, ServiceRegistry, ServiceSet};
use rpcfleet::transport::{Channel, ChannelState};
use rpcfleet::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const ECHO: &str = "services.EchoService";

struct EchoService;

#[derive(Clone, Debug)]
struct EchoClient {
    app: String,
}

impl Service for EchoService {
    fn service_name(&self) -> &'static str {
        ECHO
    }
}

impl Connectable for EchoService {
    type Client = EchoClient;

    fn connect(&self, channel: Channel) -> EchoClient {
        EchoClient {
            app: channel.app().to_string(),
        }
    }
}

fn host_app(name: &str, port: u16) -> App {
    App {
        name: name.to_string(),
        url: format!("plaintext://127.0.0.1:{}", port),
        serve: true,
        services: vec![ECHO.to_string()],
        ..App::default()
    }
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn echo_set() -> ServiceSet {
    let mut set = ServiceSet::new();
    set.register(Arc::new(EchoService));
    set
}

#[tokio::test]
async fn routing_explicit_hash_and_round_robin() {
    let (listener_a, port_a) = listener().await;
    let (listener_b, port_b) = listener().await;

    // Accept in the background; the registry dials every host on first use.
    tokio::spawn(async move {
        loop {
            let _ = listener_a.accept().await;
        }
    });
    tokio::spawn(async move {
        loop {
            let _ = listener_b.accept().await;
        }
    });

    let apps = vec![host_app("a", port_a), host_app("b", port_b)];
    let (registry, _channels) = ServiceRegistry::build(&apps, &echo_set()).unwrap();

    // Explicit match on app name.
    let client = registry.client_for(&EchoService, "b").await.unwrap();
    assert_eq!(client.app, "b");
    let client = registry.client_for(&EchoService, "a").await.unwrap();
    assert_eq!(client.app, "a");

    // Explicit match on the full URL.
    let url_b = format!("plaintext://127.0.0.1:{}", port_b);
    let client = registry.client_for(&EchoService, &url_b).await.unwrap();
    assert_eq!(client.app, "b");

    // Hash routing: stable for a fixed key.
    let first = registry.client_for(&EchoService, "x").await.unwrap().app;
    for _ in 0..8 {
        let again = registry.client_for(&EchoService, "x").await.unwrap().app;
        assert_eq!(again, first, "hash routing must be deterministic");
    }

    // Round-robin: a, b, a — keyed calls above must not have advanced it.
    let picks = [
        registry.client_for(&EchoService, "").await.unwrap().app,
        registry.client_for(&EchoService, "").await.unwrap().app,
        registry.client_for(&EchoService, "").await.unwrap().app,
    ];
    assert_eq!(picks, ["a", "b", "a"]);
}

#[tokio::test]
async fn nothing_is_dialed_before_the_first_lookup() {
    let (listener, port) = listener().await;

    let apps = vec![host_app("a", port)];
    let (registry, _channels) = ServiceRegistry::build(&apps, &echo_set()).unwrap();

    assert!(!registry.has_cached_endpoints(ECHO).await);

    // No connection may arrive until a client is actually requested.
    let premature = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(premature.is_err(), "lazy dial must not connect eagerly");

    let client = registry.client_for(&EchoService, "").await.unwrap();
    assert_eq!(client.app, "a");

    let accepted = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
    assert!(accepted.is_ok(), "first lookup should have dialed");
    assert!(registry.has_cached_endpoints(ECHO).await);
}

#[tokio::test]
async fn dial_failure_surfaces_lazily_and_recovers_without_restart() {
    // Reserve a port, then free it so nothing is listening there.
    let (reserved, port) = listener().await;
    drop(reserved);

    let apps = vec![host_app("a", port)];
    let (registry, _channels) = ServiceRegistry::build(&apps, &echo_set()).unwrap();

    // Building the registry succeeded; the failure only shows on first use.
    let err = registry.client_for(&EchoService, "").await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got: {}", err);

    // The host comes up; the same process recovers on the next lookup.
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let _ = listener.accept().await;
        }
    });

    let client = registry.client_for(&EchoService, "").await.unwrap();
    assert_eq!(client.app, "a");
}

#[tokio::test]
async fn shutdown_endpoints_are_filtered_until_none_remain() {
    let (listener_a, port_a) = listener().await;
    let (listener_b, port_b) = listener().await;
    tokio::spawn(async move {
        loop {
            let _ = listener_a.accept().await;
        }
    });
    tokio::spawn(async move {
        loop {
            let _ = listener_b.accept().await;
        }
    });

    let apps = vec![host_app("a", port_a), host_app("b", port_b)];
    let (registry, channels) = ServiceRegistry::build(&apps, &echo_set()).unwrap();

    // Populate the cache.
    registry.client_for(&EchoService, "").await.unwrap();

    // Shut down app a's channel; every selection must now land on b.
    let channel_a = channels.iter().find(|c| c.app() == "a").unwrap();
    channel_a.close();
    assert_eq!(channel_a.state(), ChannelState::Shutdown);

    for _ in 0..4 {
        let client = registry.client_for(&EchoService, "").await.unwrap();
        assert_eq!(client.app, "b");
    }

    // With both gone the service is unavailable.
    channels.iter().find(|c| c.app() == "b").unwrap().close();
    let err = registry.client_for(&EchoService, "").await.unwrap_err();
    assert!(matches!(err, Error::ServiceNotAvailable(_)));
}

#[tokio::test]
async fn unregistered_services_are_rejected_at_build_time() {
    let mut app = host_app("a", 4000);
    app.services = vec!["services.Unknown".to_string()];

    let err = ServiceRegistry::build(&[app], &echo_set()).unwrap_err();
    assert!(matches!(err, Error::ServiceNotRegistered(_)));
}

#[tokio::test]
async fn lookup_of_unhosted_service_is_not_registered() {
    // Registered in the set, but no app advertises it.
    let apps: Vec<App> = Vec::new();
    let (registry, _channels) = ServiceRegistry::build(&apps, &echo_set()).unwrap();

    let err = registry.client_for(&EchoService, "").await.unwrap_err();
    assert!(matches!(err, Error::ServiceNotRegistered(_)));
}
