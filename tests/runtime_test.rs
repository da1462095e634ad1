//! Full runtime lifecycle: server bootstrap, sibling wiring, client
//! lookup, the one-app-per-process guard, and the shutdown sequence.
//!
//! Everything lives in one test function because the runtime deliberately
//! refuses to coexist with another in the same process.

use rpcfleet::config::{App, Config};
use rpcfleet::registry::{Connectable, Peers, Servable, Service};
use rpcfleet::transport::{Channel, ServiceRegistrar};
use rpcfleet::{Error, Runtime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const USERS: &str = "services.UserService";
const POSTS: &str = "services.PostService";

#[derive(Default)]
struct UserService;

#[derive(Clone)]
struct UserClient {
    app: String,
}

impl Service for UserService {
    fn service_name(&self) -> &'static str {
        USERS
    }
}

impl Connectable for UserService {
    type Client = UserClient;

    fn connect(&self, channel: Channel) -> UserClient {
        UserClient {
            app: channel.app().to_string(),
        }
    }
}

impl Servable for UserService {
    fn serve(&self, registrar: &mut ServiceRegistrar) -> rpcfleet::Result<()> {
        registrar.register(USERS)
    }
}

#[derive(Default)]
struct PostService {
    users: OnceLock<Arc<UserService>>,
    stopped: AtomicBool,
}

#[derive(Clone)]
struct PostClient;

impl Service for PostService {
    fn service_name(&self) -> &'static str {
        POSTS
    }
}

impl Connectable for PostService {
    type Client = PostClient;

    fn connect(&self, _channel: Channel) -> PostClient {
        PostClient
    }
}

impl Servable for PostService {
    fn serve(&self, registrar: &mut ServiceRegistrar) -> rpcfleet::Result<()> {
        registrar.register(POSTS)
    }

    fn wire(&self, peers: &Peers<'_>) -> rpcfleet::Result<()> {
        // Grab the co-hosted sibling so local calls can skip the transport.
        if let Some(users) = peers.get::<UserService>(USERS) {
            let _ = self.users.set(users);
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn runtime_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("rpcfleet.json");

    // Reserve a port for the server role.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let config = Config {
        apps: vec![App {
            name: "api".to_string(),
            url: format!("plaintext://127.0.0.1:{}", port),
            serve: true,
            services: vec![USERS.to_string(), POSTS.to_string()],
            ..App::default()
        }],
        ..Config::default()
    };

    let users = Arc::new(UserService);
    let posts = Arc::new(PostService::default());

    let runtime = Runtime::builder()
        .register_servable(users.clone())
        .register_servable(posts.clone())
        .start_with_config("api", config.clone(), &config_path)
        .await
        .expect("runtime should start");

    assert_eq!(runtime.app_name(), "api");

    // Only one app per process.
    let err = Runtime::builder()
        .register(Arc::new(UserService))
        .start_with_config("api", config.clone(), &config_path)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning));

    // The server transport is actually listening.
    let probe = tokio::time::timeout(
        Duration::from_secs(1),
        TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    .expect("connect should not hang")
    .expect("server should accept");
    drop(probe);

    // Wiring injected the co-hosted sibling.
    assert!(posts.users.get().is_some(), "sibling should be wired");

    // Client lookup resolves to this app's own endpoint.
    let client = runtime
        .service_client(&*users, "")
        .await
        .expect("client lookup");
    assert_eq!(client.app, "api");

    runtime.stop().await;
    assert!(posts.stopped.load(Ordering::SeqCst), "stop hook should run");

    // Unknown app names are rejected, and a failed start releases the
    // one-app guard.
    let err = Runtime::builder()
        .register(Arc::new(UserService))
        .start_with_config("nope", config.clone(), &config_path)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AppNotConfigured(_)));

    // The guard is released; an anonymous pure-client runtime can come and
    // go. `for_snippet` loads the config from the working directory, so
    // point it at the scratch dir (this binary runs exactly one test).
    std::fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    let snippet = Runtime::builder()
        .register(Arc::new(UserService))
        .register(Arc::new(PostService::default()))
        .for_snippet()
        .await
        .expect("snippet runtime");
    assert_eq!(snippet.runtime.app_name(), "");
    snippet.done().await;
}
