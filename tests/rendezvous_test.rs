//! Rendezvous lifecycle: stale-file recovery and bind exclusivity.

use rpcfleet::config::Config;
use rpcfleet::pm::{rendezvous, Host};
use rpcfleet::Error;

#[tokio::test]
async fn stale_rendezvous_file_does_not_block_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("rpcfleet.json");
    let sock = rendezvous::socket_file(&config_path);

    // Leftover from an unclean shutdown: a plain file, nobody listening.
    std::fs::write(&sock, b"").unwrap();

    let host = Host::new(&Config::default(), &config_path, true);
    host.start(false).await.expect("stale file must be replaced");

    assert!(rendezvous::is_host_online(&config_path).await);

    host.stop().await;
    assert!(!sock.exists());
}

#[tokio::test]
async fn second_host_cannot_steal_a_live_rendezvous() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("rpcfleet.json");

    let first = Host::new(&Config::default(), &config_path, true);
    first.start(false).await.unwrap();

    let second = Host::new(&Config::default(), &config_path, true);
    let err = second.start(false).await.unwrap_err();
    assert!(matches!(err, Error::Bind(_)), "got: {}", err);

    // The live host is unaffected.
    assert!(rendezvous::is_host_online(&config_path).await);

    first.stop().await;
}

#[tokio::test]
async fn offline_probe_is_false_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("rpcfleet.json");
    let sock = rendezvous::socket_file(&config_path);

    std::fs::write(&sock, b"").unwrap();

    assert!(!rendezvous::is_host_online(&config_path).await);
    assert!(!sock.exists(), "probe removes the stale file");
}
