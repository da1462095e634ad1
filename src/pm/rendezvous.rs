//! The local rendezvous: a well-known socket path derived from the config
//! file path, and the platform abstraction for listening and dialing it.
//!
//! POSIX gets a Unix domain socket at the derived path; Windows maps the
//! same path under `\\.\pipe\`. Nothing outside this module knows the
//! difference.

use crate::config;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Derive the rendezvous file from the config file path: same basename,
/// suffix `.sock`, absolutized.
pub fn socket_file(config_path: &Path) -> PathBuf {
    config::abs_path(&config_path.with_extension("sock"))
}

/// The dialable form of the rendezvous path. On Windows this is the named
/// pipe namespace; elsewhere it is the filesystem path itself.
pub fn platform_path(sock_file: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        let mut pipe = String::from(r"\\.\pipe\");
        pipe.push_str(&sock_file.to_string_lossy());
        PathBuf::from(pipe)
    }

    #[cfg(not(windows))]
    {
        sock_file.to_path_buf()
    }
}

/// Probe whether a host daemon is listening for `config_path`'s fleet.
///
/// A rendezvous file with no listener behind it is a leftover from an
/// unclean shutdown; the probe removes it so the path can be bound again.
pub async fn is_host_online(config_path: &Path) -> bool {
    let sock_file = socket_file(config_path);

    #[cfg(unix)]
    if !sock_file.exists() {
        return false;
    }

    match dial_timeout(&sock_file, Duration::from_secs(1)).await {
        Ok(conn) => {
            drop(conn);
            true
        }
        Err(_) => {
            let _ = std::fs::remove_file(&sock_file);
            false
        }
    }
}

/// Dial the rendezvous with a timeout.
pub async fn dial_timeout(sock_file: &Path, timeout: Duration) -> io::Result<Conn> {
    let path = platform_path(sock_file);
    tokio::time::timeout(timeout, sys::dial(&path))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "rendezvous dial timed out"))?
}

/// Bind the rendezvous and start listening.
pub async fn listen(sock_file: &Path) -> io::Result<Listener> {
    let path = platform_path(sock_file);
    sys::listen(&path)
}

pub use sys::{Conn, Listener};

#[cfg(unix)]
mod sys {
    use std::io;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    pub type Conn = UnixStream;

    pub struct Listener {
        inner: UnixListener,
    }

    impl Listener {
        pub async fn accept(&mut self) -> io::Result<Conn> {
            let (conn, _addr) = self.inner.accept().await?;
            Ok(conn)
        }
    }

    pub fn listen(path: &Path) -> io::Result<Listener> {
        Ok(Listener {
            inner: UnixListener::bind(path)?,
        })
    }

    pub async fn dial(path: &Path) -> io::Result<Conn> {
        UnixStream::connect(path).await
    }
}

#[cfg(windows)]
mod sys {
    use std::io;
    use std::path::{Path, PathBuf};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    pub enum Conn {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    pub struct Listener {
        path: PathBuf,
        next: NamedPipeServer,
    }

    impl Listener {
        pub async fn accept(&mut self) -> io::Result<Conn> {
            self.next.connect().await?;
            let replacement = ServerOptions::new().create(&self.path)?;
            let ready = std::mem::replace(&mut self.next, replacement);
            Ok(Conn::Server(ready))
        }
    }

    pub fn listen(path: &Path) -> io::Result<Listener> {
        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .create(path)?;
        Ok(Listener {
            path: path.to_path_buf(),
            next: first,
        })
    }

    pub async fn dial(path: &Path) -> io::Result<Conn> {
        Ok(Conn::Client(ClientOptions::new().open(path)?))
    }

    impl AsyncRead for Conn {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Conn::Server(s) => Pin::new(s).poll_read(cx, buf),
                Conn::Client(c) => Pin::new(c).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for Conn {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            match self.get_mut() {
                Conn::Server(s) => Pin::new(s).poll_write(cx, buf),
                Conn::Client(c) => Pin::new(c).poll_write(cx, buf),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Conn::Server(s) => Pin::new(s).poll_flush(cx),
                Conn::Client(c) => Pin::new(c).poll_flush(cx),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Conn::Server(s) => Pin::new(s).poll_shutdown(cx),
                Conn::Client(c) => Pin::new(c).poll_shutdown(cx),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_file_replaces_extension() {
        let sock = socket_file(Path::new("/tmp/fleet/rpcfleet.json"));
        assert_eq!(sock, PathBuf::from("/tmp/fleet/rpcfleet.sock"));
    }

    #[test]
    fn socket_file_absolutizes_relative_paths() {
        let sock = socket_file(Path::new("rpcfleet.json"));
        assert!(sock.is_absolute());
        assert!(sock.to_string_lossy().ends_with("rpcfleet.sock"));
    }

    #[tokio::test]
    async fn offline_probe_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("rpcfleet.json");
        let sock = socket_file(&config_path);

        // A zero-byte leftover from an unclean shutdown.
        std::fs::write(&sock, b"").unwrap();

        assert!(!is_host_online(&config_path).await);
        assert!(!sock.exists(), "stale rendezvous file should be removed");
    }

    #[tokio::test]
    async fn online_probe_detects_listener() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("rpcfleet.json");
        let sock = socket_file(&config_path);

        let mut listener = listen(&sock).await.unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        assert!(is_host_online(&config_path).await);
        assert!(sock.exists());
    }
}
