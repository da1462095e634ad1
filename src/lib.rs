//! # rpcfleet
//!
//! A framework for running a fleet of cooperating RPC services as
//! independent OS processes on a single machine. Two pieces do the work:
//!
//! - **The host/guest control plane**: a local supervisor daemon (host)
//!   exchanges newline-delimited JSON control messages with every service
//!   process (guest) over a Unix domain socket (a named pipe on Windows).
//!   It handles handshakes, graceful shutdown, broadcast/targeted command
//!   dispatch with per-message reply correlation, stat collection, and
//!   revival of crashed guests.
//! - **The service registry and router**: inside every process, a registry
//!   maps service names to their potential host apps, dials them lazily on
//!   first use, and routes each call by explicit endpoint match, stable
//!   hashing of a route key, or round-robin.
//!
//! The crate is consumed both as a library (linked into each service
//! process) and through the `rpcfleet` CLI (`init`/`host`/`start`/`stop`/
//! `reload`/`restart`/`list`).
//!
//! ## Quick start
//!
//! ```no_run
//! use rpcfleet::{Runtime, app_name_from_args};
//! use std::sync::Arc;
//! # struct UserService;
//! # impl rpcfleet::Service for UserService {
//! #     fn service_name(&self) -> &'static str { "services.UserService" }
//! # }
//! # impl rpcfleet::Connectable for UserService {
//! #     type Client = ();
//! #     fn connect(&self, _ch: rpcfleet::Channel) -> () { () }
//! # }
//!
//! # async fn example() -> Result<(), rpcfleet::Error> {
//! let runtime = Runtime::builder()
//!     .register(Arc::new(UserService))
//!     .start(&app_name_from_args()?)
//!     .await?;
//!
//! let client = runtime.service_client(&UserService, "").await?;
//! # drop(client);
//! runtime.wait_for_exit().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod output;
pub mod pm;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod transport;

// Re-export commonly used types
pub use config::{App, Config, Parser, TsConfig};
pub use error::{Error, Result};
pub use pm::{ControlClient, Guest, Host};
pub use registry::{Connectable, Peers, Servable, Service, ServiceRegistry, ServiceSet};
pub use runtime::{app_name_from_args, Runtime, RuntimeBuilder, Snippet};
pub use transport::{Channel, ChannelState, ServerTransport, ServiceRegistrar};
