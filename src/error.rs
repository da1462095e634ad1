use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(rpcfleet::config::error),
        help("Check rpcfleet.json (or rpcfleet.local.json) next to your project root")
    )]
    Config(String),

    #[error("app [{0}] is not configured")]
    #[diagnostic(
        code(rpcfleet::config::unknown_app),
        help("List configured apps in the 'apps' section of rpcfleet.json")
    )]
    AppNotConfigured(String),

    #[error("Bind error: {0}")]
    #[diagnostic(
        code(rpcfleet::host::bind),
        help("Another daemon may be listening. Check with `rpcfleet list` or stop it with `rpcfleet host --stop`")
    )]
    Bind(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("service {0} is not registered")]
    #[diagnostic(
        code(rpcfleet::registry::not_registered),
        help("Register the service on the runtime builder before calling Runtime::start")
    )]
    ServiceNotRegistered(String),

    #[error("service {0} is not available")]
    #[diagnostic(
        code(rpcfleet::registry::not_available),
        help("All endpoints for this service are shut down. Is the hosting app running?")
    )]
    ServiceNotAvailable(String),

    #[error("Process error: {0}")]
    #[diagnostic(
        code(rpcfleet::process::error),
        help("Check that the entry exists and is executable")
    )]
    Process(String),

    #[error("an app is already running in this process")]
    AlreadyRunning,

    #[error("host server is not running")]
    HostOffline,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::Config(msg) if msg.contains("unable to load config file") => Some(
                "Create a config with: rpcfleet init".to_string(),
            ),
            Error::Config(_) => Some(
                "Validate the JSON syntax of rpcfleet.json (C-style comments are allowed)"
                    .to_string(),
            ),
            Error::AppNotConfigured(name) => Some(format!(
                "Add an entry named '{}' to the 'apps' section of rpcfleet.json",
                name
            )),
            Error::Bind(_) => Some(
                "If no daemon is actually running, a stale socket file is removed automatically on the next start".to_string(),
            ),
            Error::ServiceNotAvailable(_) => Some(
                "Start the hosting app with: rpcfleet start <app>".to_string(),
            ),
            Error::HostOffline => Some(
                "Start the daemon with: rpcfleet host (or just `rpcfleet start`)".to_string(),
            ),
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}
