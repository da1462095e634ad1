//! Configuration types for the app fleet.
//!
//! The config file is JSON with C-style comments permitted (see
//! [`Parser`]). A `rpcfleet.local.json` in the same directory overrides
//! `rpcfleet.json`, which keeps machine-local tweaks out of version control.

mod parser;

pub use parser::{Parser, CONFIG_FILE, LOCAL_CONFIG_FILE};

use crate::error::{Error, Result};
use crate::transport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One configured unit of the fleet: a name, a URL, and the services it
/// hosts and/or consumes. Runs as an OS process when `serve` is true.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct App {
    /// The name of the app, unique within a config.
    pub name: String,
    /// The URL of the RPC server. Supported schemes are `plaintext:`,
    /// `tls:`, `http:`, `https:` and `xds:` (connect-only).
    pub url: String,
    /// Whether this app hosts the server role.
    pub serve: bool,
    /// The services served by this app.
    pub services: Vec<String>,
    /// The CA filename used to verify the peer's certificates. When omitted,
    /// the system roots are used.
    pub ca: String,
    /// The certificate filename when using TLS.
    pub cert: String,
    /// The private key filename when using TLS.
    pub key: String,
    /// File that the child's stdout is appended to. Empty means inherit.
    pub stdout: String,
    /// File that the child's stderr is appended to. Empty falls back to
    /// `stdout`, then inherit.
    pub stderr: String,
    /// Path of the program to spawn for this app.
    pub entry: String,
    /// Environment overlay applied on top of the parent's environment.
    pub env: HashMap<String, String>,
}

/// Top-level config: defaults plus the list of apps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Path to the tsconfig.json used when compiling `.ts` entries.
    pub tsconfig: String,
    /// Default entry, superseded by a per-app `entry`.
    pub entry: String,
    /// Import root injected into typed-source children as `IMPORT_ROOT`.
    pub import_root: String,
    /// Proto search paths, consumed by the (external) code generator.
    pub proto_paths: Vec<String>,
    pub apps: Vec<App>,
}

impl Config {
    /// Find an app by name.
    pub fn find_app(&self, name: &str) -> Option<&App> {
        self.apps.iter().find(|app| app.name == name)
    }

    /// All apps that host the server role.
    pub fn served_apps(&self) -> Vec<&App> {
        self.apps.iter().filter(|app| app.serve).collect()
    }

    /// Validate the config beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();

        for app in &self.apps {
            if app.name.is_empty() {
                return Err(Error::Config("app with an empty name".to_string()));
            }

            if !seen.insert(app.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate app name '{}'",
                    app.name
                )));
            }

            let target = transport::Target::parse(&app.url)?;

            if app.serve {
                if !target.scheme.is_servable() {
                    return Err(Error::Config(format!(
                        "app [{}] cannot be served since it uses '{}:' protocol",
                        app.name,
                        target.scheme.as_str()
                    )));
                }

                if target.scheme.is_secure() && (app.cert.is_empty() || app.key.is_empty()) {
                    return Err(Error::Config(format!(
                        "missing 'cert'/'key' config for app [{}]",
                        app.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// The subset of tsconfig.json the spawner cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TsConfig {
    pub compiler_options: TsCompilerOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TsCompilerOptions {
    pub root_dir: String,
    pub out_dir: String,
    pub no_emit_on_error: bool,
}

impl TsConfig {
    /// Load a tsconfig.json (comments permitted). A missing file yields the
    /// default config rather than an error, matching how optional this
    /// machinery is for fleets without typed-source entries.
    pub fn load(path: &Path) -> Result<TsConfig> {
        if !path.exists() {
            return Ok(TsConfig::default());
        }

        let content = std::fs::read_to_string(path)?;
        let stripped = parser::strip_json_comments(&content);
        let cfg: TsConfig = serde_json::from_str(&stripped)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;

        Ok(cfg)
    }
}

/// Absolutize a path against the current working directory.
pub fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str, url: &str, serve: bool) -> App {
        App {
            name: name.to_string(),
            url: url.to_string(),
            serve,
            ..App::default()
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let config = Config {
            apps: vec![
                app("a", "plaintext://localhost:4000", true),
                app("a", "plaintext://localhost:4001", false),
            ],
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate app name"));
    }

    #[test]
    fn xds_apps_cannot_serve() {
        let config = Config {
            apps: vec![app("a", "xds:///example-service", true)],
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot be served"));
    }

    #[test]
    fn xds_apps_can_connect() {
        let config = Config {
            apps: vec![app("a", "xds:///example-service", false)],
            ..Config::default()
        };

        config.validate().unwrap();
    }

    #[test]
    fn secure_serve_requires_material() {
        let config = Config {
            apps: vec![app("a", "tls://localhost:4000", true)],
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("missing 'cert'/'key'"));
    }
}
