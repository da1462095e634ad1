//! Spawning app processes.
//!
//! Entry resolution is extension-driven: `.go` runs through the Go
//! toolchain, `.js` through node, `.ts` through one batch `tsc` compile and
//! then node against the emitted file (with `IMPORT_ROOT` pointing at the
//! out-dir), and anything else is executed directly. The app name is always
//! argv[1] so the child knows which config entry it is.
//!
//! Children are detached: the spawner never supervises exit status, and the
//! host learns about liveness exclusively through the control socket. A
//! reaper task is parked on each child purely so exited children do not
//! linger as zombies.

use crate::config::{App, TsConfig};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Out-dir used for compiled typed-source entries when the tsconfig does
/// not name one.
pub const DEFAULT_TS_OUT_DIR: &str = "node_modules/.rpcfleet";

/// How to invoke an app: program, arguments, and the environment overlay
/// the resolution decided on (before the per-app `env` is applied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Map an app's `entry` to an invocation.
pub fn resolve_entry(app: &App, ts_cfg: &TsConfig) -> Result<ResolvedEntry> {
    if app.entry.is_empty() {
        return Err(Error::Process("entry file is not set".to_string()));
    }

    let ext = Path::new(&app.entry)
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut env = HashMap::new();

    let (program, args) = match ext.as_str() {
        "go" => (
            "go".to_string(),
            vec!["run".to_string(), app.entry.clone(), app.name.clone()],
        ),
        "js" => (
            "node".to_string(),
            vec![
                "-r".to_string(),
                "source-map-support/register".to_string(),
                app.entry.clone(),
                app.name.clone(),
            ],
        ),
        "ts" => {
            let (out_dir, out_file) = resolve_ts_entry(&app.entry, ts_cfg);
            env.insert("IMPORT_ROOT".to_string(), out_dir);
            (
                "node".to_string(),
                vec![
                    "-r".to_string(),
                    "source-map-support/register".to_string(),
                    out_file,
                    app.name.clone(),
                ],
            )
        }
        _ => {
            let path = crate::config::abs_path(Path::new(&app.entry));
            (path.to_string_lossy().to_string(), vec![app.name.clone()])
        }
    };

    for (key, value) in &app.env {
        env.insert(key.clone(), value.clone());
    }

    Ok(ResolvedEntry { program, args, env })
}

/// Map a `.ts` entry to the compile out-dir and the emitted `.js` file,
/// honoring the tsconfig's `rootDir`/`outDir`.
pub fn resolve_ts_entry(entry: &str, ts_cfg: &TsConfig) -> (String, String) {
    let mut entry = entry.to_string();

    let root_dir = normalized_dir(&ts_cfg.compiler_options.root_dir);
    if let Some(root) = &root_dir {
        let prefix = format!("{}/", root);
        if let Some(rest) = entry.strip_prefix(&prefix) {
            entry = rest.to_string();
        }
    }

    let js_name = |entry: &str| -> String {
        let path = Path::new(entry);
        path.with_extension("js").to_string_lossy().to_string()
    };

    match normalized_dir(&ts_cfg.compiler_options.out_dir) {
        Some(out_dir) => {
            let prefix = format!("{}/", out_dir);
            let out_file = if entry.starts_with(&prefix) {
                entry
            } else {
                format!("{}/{}", out_dir, js_name(&entry))
            };
            (out_dir, out_file)
        }
        None => {
            let out_file = PathBuf::from(DEFAULT_TS_OUT_DIR)
                .join(js_name(&entry))
                .to_string_lossy()
                .to_string();
            (DEFAULT_TS_OUT_DIR.to_string(), out_file)
        }
    }
}

fn normalized_dir(dir: &str) -> Option<String> {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Compile typed-source entries in one batch. Compiler diagnostics pass
/// through to the operator's terminal; the exit status only fails the
/// operation when the tsconfig says `noEmitOnError`.
pub async fn compile_ts(ts_cfg: &TsConfig, out_dir: &str) -> Result<()> {
    if out_dir != DEFAULT_TS_OUT_DIR && Path::new(DEFAULT_TS_OUT_DIR).exists() {
        // A previous run may have compiled into the default location.
        let _ = std::fs::remove_dir_all(DEFAULT_TS_OUT_DIR);
    }

    let mut cmd = Command::new("npx");
    cmd.arg("tsc");

    if !out_dir.is_empty() {
        cmd.args(["--outDir", out_dir]);
    }

    let status = cmd
        .status()
        .await
        .map_err(|e| Error::Process(format!("unable to run tsc: {}", e)))?;

    if !status.success() && ts_cfg.compiler_options.no_emit_on_error {
        return Err(Error::Process(format!(
            "tsc exited with {}",
            status.code().unwrap_or(-1)
        )));
    }

    Ok(())
}

/// Spawn a configured app and return its PID. The child inherits the
/// parent environment plus the resolution/per-app overlays, and its stdio
/// is appended to the configured files (parent directories created), with
/// stderr falling back to the stdout file.
pub async fn spawn_app(app: &App, ts_cfg: &TsConfig) -> Result<u32> {
    let resolved = resolve_entry(app, ts_cfg)?;

    let mut cmd = Command::new(&resolved.program);
    cmd.args(&resolved.args);
    cmd.envs(&resolved.env);
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(false);

    #[cfg(unix)]
    {
        // Children get their own process group so a terminal signal aimed at
        // the CLI does not take the fleet down with it.
        cmd.process_group(0);
    }

    if app.stdout.is_empty() {
        cmd.stdout(Stdio::inherit());
    } else {
        cmd.stdout(Stdio::from(open_for_append(&app.stdout)?));
    }

    if !app.stderr.is_empty() {
        cmd.stderr(Stdio::from(open_for_append(&app.stderr)?));
    } else if !app.stdout.is_empty() {
        cmd.stderr(Stdio::from(open_for_append(&app.stdout)?));
    } else {
        cmd.stderr(Stdio::inherit());
    }

    let mut child = cmd.spawn().map_err(|e| {
        Error::Process(format!(
            "unable to start app [{}] (reason: {})",
            app.name, e
        ))
    })?;

    let pid = child.id().ok_or_else(|| {
        Error::Process(format!("app [{}] exited before it was observed", app.name))
    })?;

    tracing::debug!(app = %app.name, pid, program = %resolved.program, "spawned app");

    // Detach: only reap, never supervise.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    Ok(pid)
}

/// Open a log file for appending, creating parent directories.
pub fn open_for_append(path: &str) -> Result<std::fs::File> {
    let path = Path::new(path);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TsCompilerOptions;

    fn app_with_entry(entry: &str) -> App {
        App {
            name: "user-server".to_string(),
            entry: entry.to_string(),
            ..App::default()
        }
    }

    #[test]
    fn empty_entry_is_rejected() {
        let err = resolve_entry(&app_with_entry(""), &TsConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "Process error: entry file is not set");
    }

    #[test]
    fn go_entry_runs_through_toolchain() {
        let resolved = resolve_entry(&app_with_entry("services/main.go"), &TsConfig::default())
            .unwrap();
        assert_eq!(resolved.program, "go");
        assert_eq!(resolved.args, vec!["run", "services/main.go", "user-server"]);
    }

    #[test]
    fn js_entry_runs_through_node() {
        let resolved =
            resolve_entry(&app_with_entry("services/main.js"), &TsConfig::default()).unwrap();
        assert_eq!(resolved.program, "node");
        assert_eq!(resolved.args[2], "services/main.js");
        assert_eq!(resolved.args[3], "user-server");
    }

    #[test]
    fn ts_entry_points_at_compiled_output() {
        let resolved =
            resolve_entry(&app_with_entry("services/main.ts"), &TsConfig::default()).unwrap();
        assert_eq!(resolved.program, "node");
        assert_eq!(
            resolved.args[2],
            format!("{}/services/main.js", DEFAULT_TS_OUT_DIR)
        );
        assert_eq!(
            resolved.env.get("IMPORT_ROOT"),
            Some(&DEFAULT_TS_OUT_DIR.to_string())
        );
    }

    #[test]
    fn native_entry_is_absolutized() {
        let resolved =
            resolve_entry(&app_with_entry("bin/user-server"), &TsConfig::default()).unwrap();
        assert!(Path::new(&resolved.program).is_absolute());
        assert_eq!(resolved.args, vec!["user-server"]);
    }

    #[test]
    fn app_env_overlays_resolution_env() {
        let mut app = app_with_entry("services/main.ts");
        app.env
            .insert("IMPORT_ROOT".to_string(), "custom".to_string());

        let resolved = resolve_entry(&app, &TsConfig::default()).unwrap();
        assert_eq!(resolved.env.get("IMPORT_ROOT"), Some(&"custom".to_string()));
    }

    #[test]
    fn ts_entry_honors_root_and_out_dir() {
        let ts_cfg = TsConfig {
            compiler_options: TsCompilerOptions {
                root_dir: "src".to_string(),
                out_dir: "dist".to_string(),
                no_emit_on_error: false,
            },
        };

        let (out_dir, out_file) = resolve_ts_entry("src/services/main.ts", &ts_cfg);
        assert_eq!(out_dir, "dist");
        assert_eq!(out_file, "dist/services/main.js");
    }

    #[test]
    fn ts_entry_already_in_out_dir_is_untouched() {
        let ts_cfg = TsConfig {
            compiler_options: TsCompilerOptions {
                root_dir: String::new(),
                out_dir: "dist".to_string(),
                no_emit_on_error: false,
            },
        };

        let (_, out_file) = resolve_ts_entry("dist/services/main.ts", &ts_cfg);
        assert_eq!(out_file, "dist/services/main.ts");
    }
}
