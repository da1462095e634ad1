use rpcfleet::output::{CliOutput, UserOutput};
use std::path::PathBuf;

const DEFAULT_TEMPLATE: &str = r#"{
    // Default entry, superseded by a per-app "entry".
    "entry": "bin/service",
    "apps": [
        {
            "name": "user-server",
            "url": "plaintext://localhost:4000",
            "serve": true,
            "services": ["services.UserService"],
            "stdout": "logs/user-server.log"
        },
        {
            "name": "post-server",
            "url": "plaintext://localhost:4001",
            "serve": true,
            "services": ["services.PostService"],
            "stdout": "logs/post-server.log"
        }
    ]
}
"#;

/// `rpcfleet init [--template ...]`: scaffold a project config.
pub fn run_init(config: Option<PathBuf>, template: &str, force: bool) -> anyhow::Result<()> {
    let out = CliOutput;
    let path = config.unwrap_or_else(|| PathBuf::from(rpcfleet::config::CONFIG_FILE));

    if template != "default" {
        anyhow::bail!("unknown template '{}'", template);
    }

    if path.exists() && !force {
        out.warning(&format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        ));
        return Ok(());
    }

    std::fs::write(&path, DEFAULT_TEMPLATE)?;
    out.status(&format!("created {}", path.display()));

    Ok(())
}
