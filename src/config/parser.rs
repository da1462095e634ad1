use super::Config;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// The default config filename. A sibling `rpcfleet.local.json` takes
/// precedence when present.
pub const CONFIG_FILE: &str = "rpcfleet.json";
pub const LOCAL_CONFIG_FILE: &str = "rpcfleet.local.json";

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Find the config file starting from the current directory.
    pub fn find_config_file(&self) -> Result<PathBuf> {
        let current_dir = std::env::current_dir()?;
        Self::find_config_in_dir(&current_dir)
    }

    pub fn find_config_in_dir(dir: &Path) -> Result<PathBuf> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() || dir.join(LOCAL_CONFIG_FILE).exists() {
            return Ok(config_path);
        }

        Err(Error::Config(format!(
            "unable to load config file: {}",
            config_path.display()
        )))
    }

    /// Load the config rooted at `path` (the default file). When a
    /// `*.local.json` sibling exists, it wins wholesale.
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<Config> {
        let path = path.as_ref();
        let local = local_sibling(path);

        let chosen = if local.exists() { local.as_path() } else { path };

        if !chosen.exists() {
            return Err(Error::Config(format!(
                "unable to load config file: {}",
                path.display()
            )));
        }

        let content = fs::read_to_string(chosen).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                chosen.display(),
                e
            ))
        })?;

        let mut config = self.parse_config(&content)?;

        // The top-level entry is a default for apps that leave theirs empty.
        if !config.entry.is_empty() {
            for app in &mut config.apps {
                if app.entry.is_empty() {
                    app.entry = config.entry.clone();
                }
            }
        }

        Ok(config)
    }

    /// Parse config from a JSON string. C-style comments are tolerated.
    pub fn parse_config(&self, content: &str) -> Result<Config> {
        let stripped = strip_json_comments(content);
        let config: Config = serde_json::from_str(&stripped)
            .map_err(|e| Error::Config(format!("failed to parse JSON config: {}", e)))?;

        Ok(config)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// The `*.local.json` sibling of a `*.json` config path.
fn local_sibling(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}.local.json", stem))
}

/// Strip `//` and `/* */` comments from a JSON document, preserving string
/// contents (including escaped quotes). Comment bytes are replaced with
/// spaces so serde error positions still line up with the source.
pub(crate) fn strip_json_comments(input: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        InString,
        InLineComment,
        InBlockComment,
    }

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut state = State::Normal;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        match state {
            State::Normal => match b {
                b'"' => {
                    state = State::InString;
                    out.push(b);
                }
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    state = State::InLineComment;
                    out.extend_from_slice(b"  ");
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    state = State::InBlockComment;
                    out.extend_from_slice(b"  ");
                    i += 1;
                }
                _ => out.push(b),
            },
            State::InString => match b {
                b'\\' => {
                    out.push(b);
                    if let Some(&next) = bytes.get(i + 1) {
                        out.push(next);
                        i += 1;
                    }
                }
                b'"' => {
                    state = State::Normal;
                    out.push(b);
                }
                _ => out.push(b),
            },
            State::InLineComment => {
                if b == b'\n' {
                    state = State::Normal;
                    out.push(b);
                } else {
                    out.push(b' ');
                }
            }
            State::InBlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = State::Normal;
                    out.extend_from_slice(b"  ");
                    i += 1;
                } else if b == b'\n' {
                    out.push(b);
                } else {
                    out.push(b' ');
                }
            }
        }

        i += 1;
    }

    String::from_utf8(out).unwrap_or_else(|_| input.to_string())
}
