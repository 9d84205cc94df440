//! Client (`rbuild.toml`) and server (`rbuild-server.toml`) configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::core::decision::ReconcilePolicy;

pub const CLIENT_CONFIG_FILE: &str = "rbuild.toml";
pub const SERVER_CONFIG_FILE: &str = "rbuild-server.toml";
pub const DEFAULT_PORT: u16 = 8751;
pub const DEFAULT_RUNTIME_DIR: &str = ".rbuild";

/// Client configuration (TOML).
///
/// Missing fields default so that a project without a config file talks to a
/// server on the same machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the build server.
    pub server_url: String,

    /// Timeout for short requests (state, actions, status). Streams are unbounded.
    pub request_timeout_secs: u64,

    /// Runtime directory relative to the project root.
    pub runtime_dir: String,

    pub reconcile: ReconcilePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("http://127.0.0.1:{DEFAULT_PORT}"),
            request_timeout_secs: 30,
            runtime_dir: DEFAULT_RUNTIME_DIR.to_string(),
            reconcile: ReconcilePolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        let url = self.server_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow!(
                "server_url must start with http:// or https://, got '{}'",
                self.server_url
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be > 0"));
        }
        validate_runtime_dir(&self.runtime_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Server configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,

    /// Runtime directory relative to the project root.
    pub runtime_dir: String,

    /// Upper bound on a `POST /jobs` request body.
    pub max_upload_bytes: usize,

    /// How long a build waits for its live viewer before running unwatched.
    pub stream_attach_timeout_secs: u64,

    pub build: BuildConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            runtime_dir: DEFAULT_RUNTIME_DIR.to_string(),
            max_upload_bytes: 256 * 1024 * 1024,
            stream_attach_timeout_secs: 30,
            build: BuildConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            return Err(anyhow!("bind must not be empty"));
        }
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be > 0"));
        }
        validate_runtime_dir(&self.runtime_dir)?;
        self.build.validate()
    }

    pub fn stream_attach_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_attach_timeout_secs)
    }
}

/// What the server runs for a build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    /// Scheme substituted for `{scheme}`; detected from the project when unset.
    #[serde(deserialize_with = "blank_as_none")]
    pub scheme: Option<String>,

    /// Argument vector; `{scheme}` is replaced in every element.
    pub command: Vec<String>,

    /// Kill the build after this many seconds; 0 disables the limit.
    pub timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            scheme: None,
            command: [
                "xcodebuild",
                "-scheme",
                "{scheme}",
                "-destination",
                "generic/platform=iOS Simulator",
                "build",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            timeout_secs: 0,
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<()> {
        match self.command.first() {
            Some(program) if !program.trim().is_empty() => {}
            _ => return Err(anyhow!("build.command must be a non-empty array")),
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// The command with `{scheme}` filled in, using `project_root` to detect
    /// the scheme when none is configured.
    pub fn resolved_command(&self, project_root: &Path) -> Result<Vec<String>> {
        let scheme = match &self.scheme {
            Some(s) => s.clone(),
            None => detect_scheme(project_root)?,
        };
        Ok(self
            .command
            .iter()
            .map(|arg| arg.replace("{scheme}", &scheme))
            .collect())
    }
}

/// Stem of the first `*.xcodeproj` (by name) in `project_root`, else the
/// directory's own name.
pub fn detect_scheme(project_root: &Path) -> Result<String> {
    let entries = fs::read_dir(project_root)
        .with_context(|| format!("read directory {}", project_root.display()))?;
    let mut projects: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("read directory {}", project_root.display()))?
            .path();
        if path.extension().is_some_and(|ext| ext == "xcodeproj") {
            projects.push(path);
        }
    }
    projects.sort();
    if let Some(stem) = projects
        .first()
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
    {
        return Ok(stem.to_string());
    }

    let root = project_root
        .canonicalize()
        .with_context(|| format!("canonicalize {}", project_root.display()))?;
    root.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("cannot derive a scheme from {}", root.display()))
}

fn validate_runtime_dir(dir: &str) -> Result<()> {
    let trimmed = dir.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("runtime_dir must not be empty"));
    }
    if Path::new(trimmed).is_absolute() || trimmed.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(anyhow!(
            "runtime_dir must be a relative path inside the project, got '{dir}'"
        ));
    }
    Ok(())
}

/// Load client config from a TOML file; a missing file yields the defaults.
pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    let cfg: ClientConfig = load_toml(path)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Load server config from a TOML file; a missing file yields the defaults.
pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let cfg: ServerConfig = load_toml(path)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

fn load_toml<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Treats `scheme = ""` in hand-edited files as "not set".
fn blank_as_none<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let value = Option::<String>::deserialize(de)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}
