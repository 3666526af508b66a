/// `load_config` module: Loads a static YAML config and resolves the target server, injecting secrets from the environment.
///
/// This module is the only place where untrusted YAML is parsed and mapped to typed structs.
///
/// # Responsibilities
/// - Parse the YAML file listing named servers, the default server and publish polling settings
/// - Pick the server named by `--server`, else the file's `default_server`
/// - Inject credentials from `SITE_INDEXER_TOKEN` (bearer) or `SITE_INDEXER_PASSWORD` (basic);
///   secrets never live in the file
///
/// # Errors
/// All errors use `anyhow::Error` and are surfaced at the CLI boundary.
///
/// Example:
///
/// ```yaml
/// default_server: dev
/// servers:
///   dev:
///     url: https://content.example.com
///     username: indexer
/// publish:
///   poll_interval_secs: 5
///   timeout_secs: 1800
/// ```
use anyhow::{anyhow, Result};
use serde::Deserialize;
use site_indexer_core::config::{DEFAULT_POLL_INTERVAL, DEFAULT_PUBLISH_TIMEOUT};
use site_indexer_core::proxy::RemoteRoutes;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

pub const TOKEN_ENV: &str = "SITE_INDEXER_TOKEN";
pub const PASSWORD_ENV: &str = "SITE_INDEXER_PASSWORD";

#[derive(Debug, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub default_server: Option<String>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerSection>,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub routes: Option<RoutesSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishSection {
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PublishSection {
    fn default() -> Self {
        PublishSection {
            poll_interval_secs: default_poll_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl PublishSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_poll_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_PUBLISH_TIMEOUT.as_secs()
}

/// Overrides of the remote API roots; unset roots keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutesSection {
    pub documents_api: Option<String>,
    pub content_api: Option<String>,
    pub sites_api: Option<String>,
}

impl CliConfig {
    pub fn routes(&self) -> RemoteRoutes {
        let mut routes = RemoteRoutes::default();
        if let Some(section) = &self.routes {
            if let Some(root) = &section.documents_api {
                routes.documents_api = root.clone();
            }
            if let Some(root) = &section.content_api {
                routes.content_api = root.clone();
            }
            if let Some(root) = &section.sites_api {
                routes.sites_api = root.clone();
            }
        }
        routes
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum ServerAuth {
    Basic { username: String, password: String },
    Bearer(String),
}

impl ServerAuth {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerAuth::Basic { .. } => "basic",
            ServerAuth::Bearer(_) => "bearer",
        }
    }
}

impl std::fmt::Debug for ServerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            ServerAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// A server from the config with its credentials resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub url: String,
    pub auth: ServerAuth,
}

/// Loads a static YAML config file (no secrets).
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    if config.servers.is_empty() {
        error!(config_path = ?path_ref, "Config lists no servers");
        return Err(anyhow!("Config file {:?} lists no servers", path_ref));
    }
    Ok(config)
}

/// Picks the named server (or the default one) and injects its credentials from the environment.
pub fn resolve_server(config: &CliConfig, name: Option<&str>) -> Result<ServerConfig> {
    let name = match name.or(config.default_server.as_deref()) {
        Some(name) => name.to_string(),
        None if config.servers.len() == 1 => config.servers.keys().next().cloned().unwrap_or_default(),
        None => {
            return Err(anyhow!(
                "No --server given and the config has no default_server (known servers: {})",
                known(config)
            ))
        }
    };
    let section = config.servers.get(&name).ok_or_else(|| {
        error!(server = %name, "Server not found in config");
        anyhow!("Server {name} is not registered (known servers: {})", known(config))
    })?;

    let auth = match (env::var(TOKEN_ENV), env::var(PASSWORD_ENV), &section.username) {
        (Ok(token), _, _) if !token.is_empty() => ServerAuth::Bearer(token),
        (_, Ok(password), Some(username)) => ServerAuth::Basic {
            username: username.clone(),
            password,
        },
        (_, Ok(_), None) => {
            return Err(anyhow!(
                "{PASSWORD_ENV} is set but server {name} has no username in the config"
            ))
        }
        _ => {
            error!(server = %name, "No credentials in environment");
            return Err(anyhow!(
                "Set {TOKEN_ENV} or {PASSWORD_ENV} to authenticate against server {name}"
            ));
        }
    };

    info!(server = %name, url = %section.url, auth = auth.kind(), "Resolved target server");
    Ok(ServerConfig {
        name,
        url: section.url.clone(),
        auth,
    })
}

fn known(config: &CliConfig) -> String {
    config.servers.keys().cloned().collect::<Vec<_>>().join(", ")
}
