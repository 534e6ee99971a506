//! Configuration Management
//!
//! This module handles loading and saving named connection profiles and server settings.
//!
//! # Configuration Locations
//! - Local: `.pgctl/config.json` (team-shareable, per-project)
//! - Global: `~/.config/pgctl/connections.json` (per-user)
//!
//! # Resolution Precedence
//! 1. Explicit connection parameters (highest priority)
//! 2. Local config file (`.pgctl/config.json`)
//! 3. Global config file (`~/.config/pgctl/connections.json`)
//!
//! Local connections replace global connections of the same name, and a local
//! `default` pointer wins over the global one.
//!
//! # Example
//! ```json
//! {
//!   "connections": {
//!     "local": { "host": "localhost", "port": 5432, "user": "postgres", "password_env": "PGPASSWORD" },
//!     "prod": { "host": "db.internal", "user": "admin", "password_env": "PROD_PW", "readonly": true }
//!   },
//!   "default": "local",
//!   "server": { "listen": "0.0.0.0:8432" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AdminError, Result};

/// Parameters needed to reach a server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Hostname
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port number (5432 when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password
    /// WARNING: Sensitive data, do not log or include in error messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Maintenance database to connect to (`postgres` when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl ConnectionConfig {
    /// Overlay explicitly given fields on top of `self`
    #[must_use]
    pub fn merged_with(mut self, explicit: &ConnectionConfig) -> Self {
        if explicit.host.is_some() {
            self.host.clone_from(&explicit.host);
        }
        if explicit.port.is_some() {
            self.port = explicit.port;
        }
        if explicit.user.is_some() {
            self.user.clone_from(&explicit.user);
        }
        if explicit.password.is_some() {
            self.password.clone_from(&explicit.password);
        }
        if explicit.database.is_some() {
            self.database.clone_from(&explicit.database);
        }
        self
    }
}

/// Stored connection profile
///
/// Wraps `ConnectionConfig` and supports an environment variable reference
/// for the password instead of storing it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredConnection {
    #[serde(flatten)]
    pub config: ConnectionConfig,

    /// Environment variable holding the password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Reject all create/update/delete operations through this connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

impl StoredConnection {
    /// Resolve environment variables and return the config plus the readonly flag
    pub fn resolve(&self) -> Result<(ConnectionConfig, bool)> {
        let mut config = self.config.clone();

        if let Some(env_var) = &self.password_env {
            match std::env::var(env_var) {
                Ok(password) => config.password = Some(password),
                Err(_) => {
                    return Err(AdminError::config_error(format!(
                        "Environment variable {env_var} not found for password"
                    )));
                }
            }
        }

        Ok((config, self.readonly.unwrap_or(false)))
    }
}

/// HTTP server and collection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address for `pgctl serve`
    pub listen: String,

    /// Deadline applied to every API request
    pub request_timeout_ms: u64,

    /// Fixed deadline for one metrics collection round
    pub metrics_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8432".to_string(),
            request_timeout_ms: 30_000,
            metrics_timeout_ms: 5_000,
        }
    }
}

impl ServerSettings {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn metrics_timeout(&self) -> Duration {
        Duration::from_millis(self.metrics_timeout_ms)
    }
}

/// Connection registry as stored in a config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionRegistry {
    /// Named connections
    #[serde(default)]
    pub connections: BTreeMap<String, StoredConnection>,

    /// Name of the default connection (must exist in `connections`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Server settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerSettings>,
}

impl ConnectionRegistry {
    /// Merge `overlay` on top of `self` (overlay wins per connection name)
    #[must_use]
    pub fn merged_with(mut self, overlay: ConnectionRegistry) -> Self {
        self.connections.extend(overlay.connections);
        if overlay.default.is_some() {
            self.default = overlay.default;
        }
        if overlay.server.is_some() {
            self.server = overlay.server;
        }
        self
    }

    /// Look up a connection by name, falling back to the default pointer
    pub fn resolve(&self, name: Option<&str>) -> Result<(ConnectionConfig, bool)> {
        let conn_name = match name {
            Some(n) => n.to_string(),
            None => self.default.clone().ok_or_else(|| {
                let available: Vec<_> = self.connections.keys().collect();
                AdminError::config_error(format!(
                    "No default connection set. Available connections: {available:?}. \
                     Specify one with --connection or set a default in the config."
                ))
            })?,
        };

        let stored = self.connections.get(&conn_name).ok_or_else(|| {
            let available: Vec<_> = self.connections.keys().collect();
            AdminError::config_error(format!(
                "Connection '{conn_name}' not found. Available connections: {available:?}"
            ))
        })?;

        stored.resolve()
    }

    /// Server settings, defaulted when absent
    #[must_use]
    pub fn server_settings(&self) -> ServerSettings {
        self.server.clone().unwrap_or_default()
    }
}

/// Configuration file location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLocation {
    /// Local config: `.pgctl/config.json` (team-shareable)
    Local,
    /// Global config: `~/.config/pgctl/connections.json` (per-user)
    Global,
}

/// Get path to local config file (`.pgctl/config.json`)
pub fn local_config_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir().map_err(|e| {
        AdminError::config_error(format!("Could not determine current directory: {e}"))
    })?;

    Ok(current_dir.join(".pgctl").join("config.json"))
}

/// Get path to global config file (`~/.config/pgctl/connections.json`)
pub fn global_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AdminError::config_error("Could not determine user config directory"))?;

    Ok(config_dir.join("pgctl").join("connections.json"))
}

/// Path of a config location
pub fn config_path(location: ConfigLocation) -> Result<PathBuf> {
    match location {
        ConfigLocation::Local => local_config_path(),
        ConfigLocation::Global => global_config_path(),
    }
}

/// Load a registry from `path`; a missing file is an empty registry
pub fn load_registry(path: &Path) -> Result<ConnectionRegistry> {
    if !path.exists() {
        return Ok(ConnectionRegistry::default());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| AdminError::config_error(format!("Could not read config file: {e}")))?;

    serde_json::from_str(&contents).map_err(|e| {
        AdminError::config_error(format!("Invalid config file format in {}: {e}", path.display()))
    })
}

/// Save a registry to `path`, creating parent directories
pub fn save_registry(path: &Path, registry: &ConnectionRegistry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            AdminError::config_error(format!("Could not create config directory: {e}"))
        })?;
    }

    let contents = serde_json::to_string_pretty(registry)
        .map_err(|e| AdminError::config_error(format!("Could not serialize config: {e}")))?;

    fs::write(path, contents)
        .map_err(|e| AdminError::config_error(format!("Could not write config file: {e}")))
}

/// Load the merged view: global first, then local on top
pub fn load_with_precedence() -> Result<ConnectionRegistry> {
    let global = load_registry(&global_config_path()?)?;
    let local = load_registry(&local_config_path()?)?;
    Ok(global.merged_with(local))
}

/// Resolve a connection by name (or the default) and overlay explicit parameters
///
/// With no stored profile and explicit parameters present, the explicit
/// parameters are used on their own.
pub fn resolve_connection(
    name: Option<&str>,
    explicit: &ConnectionConfig,
) -> Result<(ConnectionConfig, bool)> {
    let registry = load_with_precedence()?;

    if name.is_none() && registry.default.is_none() && explicit.host.is_some() {
        return Ok((explicit.clone(), false));
    }

    let (stored, readonly) = registry.resolve(name)?;
    Ok((stored.merged_with(explicit), readonly))
}

/// Save a connection profile
///
/// The first connection saved to a location becomes its default.
pub fn save_connection(
    name: &str,
    connection: StoredConnection,
    location: ConfigLocation,
) -> Result<()> {
    let path = config_path(location)?;
    let mut registry = load_registry(&path)?;

    let is_first_connection = registry.connections.is_empty();
    registry.connections.insert(name.to_string(), connection);
    if is_first_connection {
        registry.default = Some(name.to_string());
    }

    save_registry(&path, &registry)
}

/// List connection names with their (password-free) parameters
pub fn list_connections() -> Result<Vec<(String, ConnectionConfig, bool)>> {
    let registry = load_with_precedence()?;

    Ok(registry
        .connections
        .into_iter()
        .map(|(name, stored)| {
            let mut config = stored.config;
            config.password = None;
            (name, config, stored.readonly.unwrap_or(false))
        })
        .collect())
}
