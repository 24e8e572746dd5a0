//! Configuration management

use std::{collections::HashSet, env, path::Path, time::Duration};

use authority_core::{ClientAuthenticationMethod, GrantType};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Longest access or refresh token lifetime a client may configure.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(10 * 365 * 86_400);

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Issuer identifier placed in `iss` and checked on jwt-bearer assertions
    pub issuer: String,
    /// Signing key configuration
    pub keys: KeysConfig,
    /// Authorization record configuration
    pub authorizations: AuthorizationsConfig,
    /// Registered clients
    pub clients: Vec<ClientConfig>,
    /// Seeded resource owners
    pub users: Vec<UserConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            server: ServerConfig::default(),
            issuer: "http://127.0.0.1:9000".to_string(),
            keys: KeysConfig::default(),
            authorizations: AuthorizationsConfig::default(),
            clients: Vec::new(),
            users: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // TOKEN_AUTHORITY_KEYS__ENCRYPTION__SECRET=... etc.
        figment = figment.merge(Env::prefixed("TOKEN_AUTHORITY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} in secret-bearing fields
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.issuer = expand_string(&re, &self.issuer);
        self.keys.store.path = expand_string(&re, &self.keys.store.path);
        self.authorizations.store.path = expand_string(&re, &self.authorizations.store.path);
        self.keys.encryption.secret = expand_string(&re, &self.keys.encryption.secret);
        self.keys.encryption.salt = expand_string(&re, &self.keys.encryption.salt);

        for client in &mut self.clients {
            if let Some(secret) = client.client_secret.as_mut() {
                *secret = expand_string(&re, secret);
            }
        }
        for user in &mut self.users {
            user.password = expand_string(&re, &user.password);
        }
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.issuer)
            .map_err(|e| Error::Config(format!("issuer '{}' is not a URL: {e}", self.issuer)))?;

        if self.keys.encryption.resolve_secret().is_empty() {
            return Err(Error::Config(
                "keys.encryption.secret must be set (literal, env:VAR or ${VAR})".to_string(),
            ));
        }
        if self.keys.rotation_window.is_zero() || self.keys.check_interval.is_zero() {
            return Err(Error::Config(
                "keys.rotation_window and keys.check_interval must be non-zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for client in &self.clients {
            if !seen.insert(client.client_id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate client_id '{}'",
                    client.client_id
                )));
            }
            if client.authentication_method == ClientAuthenticationMethod::ClientSecretBasic
                && client.client_secret.as_deref().is_none_or(str::is_empty)
            {
                return Err(Error::Config(format!(
                    "client '{}' uses client_secret_basic but has no client_secret",
                    client.client_id
                )));
            }
            for (name, ttl) in [
                ("access_token_ttl", client.access_token_ttl),
                ("refresh_token_ttl", client.refresh_token_ttl),
            ] {
                if ttl.is_zero() || ttl > MAX_TOKEN_TTL {
                    return Err(Error::Config(format!(
                        "client '{}' {name} must be between 1s and {}d",
                        client.client_id,
                        MAX_TOKEN_TTL.as_secs() / 86_400
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if !seen.insert(user.username.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate username '{}'",
                    user.username
                )));
            }
        }
        Ok(())
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024,
        }
    }
}

/// Signing key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Where key rows live
    pub store: KeyStoreConfig,
    /// At-rest encryption of private keys
    pub encryption: KeyEncryptionConfig,
    /// Age at which the active key is replaced
    #[serde(with = "humantime_serde")]
    pub rotation_window: Duration,
    /// How often the rotator inspects the active key
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            store: KeyStoreConfig::default(),
            encryption: KeyEncryptionConfig::default(),
            rotation_window: default_rotation_window(),
            check_interval: default_check_interval(),
        }
    }
}

fn default_rotation_window() -> Duration {
    Duration::from_secs(30 * 86_400)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(86_400)
}

/// Storage backend for keys and authorizations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Process memory; contents are lost on restart
    Memory,
    /// Files under `path`
    #[default]
    File,
}

/// Key store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    /// Backend
    pub kind: StoreKind,
    /// Directory for the file backend
    pub path: String,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::File,
            path: "data/keys".to_string(),
        }
    }
}

/// Private key encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyEncryptionConfig {
    /// Secret (supports `env:VAR_NAME`)
    pub secret: String,
    /// Salt
    pub salt: String,
}

impl Default for KeyEncryptionConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            salt: "token-authority".to_string(),
        }
    }
}

impl KeyEncryptionConfig {
    /// Resolve the secret (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_secret(&self) -> String {
        if let Some(var_name) = self.secret.strip_prefix("env:") {
            env::var(var_name).unwrap_or_default()
        } else {
            self.secret.clone()
        }
    }
}

/// Authorization record configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationsConfig {
    /// Backend
    pub store: AuthorizationStoreConfig,
    /// How often spent authorizations are dropped
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for AuthorizationsConfig {
    fn default() -> Self {
        Self {
            store: AuthorizationStoreConfig::default(),
            reap_interval: Duration::from_secs(300),
        }
    }
}

/// Authorization store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationStoreConfig {
    /// Backend
    pub kind: StoreKind,
    /// Snapshot file for the file backend
    pub path: String,
}

impl Default for AuthorizationStoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::File,
            path: "data/authorizations.json".to_string(),
        }
    }
}

/// Registered client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client identifier
    pub client_id: String,
    /// Secret: plaintext, `${VAR}`, or an argon2 PHC hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// How the client authenticates
    #[serde(default)]
    pub authentication_method: ClientAuthenticationMethod,
    /// Allowed grants
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<GrantType>,
    /// Allowed scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Access token lifetime
    #[serde(with = "humantime_serde", default = "default_access_token_ttl")]
    pub access_token_ttl: Duration,
    /// Refresh token lifetime
    #[serde(with = "humantime_serde", default = "default_refresh_token_ttl")]
    pub refresh_token_ttl: Duration,
    /// Keep the same refresh token across exchanges
    #[serde(default)]
    pub reuse_refresh_tokens: bool,
    /// Token endpoint requests per minute (0 = unlimited)
    #[serde(default)]
    pub rate_limit: u32,
}

fn default_grant_types() -> Vec<GrantType> {
    vec![GrantType::Password, GrantType::RefreshToken]
}

fn default_access_token_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_refresh_token_ttl() -> Duration {
    Duration::from_secs(86_400)
}

/// Seeded resource owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Login name
    pub username: String,
    /// Password: plaintext, `${VAR}`, or an argon2 PHC hash
    pub password: String,
    /// Roles (`ROLE_*`) and permissions
    #[serde(default)]
    pub authorities: Vec<String>,
    /// Disabled users cannot authenticate
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string ("100ms", "30s", "5m", "12h", "30d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string. A bare number is seconds.
    ///
    /// # Errors
    ///
    /// Returns a message when the number or the unit is invalid.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" before "s" and "m"
        let (number, scale): (&str, Option<u64>) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, None)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, Some(1))
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, Some(60))
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, Some(3600))
        } else if let Some(days) = s.strip_suffix('d') {
            (days, Some(86_400))
        } else {
            (s, Some(1))
        };

        let value = number
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{s}': {e}"))?;
        match scale {
            None => Ok(Duration::from_millis(value)),
            Some(factor) => value
                .checked_mul(factor)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration '{s}' overflows")),
        }
    }
}
