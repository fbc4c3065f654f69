//! Configuration types and loading logic.

use std::collections::BTreeMap;
use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use gatehouse_tracing::TracingConfig;
use http::header::{HeaderName, HeaderValue};
use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub backends: BackendsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Paths under this prefix are served by the proxy itself (health,
    /// stats) and never forwarded.
    #[serde(default = "default_admin_prefix")]
    pub admin_prefix: String,

    /// Bind `{admin_prefix}/stats`. It bypasses the gate and lists every
    /// backend target, so it is off unless asked for.
    #[serde(default)]
    pub expose_stats: bool,
}

/// Backend pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendsConfig {
    /// `scheme://host[:port]` entries, rotated in this order.
    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Total per-request timeout including the body. Unset by default so
    /// long or slow bodies are relayed in full.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// How requests are authorized before they are forwarded.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Ask an external authorization service over HTTP.
    #[default]
    Http,
    /// Evaluate a local policy file.
    Policy,
    /// No gate: every request is forwarded.
    Disabled,
}

/// Authorization gate configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,

    /// Authorization endpoint, e.g. `http://auth-service:8001/verify`.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,

    /// Inbound header that carries the caller's identity.
    #[serde(default = "default_identity_header")]
    pub identity_header: String,

    /// Header names used on the authorization call.
    #[serde(default)]
    pub headers: AuthHeaderNames,

    /// Static headers added to every authorization call.
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,

    /// Inbound headers copied onto the authorization call (e.g. `authorization`).
    #[serde(default)]
    pub forward_request_headers: Vec<String>,

    /// Rule file for `mode = "policy"`.
    #[serde(default)]
    pub policy_file: Option<PathBuf>,
}

/// Names of the three mandatory headers sent to the authorization service.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthHeaderNames {
    #[serde(default = "default_user_header")]
    pub user: String,
    #[serde(default = "default_path_header")]
    pub path: String,
    #[serde(default = "default_method_header")]
    pub method: String,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_prefix() -> String {
    "/_gatehouse".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_auth_timeout() -> u64 {
    5
}

fn default_identity_header() -> String {
    "x-user-id".to_string()
}

fn default_user_header() -> String {
    "x-original-user".to_string()
}

fn default_path_header() -> String {
    "x-original-path".to_string()
}

fn default_method_header() -> String {
    "x-original-method".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            admin_prefix: default_admin_prefix(),
            expose_stats: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            url: None,
            timeout_secs: default_auth_timeout(),
            identity_header: default_identity_header(),
            headers: AuthHeaderNames::default(),
            extra_headers: BTreeMap::new(),
            forward_request_headers: Vec::new(),
            policy_file: None,
        }
    }
}

impl Default for AuthHeaderNames {
    fn default() -> Self {
        Self {
            user: default_user_header(),
            path: default_path_header(),
            method: default_method_header(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (GATEHOUSE_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(config_path))
                .merge(Env::prefixed("GATEHOUSE_").split("__")),
        )
    }

    /// Extract and validate. Fails on anything that would otherwise only
    /// surface at request time.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: ProxyConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.targets.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        let prefix = &self.server.admin_prefix;
        if !prefix.starts_with('/') || prefix.ends_with('/') {
            return Err(ConfigError::InvalidAdminPrefix(self.server.admin_prefix.clone()));
        }

        match self.auth.mode {
            AuthMode::Http if self.auth.url.is_none() => return Err(ConfigError::MissingAuthUrl),
            AuthMode::Policy if self.auth.policy_file.is_none() => {
                return Err(ConfigError::MissingPolicyFile)
            }
            _ => {}
        }

        header_name(&self.auth.identity_header)?;
        header_name(&self.auth.headers.user)?;
        header_name(&self.auth.headers.path)?;
        header_name(&self.auth.headers.method)?;
        for name in &self.auth.forward_request_headers {
            header_name(name)?;
        }
        for (name, value) in &self.auth.extra_headers {
            header_name(name)?;
            header_value(name, value)?;
        }

        Ok(())
    }
}

/// Parse a configured header name.
pub fn header_name(raw: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::try_from(raw.trim()).map_err(|e| ConfigError::InvalidHeader {
        name: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a configured header value for header `name`.
pub fn header_value(name: &str, raw: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::try_from(raw).map_err(|e| ConfigError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })
}
