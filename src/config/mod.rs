pub mod validation;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use self::validation::{validate_config, validate_routes};

/// Everything that can go wrong while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Request/response transformation applied on a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransformMode {
    #[default]
    None,
    ResponsesToChat,
}

impl fmt::Display for TransformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformMode::None => write!(f, "none"),
            TransformMode::ResponsesToChat => write!(f, "responses_to_chat"),
        }
    }
}

/// One proxied upstream, reached through its URL path prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Path prefix, e.g. `/zhipu`. Matched against the first path segment.
    pub path: String,
    /// Upstream base URL the stripped path is appended to.
    pub target: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Public model name -> upstream model name.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub model_map: FxHashMap<String, String>,
    #[serde(default)]
    pub transform: TransformMode,
}

/// Contents of the routes file (`{"routes": [...]}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutesConfig {
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_max_blocking_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_thread_stack_size_kb: Option<usize>,
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    #[serde(default)]
    pub http_use_env_proxy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_reuse_port_listener_count: Option<usize>,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize)]
struct ServerConfigWire {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    http_pool_idle_timeout_secs: u64,
    #[serde(default)]
    runtime_worker_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    runtime_max_blocking_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    runtime_thread_stack_size_kb: Option<usize>,
    #[serde(default)]
    trust_forwarded_headers: bool,
    #[serde(default)]
    http_use_env_proxy: bool,
    #[serde(default)]
    tcp_reuse_port_listener_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuntimeThreadsSetting {
    Fixed(usize),
    Auto(()),
}

fn runtime_threads_or_default(
    setting: Option<&RuntimeThreadsSetting>,
    default: Option<usize>,
) -> Option<usize> {
    match setting {
        None => default,
        Some(RuntimeThreadsSetting::Fixed(threads)) => Some(*threads),
        Some(RuntimeThreadsSetting::Auto(())) => None,
    }
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = ServerConfigWire::deserialize(deserializer)?;
        Ok(Self {
            port: wire.port,
            host: wire.host,
            timeout: wire.timeout,
            http_pool_max_idle_per_host: wire.http_pool_max_idle_per_host,
            http_pool_idle_timeout_secs: wire.http_pool_idle_timeout_secs,
            // absent key => default, explicit null => auto (None)
            runtime_worker_threads: runtime_threads_or_default(
                wire.runtime_worker_threads.as_ref(),
                None,
            ),
            runtime_max_blocking_threads: runtime_threads_or_default(
                wire.runtime_max_blocking_threads.as_ref(),
                Some(8),
            ),
            runtime_thread_stack_size_kb: wire.runtime_thread_stack_size_kb,
            trust_forwarded_headers: wire.trust_forwarded_headers,
            http_use_env_proxy: wire.http_use_env_proxy,
            tcp_reuse_port_listener_count: wire.tcp_reuse_port_listener_count,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: Some(8),
            runtime_thread_stack_size_kb: None,
            trust_forwarded_headers: false,
            http_use_env_proxy: false,
            tcp_reuse_port_listener_count: None,
        }
    }
}

/// Where the routes file lives and whether to watch it for changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_routes_file")]
    pub routes_file: String,
    #[serde(default = "default_true")]
    pub watch: bool,
}

fn default_routes_file() -> String {
    "routes.json".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            routes_file: default_routes_file(),
            watch: true,
        }
    }
}

/// Client authentication configuration. Both gates are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    /// CIDR rules; a bare IP means just that host.
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    /// Header the shared token is read from, e.g. `X-Api-Token`.
    #[serde(default)]
    pub token_header: Option<String>,
    #[serde(default)]
    pub token_key: Option<String>,
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub access_log: bool,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            access_log: true,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub client_authentication: ClientAuthConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Read the YAML config file at `path` and run it through validation.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Yaml`]
/// if it does not parse, or [`ConfigError::Validation`] if a semantic rule fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load the routes file (JSON) and validate it. Used at startup and again on
/// every hot reload; a failing reload keeps the previous snapshot.
///
/// # Errors
///
/// Returns [`ConfigError::Io`], [`ConfigError::Json`] or
/// [`ConfigError::Validation`] mirroring [`load_config`].
pub fn load_routes_config(path: &str) -> Result<RoutesConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let routes: RoutesConfig = serde_json::from_str(&contents)?;
    validate_routes(&routes)?;
    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        // The shipped example must stay loadable by a fresh checkout.
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.server.port, 8000);
        assert!(!config.server.http_use_env_proxy);
        assert!(config.server.tcp_reuse_port_listener_count.is_none());
        assert_eq!(config.server.http_pool_max_idle_per_host, 16);
        assert_eq!(config.routing.routes_file, "routes.json");
        assert!(config.routing.watch);
        assert!(config.client_authentication.token_key.is_none());
        assert!(config.features.access_log);
    }

    #[test]
    fn test_load_example_routes() {
        let routes = load_routes_config("routes.example.json");
        assert!(
            routes.is_ok(),
            "Failed to load example routes: {:?}",
            routes.err()
        );
        let routes = routes.unwrap();
        assert!(routes.routes.len() >= 2);
        assert!(routes
            .routes
            .iter()
            .any(|route| route.transform == TransformMode::ResponsesToChat));
    }

    #[test]
    fn test_transform_mode_default() {
        assert_eq!(TransformMode::default(), TransformMode::None);
    }

    #[test]
    fn test_transform_mode_serde() {
        let json = serde_json::to_string(&TransformMode::ResponsesToChat).unwrap();
        assert_eq!(json, "\"responses_to_chat\"");
        let mode: TransformMode = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(mode, TransformMode::None);
        assert!(serde_json::from_str::<TransformMode>("\"reponses_to_chat\"").is_err());
    }

    #[test]
    fn test_route_defaults() {
        let route: Route = serde_json::from_str(
            r#"{"path": "/zhipu", "target": "https://api.z.ai/api/paas/v4"}"#,
        )
        .unwrap();
        assert_eq!(route.transform, TransformMode::None);
        assert!(route.model_map.is_empty());
        assert!(route.name.is_empty());
    }

    #[test]
    fn test_server_config_runtime_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.runtime_worker_threads, None);
        assert_eq!(server.runtime_max_blocking_threads, Some(8));
        assert_eq!(server.runtime_thread_stack_size_kb, None);
        assert!(!server.trust_forwarded_headers);
    }

    #[test]
    fn test_runtime_threads_explicit_null_means_auto() {
        let yaml = "port: 9000\nruntime_max_blocking_threads: null\n";
        let server: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(server.port, 9000);
        assert_eq!(server.runtime_max_blocking_threads, None);

        let yaml = "port: 9000\n";
        let server: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(server.runtime_max_blocking_threads, Some(8));
    }
}
