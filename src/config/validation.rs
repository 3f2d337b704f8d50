use super::{AppConfig, ConfigError, RoutesConfig};

use std::collections::HashSet;

/// Check every semantic rule the app config must satisfy.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] naming the first rule that fails.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_routing_config(config)?;
    validate_client_auth(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be at least 1",
        ));
    }

    // Optional tuning knobs: unset means auto, zero is never meaningful.
    let optional_nonzero = [
        (
            "server.runtime_worker_threads",
            server.runtime_worker_threads,
        ),
        (
            "server.runtime_max_blocking_threads",
            server.runtime_max_blocking_threads,
        ),
        (
            "server.runtime_thread_stack_size_kb",
            server.runtime_thread_stack_size_kb,
        ),
        (
            "server.tcp_reuse_port_listener_count",
            server.tcp_reuse_port_listener_count,
        ),
    ];
    for (key, value) in optional_nonzero {
        if value == Some(0) {
            return Err(validation_err(format!("{key} must be at least 1 when set")));
        }
    }
    Ok(())
}

fn validate_routing_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.routing.routes_file.trim().is_empty() {
        return Err(validation_err("routing.routes_file cannot be empty"));
    }
    Ok(())
}

/// Minimum length for the shared client token. Anything shorter is refused
/// at startup rather than silently accepted.
const MIN_TOKEN_KEY_LEN: usize = 16;

fn validate_client_auth(config: &AppConfig) -> Result<(), ConfigError> {
    let auth = &config.client_authentication;

    if let Some(token_key) = auth.token_key.as_deref() {
        let token_key = token_key.trim();
        if token_key.len() < MIN_TOKEN_KEY_LEN {
            return Err(validation_err(format!(
                "client_authentication.token_key must be at least {MIN_TOKEN_KEY_LEN} characters"
            )));
        }
        match auth.token_header.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(validation_err(
                    "client_authentication.token_header is required when token_key is set",
                ));
            }
            Some(_) => {}
        }
    }

    for rule in &auth.ip_whitelist {
        let rule = rule.trim();
        if rule.is_empty() {
            return Err(validation_err(
                "client_authentication.ip_whitelist contains an empty entry",
            ));
        }
        let is_cidr = rule.parse::<ipnet::IpNet>().is_ok();
        let is_bare_ip = rule.parse::<std::net::IpAddr>().is_ok();
        if !is_cidr && !is_bare_ip {
            return Err(validation_err(format!(
                "client_authentication.ip_whitelist entry '{rule}' is not an IP or CIDR"
            )));
        }
    }

    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    const LEVELS: [&str; 6] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    let configured = config.features.log_level.to_uppercase();
    if !LEVELS.contains(&configured.as_str()) {
        return Err(validation_err(format!("log_level must be one of {LEVELS:?}")));
    }
    Ok(())
}

/// Top path segments served by the proxy itself, never routable.
pub const RESERVED_PREFIXES: &[&str] = &["/api"];

/// Validate a routes file, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any route invariant is violated.
pub fn validate_routes(routes: &RoutesConfig) -> Result<(), ConfigError> {
    let mut seen_paths = HashSet::new();

    for route in &routes.routes {
        let label = if route.name.is_empty() {
            &route.path
        } else {
            &route.name
        };

        if !route.path.starts_with('/') || route.path.len() < 2 {
            return Err(validation_err(format!(
                "Route '{label}': path must be a non-empty prefix starting with '/'"
            )));
        }
        if route.path[1..].contains('/') {
            return Err(validation_err(format!(
                "Route '{label}': path must be a single segment, got '{}'",
                route.path
            )));
        }
        if RESERVED_PREFIXES.contains(&route.path.as_str()) {
            return Err(validation_err(format!(
                "Route '{label}': path '{}' is reserved",
                route.path
            )));
        }
        if !seen_paths.insert(route.path.clone()) {
            return Err(validation_err(format!(
                "Duplicate route path '{}'",
                route.path
            )));
        }

        let parsed = url::Url::parse(&route.target).map_err(|err| {
            validation_err(format!("Route '{label}': target is not a valid URL: {err}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(validation_err(format!(
                "Route '{label}': target must use http:// or https://"
            )));
        }

        for (public_name, upstream_name) in &route.model_map {
            if public_name.trim().is_empty() || upstream_name.trim().is_empty() {
                return Err(validation_err(format!(
                    "Route '{label}': model_map entries cannot be empty"
                )));
            }
        }
    }

    Ok(())
}
