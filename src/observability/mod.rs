use std::net::IpAddr;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Install the global tracing subscriber for the configured log level.
///
/// `DISABLED` installs nothing. The remaining level names follow the config
/// file's convention, so `WARNING` and `CRITICAL` are translated to the
/// tracing levels `WARN` and `ERROR` before building the filter.
pub fn init_tracing(log_level: &str) {
    let level = log_level.to_uppercase();
    if level == "DISABLED" {
        return;
    }

    let directive = match level.as_str() {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("INFO"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// One access-log line per finished request. `target` is the resolved
/// upstream URL, or `-` for requests the proxy answered itself.
pub fn log_request_complete(
    request_id: Uuid,
    status: http::StatusCode,
    method: &http::Method,
    path: &str,
    target: &str,
    latency: Duration,
    client_ip: IpAddr,
) {
    tracing::info!(
        request_id = %request_id,
        status = status.as_u16(),
        method = %method,
        path,
        target,
        latency_ms = latency.as_millis() as u64,
        client_ip = %client_ip,
        "request completed"
    );
}
