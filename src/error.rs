/// Error type for everything the proxy surfaces itself.
///
/// Conversion failures never land here: the converter, the model rewriter
/// and the stream transcoder all fall open and forward original bytes.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid token")]
    InvalidToken,
    #[error("IP not allowed")]
    IpNotAllowed,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Route not found")]
    RouteNotFound,
    #[error("Upstream transport error: {0}")]
    Transport(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    #[must_use]
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            ProxyError::InvalidToken => http::StatusCode::UNAUTHORIZED,
            ProxyError::IpNotAllowed => http::StatusCode::FORBIDDEN,
            ProxyError::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
            ProxyError::RouteNotFound => http::StatusCode::NOT_FOUND,
            ProxyError::Transport(_) => http::StatusCode::BAD_GATEWAY,
            ProxyError::Config(_) | ProxyError::Internal(_) => {
                http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Format an error as (`status_code`, JSON body). The body shape is the
/// proxy's own `{"error": "..."}`; upstream error bodies are never
/// reformatted, they stream back verbatim.
#[must_use]
pub fn format_error(err: &ProxyError) -> (http::StatusCode, serde_json::Value) {
    (
        err.status_code(),
        serde_json::json!({ "error": err.to_string() }),
    )
}

impl axum::response::IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}
