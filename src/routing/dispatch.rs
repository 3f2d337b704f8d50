use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{self, Body};
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::{health, proxy, routes};
use crate::auth;
use crate::error::ProxyError;
use crate::observability;
use crate::routing::split_first_segment;
use crate::state::AppState;

// Request bodies are buffered for conversion and rewriting; cap the buffer.
const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

enum RouteMatch<'a> {
    ServiceStatus,
    RoutesList,
    Proxied {
        first_segment: &'a str,
        sub_path: &'a str,
    },
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request: authenticate, match it to a meta endpoint or
/// a configured route, and hand proxied requests to the forwarding pipeline.
///
/// # Errors
///
/// Infallible in practice; failures surface as HTTP error responses instead.
pub async fn dispatch_request(
    state: Arc<AppState>,
    remote_addr: SocketAddr,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let started = Instant::now();
    let (parts, request_body) = request.into_parts();
    let request_id = state.next_request_id();
    let client_ip = auth::client_ip(
        remote_addr,
        &parts.headers,
        state.config.server.trust_forwarded_headers,
    );

    // Resolved upstream URL; "-" for everything the proxy answers itself.
    let mut target = String::from("-");

    let response = match state.authorize(client_ip, &parts.headers) {
        Err(error) => error.into_response(),
        Ok(()) => match match_route(&parts.method, parts.uri.path()) {
            RouteMatch::ServiceStatus => health::handler(State(Arc::clone(&state))).into_response(),
            RouteMatch::RoutesList => routes::handler(State(Arc::clone(&state))).into_response(),
            RouteMatch::Proxied {
                first_segment,
                sub_path,
            } => match state.lookup_route(first_segment) {
                None => ProxyError::RouteNotFound.into_response(),
                Some(route) => match read_request_body(request_body).await {
                    Err(response) => response,
                    Ok(body_bytes) => {
                        let outcome =
                            proxy::handler(&state, &parts, &route, sub_path, body_bytes, request_id)
                                .await;
                        target = outcome.target;
                        outcome.response
                    }
                },
            },
            RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
            RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
        },
    };

    if state.config.features.access_log {
        observability::log_request_complete(
            request_id,
            response.status(),
            &parts.method,
            parts.uri.path(),
            &target,
            started.elapsed(),
            client_ip,
        );
    }

    Ok(response)
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    match body::to_bytes(body, BODY_LIMIT_BYTES).await {
        Ok(bytes) => Ok(bytes),
        Err(_) => {
            let reply = (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body exceeds the 2MiB limit",
            );
            Err(reply.into_response())
        }
    }
}

fn match_route<'a>(method: &Method, path: &'a str) -> RouteMatch<'a> {
    let (first_segment, sub_path) = split_first_segment(path);

    // `/api` is reserved for the proxy's own endpoints, never forwarded.
    if first_segment == "api" {
        return match sub_path {
            "" | "/" => {
                if method == Method::GET {
                    RouteMatch::ServiceStatus
                } else {
                    RouteMatch::MethodNotAllowed
                }
            }
            "/routes" | "/routes/" => {
                if method == Method::GET {
                    RouteMatch::RoutesList
                } else {
                    RouteMatch::MethodNotAllowed
                }
            }
            _ => RouteMatch::NotFound,
        };
    }

    RouteMatch::Proxied {
        first_segment,
        sub_path,
    }
}
