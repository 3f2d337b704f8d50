//! Forwarding pipeline for proxied routes.
//!
//! A request passes through up to four stages: Responses-to-Chat request
//! conversion (transform routes only), model name rewriting, the upstream
//! round trip, and, for streaming replies on transform routes, SSE
//! transcoding back into Responses events. Every stage before the round
//! trip fails open: a body that cannot be converted or rewritten is
//! forwarded exactly as the client sent it.

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, Method};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::config::{Route, TransformMode};
use crate::protocol::convert::responses_to_chat;
use crate::protocol::responses::ResponsesRequest;
use crate::rewrite::rewrite_model;
use crate::state::AppState;
use crate::stream::{SseLineScanner, TranscodeSession};

/// Request paths with this suffix activate the transform on transform routes.
const RESPONSES_SUFFIX: &str = "/responses";
const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// The forwarding result plus the resolved upstream URL for the access log.
pub struct ProxyOutcome {
    pub response: Response,
    pub target: String,
}

/// Forward one matched request to its route target.
pub async fn handler(
    state: &AppState,
    parts: &Parts,
    route: &Route,
    sub_path: &str,
    body: Bytes,
    request_id: Uuid,
) -> ProxyOutcome {
    // Stage 1: Responses -> Chat request conversion. Activation checks the
    // original request path; the converted sub path is what goes upstream.
    let (body, sub_path) = if wants_conversion(route, &parts.method, parts.uri.path()) {
        match convert_request_body(&body, sub_path, request_id) {
            Some((converted, converted_path)) => (converted, converted_path),
            None => (body, sub_path.to_string()),
        }
    } else {
        (body, sub_path.to_string())
    };

    // Stage 2: model name rewrite, on whatever body stage 1 produced.
    let body = match rewrite_model(&body, &route.model_map) {
        Ok(Some(rewritten)) => {
            tracing::debug!(request_id = %request_id, route = %route.name, "model rewritten");
            Bytes::from(rewritten)
        }
        Ok(None) => body,
        Err(error) => {
            tracing::warn!(
                request_id = %request_id,
                error = %error,
                "model rewrite failed, forwarding original body"
            );
            body
        }
    };

    // Stage 3: the upstream round trip.
    let target = build_target_url(&route.target, &sub_path, parts.uri.query());
    let headers = build_upstream_headers(&parts.headers, state.token_header());
    let upstream = match state
        .transport
        .forward(&target, parts.method.clone(), headers, body)
        .await
    {
        Ok(upstream) => upstream,
        Err(error) => {
            tracing::warn!(
                request_id = %request_id,
                target = %target,
                error = %error,
                "upstream request failed"
            );
            return ProxyOutcome {
                response: error.into_response(),
                target,
            };
        }
    };

    // Stage 4: response transcoding, gated on the upstream actually replying
    // with an event stream. Anything else streams through untouched,
    // upstream error statuses included.
    let transcode = wants_transcode(route, parts.uri.path(), &upstream.headers);

    let mut headers = upstream.headers;
    sanitize_response_headers(&mut headers, transcode);

    let body = if transcode {
        transcoded_body(upstream.body, request_id)
    } else {
        Body::from_stream(upstream.body)
    };

    let mut response = Response::new(body);
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;

    ProxyOutcome { response, target }
}

fn wants_conversion(route: &Route, method: &Method, path: &str) -> bool {
    route.transform == TransformMode::ResponsesToChat
        && method == Method::POST
        && path.ends_with(RESPONSES_SUFFIX)
}

fn wants_transcode(route: &Route, path: &str, headers: &HeaderMap) -> bool {
    route.transform == TransformMode::ResponsesToChat
        && path.ends_with(RESPONSES_SUFFIX)
        && is_event_stream(headers)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("text/event-stream"))
}

/// Decode the Responses body, convert it, and move the sub path over to the
/// Chat Completions endpoint. `None` leaves the request untouched.
fn convert_request_body(body: &Bytes, sub_path: &str, request_id: Uuid) -> Option<(Bytes, String)> {
    let request: ResponsesRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!(
                request_id = %request_id,
                error = %error,
                "unparseable Responses request, forwarding unconverted"
            );
            return None;
        }
    };

    let chat = responses_to_chat(&request);
    match serde_json::to_vec(&chat) {
        Ok(converted) => {
            tracing::debug!(
                request_id = %request_id,
                model = %chat.model,
                "request converted to chat completions"
            );
            Some((
                Bytes::from(converted),
                sub_path.replacen(RESPONSES_SUFFIX, CHAT_COMPLETIONS_PATH, 1),
            ))
        }
        Err(error) => {
            tracing::warn!(
                request_id = %request_id,
                error = %error,
                "converted request did not encode, forwarding unconverted"
            );
            None
        }
    }
}

fn build_target_url(target: &str, sub_path: &str, query: Option<&str>) -> String {
    let mut url = String::with_capacity(
        target.len() + sub_path.len() + query.map_or(0, |query| query.len() + 1),
    );
    url.push_str(target.trim_end_matches('/'));
    url.push_str(sub_path);
    if let Some(query) = query {
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
    }
    url
}

// `HeaderName` is always lowercase, so plain comparison is enough.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Client headers minus everything that must not travel upstream: hop-by-hop
/// headers, `host` and `content-length` (the transport regenerates both),
/// `accept-encoding` (the transcoder needs an identity-encoded stream), and
/// the proxy's own token header.
fn build_upstream_headers(
    client_headers: &HeaderMap,
    token_header: Option<&HeaderName>,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(client_headers.len());
    for (name, value) in client_headers {
        if is_hop_by_hop(name)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == header::ACCEPT_ENCODING
            || token_header.is_some_and(|token| token == name)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn sanitize_response_headers(headers: &mut HeaderMap, transcoded: bool) {
    let dropped: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in dropped {
        headers.remove(name);
    }
    // The transcoder changes the byte count; a stale length would truncate.
    if transcoded {
        headers.remove(header::CONTENT_LENGTH);
    }
}

/// Run the upstream byte stream through the line scanner and a transcode
/// session, yielding converted Responses events as they form. A mid-stream
/// transport error truncates the output without synthesizing a completion.
fn transcoded_body(
    upstream: BoxStream<'static, Result<Bytes, std::io::Error>>,
    request_id: Uuid,
) -> Body {
    let output = futures_util::stream::unfold(
        (upstream, SseLineScanner::new(), TranscodeSession::new(), false),
        move |(mut upstream, mut scanner, mut session, mut finished)| async move {
            loop {
                if finished {
                    return None;
                }
                let mut out = Vec::new();
                match upstream.next().await {
                    Some(Ok(chunk)) => {
                        scanner.feed(&chunk, |line| session.process_line(line, &mut out));
                    }
                    Some(Err(error)) => {
                        tracing::debug!(
                            request_id = %request_id,
                            error = %error,
                            "upstream stream failed mid-response"
                        );
                        finished = true;
                    }
                    None => {
                        scanner.finish(|line| session.process_line(line, &mut out));
                        finished = true;
                    }
                }
                if !out.is_empty() {
                    return Some((Bytes::from(out), (upstream, scanner, session, finished)));
                }
            }
        },
    );

    Body::from_stream(output.map(Ok::<Bytes, std::convert::Infallible>))
}
