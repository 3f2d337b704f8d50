//! Standalone mock Chat Completions upstream for manual proxy testing.
//!
//! Serves canned replies on `POST /v1/chat/completions` (and the bare
//! `/chat/completions`). Behavior is selected through environment variables:
//!
//! - `UPSTREAM_PORT`: listen port (default 19001)
//! - `MOCK_MODE`: `nonstream` (default) or `stream`
//! - `MOCK_SCENARIO`: `text` (default), `multibyte`, `usage`, or `error`
//! - `MOCK_FRAGMENT_BYTES`: when set to N > 0, streamed bodies are written in
//!   N-byte fragments with a short pause between writes, so the proxy's line
//!   scanner sees SSE records split at arbitrary byte offsets (including in
//!   the middle of multi-byte codepoints with `multibyte` and N=1)
//!
//! `GET /_mock/stats` reports how many replies were served; `POST /_mock/reset`
//! clears the counters.

use std::convert::Infallible;
use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

const DEFAULT_UPSTREAM_PORT: u16 = 19_001;
const FRAGMENT_PAUSE: Duration = Duration::from_millis(1);

type MockBody = BoxBody<Bytes, Infallible>;

/// Behavior knobs, read from the environment once at startup.
#[derive(Copy, Clone)]
struct MockConfig {
    mode: MockMode,
    scenario: MockScenario,
    fragment_bytes: usize,
}

#[derive(Copy, Clone)]
enum MockMode {
    Json,
    Sse,
}

#[derive(Copy, Clone)]
enum MockScenario {
    Text,
    Multibyte,
    Usage,
    Error,
}

impl MockConfig {
    fn from_env() -> Self {
        let mode = match env::var("MOCK_MODE").as_deref() {
            Ok("stream") => MockMode::Sse,
            Ok("nonstream") | Err(_) => MockMode::Json,
            Ok(other) => {
                eprintln!("MOCK_MODE '{other}' not recognized, serving nonstream");
                MockMode::Json
            }
        };
        let scenario = match env::var("MOCK_SCENARIO").as_deref() {
            Ok("multibyte") => MockScenario::Multibyte,
            Ok("usage") => MockScenario::Usage,
            Ok("error") => MockScenario::Error,
            Ok("text") | Err(_) => MockScenario::Text,
            Ok(other) => {
                eprintln!("MOCK_SCENARIO '{other}' not recognized, serving text");
                MockScenario::Text
            }
        };
        Self {
            mode,
            scenario,
            fragment_bytes: env_parse("MOCK_FRAGMENT_BYTES", 0),
        }
    }
}

impl MockMode {
    fn label(self) -> &'static str {
        match self {
            Self::Json => "nonstream",
            Self::Sse => "stream",
        }
    }
}

impl MockScenario {
    fn label(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Multibyte => "multibyte",
            Self::Usage => "usage",
            Self::Error => "error",
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

struct ReplyCounters {
    json: AtomicU64,
    sse: AtomicU64,
}

impl ReplyCounters {
    const fn new() -> Self {
        Self {
            json: AtomicU64::new(0),
            sse: AtomicU64::new(0),
        }
    }

    fn reset(&self) {
        self.json.store(0, Ordering::Relaxed);
        self.sse.store(0, Ordering::Relaxed);
    }

    fn report(&self, config: MockConfig) -> Response<MockBody> {
        let json = self.json.load(Ordering::Relaxed);
        let sse = self.sse.load(Ordering::Relaxed);
        let body = format!(
            "{{\"mode\":\"{}\",\"scenario\":\"{}\",\"fragment_bytes\":{},\"json\":{json},\"sse\":{sse}}}",
            config.mode.label(),
            config.scenario.label(),
            config.fragment_bytes
        );
        json_reply(StatusCode::OK, Bytes::from(body))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = MockConfig::from_env();
    let port: u16 = env_parse("UPSTREAM_PORT", DEFAULT_UPSTREAM_PORT);
    let counters = Arc::new(ReplyCounters::new());

    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("cannot bind 127.0.0.1:{port}: {err}");
            std::process::exit(1);
        }
    };
    eprintln!(
        "mock chat upstream on 127.0.0.1:{port} ({}, {})",
        config.mode.label(),
        config.scenario.label()
    );

    let builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                eprintln!("accept failed: {err}");
                continue;
            }
        };
        let builder = builder.clone();
        let counters = Arc::clone(&counters);
        let service = service_fn(move |request: Request<Incoming>| {
            let counters = Arc::clone(&counters);
            async move { Ok::<_, Infallible>(respond(request, config, &counters).await) }
        });
        tokio::spawn(async move {
            if let Err(err) = builder.serve_connection(TokioIo::new(stream), service).await {
                eprintln!("connection error ({peer}): {err}");
            }
        });
    }
}

async fn respond(
    request: Request<Incoming>,
    config: MockConfig,
    counters: &ReplyCounters,
) -> Response<MockBody> {
    let (parts, body) = request.into_parts();
    swallow_body(body).await;

    let post = parts.method == Method::POST;
    match parts.uri.path() {
        "/_mock/stats" if parts.method == Method::GET => counters.report(config),
        "/_mock/reset" if post => {
            counters.reset();
            json_reply(StatusCode::OK, Bytes::from_static(br#"{"ok":true}"#))
        }
        "/v1/chat/completions" | "/chat/completions" if post => chat_reply(config, counters),
        "/v1/chat/completions" | "/chat/completions" | "/_mock/stats" | "/_mock/reset" => {
            json_reply(
                StatusCode::METHOD_NOT_ALLOWED,
                Bytes::from_static(br#"{"error":"method_not_allowed"}"#),
            )
        }
        _ => json_reply(
            StatusCode::NOT_FOUND,
            Bytes::from_static(br#"{"error":"not_found"}"#),
        ),
    }
}

async fn swallow_body(mut body: Incoming) {
    while let Some(frame) = body.frame().await {
        if frame.is_err() {
            break;
        }
    }
}

fn chat_reply(config: MockConfig, counters: &ReplyCounters) -> Response<MockBody> {
    if matches!(config.scenario, MockScenario::Error) {
        return json_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            Bytes::from_static(br#"{"error":"mock_injected_error"}"#),
        );
    }
    match config.mode {
        MockMode::Json => {
            counters.json.fetch_add(1, Ordering::Relaxed);
            json_reply(StatusCode::OK, chat_completion_body(config.scenario))
        }
        MockMode::Sse => {
            counters.sse.fetch_add(1, Ordering::Relaxed);
            sse_reply(chat_stream_payload(config.scenario), config.fragment_bytes)
        }
    }
}

fn chat_completion_body(scenario: MockScenario) -> Bytes {
    let content = match scenario {
        MockScenario::Multibyte => "日本語です",
        _ => "ok",
    };
    let usage = if matches!(scenario, MockScenario::Usage) {
        ",\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}"
    } else {
        ""
    };
    Bytes::from(format!(
        "{{\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion\",\"created\":1,\"model\":\"glm-4.6\",\"choices\":[{{\"index\":0,\"message\":{{\"role\":\"assistant\",\"content\":\"{content}\"}},\"finish_reason\":\"stop\"}}]{usage}}}"
    ))
}

const CHUNK_HEAD: &str = "data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"glm-4.6\",\"choices\":[{\"index\":0,\"delta\":";

// `content` is one of the fixed strings above; no JSON escaping needed.
fn delta_chunk(first: bool, content: &str) -> String {
    let delta = if first {
        format!("{{\"role\":\"assistant\",\"content\":\"{content}\"}}")
    } else {
        format!("{{\"content\":\"{content}\"}}")
    };
    format!("{CHUNK_HEAD}{delta},\"finish_reason\":null}}]}}\n\n")
}

fn chat_stream_payload(scenario: MockScenario) -> Bytes {
    let deltas: &[&str] = match scenario {
        MockScenario::Multibyte => &["", "日本", "語です"],
        MockScenario::Usage => &["", "ok"],
        MockScenario::Text | MockScenario::Error => &["", "o", "k"],
    };
    let mut body = String::new();
    for (index, delta) in deltas.iter().enumerate() {
        body.push_str(&delta_chunk(index == 0, delta));
    }
    body.push_str(&format!("{CHUNK_HEAD}{{}},\"finish_reason\":\"stop\"}}]}}\n\n"));
    if matches!(scenario, MockScenario::Usage) {
        body.push_str(": keep-alive\n\n");
        body.push_str("data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"glm-4.6\",\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}}\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    Bytes::from(body)
}

fn sse_reply(payload: Bytes, fragment_bytes: usize) -> Response<MockBody> {
    let body = if fragment_bytes == 0 {
        Full::new(payload).boxed()
    } else {
        let total = payload.len();
        let stream = futures_util::stream::unfold(0usize, move |offset| {
            let payload = payload.clone();
            async move {
                if offset >= total {
                    return None;
                }
                tokio::time::sleep(FRAGMENT_PAUSE).await;
                let end = (offset + fragment_bytes).min(total);
                Some((
                    Ok::<_, Infallible>(Frame::data(payload.slice(offset..end))),
                    end,
                ))
            }
        });
        StreamBody::new(stream).boxed()
    };

    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn json_reply(status: StatusCode, body: Bytes) -> Response<MockBody> {
    let mut response = Response::new(Full::new(body).boxed());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
