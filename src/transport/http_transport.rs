use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::ServerConfig;
use crate::error::ProxyError;

static RUSTLS_PROVIDER_INIT: Once = Once::new();
const PARSED_URI_CACHE_MAX_ENTRIES: usize = 512;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const H2_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
const H2_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

type HyperHttpsClient = HyperClient<HttpsConnector<HttpConnector>, Full<bytes::Bytes>>;

/// An upstream response normalized across both client paths: status, headers
/// and the body as a raw byte stream.
pub struct UpstreamResponse {
    pub status: http::StatusCode,
    pub headers: http::HeaderMap,
    pub body: BoxStream<'static, Result<bytes::Bytes, std::io::Error>>,
}

/// HTTP client for forwarding requests upstream.
///
/// Two lazily-built paths: a direct `hyper` client (rustls, HTTP/1.1 and
/// HTTP/2) and a `reqwest` client that honors environment proxy variables
/// when `server.http_use_env_proxy` is set. Every request gets exactly one
/// attempt; there is no retry or failover in the transport.
pub struct HttpTransport {
    https_client: OnceLock<HyperHttpsClient>,
    reqwest_client: OnceLock<reqwest::Client>,
    parsed_uri_cache: RwLock<FxHashMap<String, Arc<http::Uri>>>,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    total_timeout: Duration,
    use_env_proxy: bool,
}

impl HttpTransport {
    /// Create a new transport with connection pooling and timeouts from the
    /// given server config. Clients are built on first use.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        RUSTLS_PROVIDER_INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });

        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };

        Self {
            https_client: OnceLock::new(),
            reqwest_client: OnceLock::new(),
            parsed_uri_cache: RwLock::new(FxHashMap::default()),
            pool_max_idle_per_host: config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            total_timeout: Duration::from_secs(config.timeout),
            use_env_proxy: config.http_use_env_proxy,
        }
    }

    /// Forward one request upstream and hand back the streaming response.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Transport`] when the URL does not parse or the
    /// connection/request fails. Upstream HTTP error statuses are not errors;
    /// they come back as a normal [`UpstreamResponse`].
    pub async fn forward(
        &self,
        url: &str,
        method: http::Method,
        headers: http::HeaderMap,
        body: bytes::Bytes,
    ) -> Result<UpstreamResponse, ProxyError> {
        if self.use_env_proxy {
            self.forward_via_reqwest(url, method, headers, body).await
        } else {
            self.forward_via_hyper(url, method, headers, body).await
        }
    }

    async fn forward_via_hyper(
        &self,
        url: &str,
        method: http::Method,
        headers: http::HeaderMap,
        body: bytes::Bytes,
    ) -> Result<UpstreamResponse, ProxyError> {
        let uri = self.parsed_uri(url)?;

        let mut request = http::Request::new(Full::new(body));
        *request.method_mut() = method;
        *request.uri_mut() = uri.as_ref().clone();
        *request.headers_mut() = headers;

        let response = self
            .https_client()
            .request(request)
            .await
            .map_err(|err| ProxyError::Transport(err.to_string()))?;

        let (parts, incoming) = response.into_parts();
        Ok(UpstreamResponse {
            status: parts.status,
            headers: parts.headers,
            body: incoming
                .into_data_stream()
                .map_err(std::io::Error::other)
                .boxed(),
        })
    }

    async fn forward_via_reqwest(
        &self,
        url: &str,
        method: http::Method,
        headers: http::HeaderMap,
        body: bytes::Bytes,
    ) -> Result<UpstreamResponse, ProxyError> {
        let parsed = url::Url::parse(url)
            .map_err(|err| ProxyError::Transport(format!("Invalid upstream URL: {err}")))?;

        let mut request = reqwest::Request::new(method, parsed);
        *request.headers_mut() = headers;
        *request.body_mut() = Some(reqwest::Body::from(body));

        let response = self
            .reqwest_client()
            .execute(request)
            .await
            .map_err(|err| ProxyError::Transport(err.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        Ok(UpstreamResponse {
            status,
            headers,
            body: response
                .bytes_stream()
                .map_err(std::io::Error::other)
                .boxed(),
        })
    }

    fn https_client(&self) -> &HyperHttpsClient {
        self.https_client.get_or_init(|| {
            let mut connector = HttpConnector::new();
            connector.enforce_http(false);
            connector.set_nodelay(true);
            connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
            let https = HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(connector);
            let mut builder = HyperClient::builder(TokioExecutor::new());
            builder.pool_max_idle_per_host(self.pool_max_idle_per_host);
            builder.pool_idle_timeout(self.pool_idle_timeout);
            builder.pool_timer(TokioTimer::new());
            builder.timer(TokioTimer::new());
            builder.http2_adaptive_window(true);
            builder.http2_keep_alive_interval(H2_KEEP_ALIVE_INTERVAL);
            builder.http2_keep_alive_timeout(H2_KEEP_ALIVE_TIMEOUT);
            builder.http2_keep_alive_while_idle(true);
            builder.build(https)
        })
    }

    fn reqwest_client(&self) -> &reqwest::Client {
        self.reqwest_client.get_or_init(|| {
            let builder = reqwest::Client::builder()
                .pool_max_idle_per_host(self.pool_max_idle_per_host)
                .pool_idle_timeout(self.pool_idle_timeout)
                .tcp_nodelay(true)
                .connect_timeout(CONNECT_TIMEOUT)
                .redirect(reqwest::redirect::Policy::none())
                .timeout(self.total_timeout);
            match builder.build() {
                Ok(client) => client,
                Err(error) => {
                    tracing::error!(
                        error = %error,
                        "failed to build configured reqwest client, falling back to default client"
                    );
                    reqwest::Client::new()
                }
            }
        })
    }

    fn parsed_uri(&self, url: &str) -> Result<Arc<http::Uri>, ProxyError> {
        if let Some(uri) = self.parsed_uri_cache.read().get(url) {
            return Ok(Arc::clone(uri));
        }

        let parsed = url
            .parse::<http::Uri>()
            .map(Arc::new)
            .map_err(|err| ProxyError::Transport(format!("Invalid upstream URI: {err}")))?;

        let mut cache = self.parsed_uri_cache.write();
        // Wholesale flush on overflow; route targets stay far below the cap.
        if cache.len() >= PARSED_URI_CACHE_MAX_ENTRIES && !cache.contains_key(url) {
            cache.clear();
        }
        let uri = cache
            .entry(url.to_string())
            .or_insert_with(|| Arc::clone(&parsed));
        Ok(Arc::clone(uri))
    }
}
