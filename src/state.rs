mod request_id;

use std::net::IpAddr;
use std::sync::Arc;

use http::header::HeaderName;

use crate::auth::ClientAuth;
use crate::config::{AppConfig, Route};
use crate::error::ProxyError;
use crate::routing::watcher::RouteWatcher;
use crate::routing::RouteTable;
use crate::transport::HttpTransport;

use request_id::RequestIdGenerator;

/// Process-wide state handed to every request handler.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    routing: RoutingState,
    infra: InfraState,
}

struct RoutingState {
    table: Arc<RouteTable>,
}

struct InfraState {
    client_auth: ClientAuth,
    request_ids: RequestIdGenerator,
    // Owns the OS watch; dropped with the state.
    _route_watcher: Option<RouteWatcher>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: AppConfig,
        transport: HttpTransport,
        table: Arc<RouteTable>,
        client_auth: ClientAuth,
        route_watcher: Option<RouteWatcher>,
    ) -> Self {
        Self {
            config,
            transport,
            routing: RoutingState { table },
            infra: InfraState {
                client_auth,
                request_ids: RequestIdGenerator::new(),
                _route_watcher: route_watcher,
            },
        }
    }

    #[must_use]
    pub fn next_request_id(&self) -> uuid::Uuid {
        self.infra.request_ids.next()
    }

    /// Run both client gates against this request.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::IpNotAllowed`] or [`ProxyError::InvalidToken`]
    /// when the corresponding gate rejects the request.
    pub fn authorize(
        &self,
        client_ip: IpAddr,
        headers: &http::HeaderMap,
    ) -> Result<(), ProxyError> {
        self.infra.client_auth.authorize(client_ip, headers)
    }

    /// The configured client token header, stripped before forwarding.
    #[must_use]
    pub fn token_header(&self) -> Option<&HeaderName> {
        self.infra.client_auth.token_header()
    }

    #[must_use]
    pub fn lookup_route(&self, first_segment: &str) -> Option<Arc<Route>> {
        self.routing.table.lookup(first_segment)
    }

    #[must_use]
    pub fn routes_snapshot(&self) -> Arc<Vec<Arc<Route>>> {
        self.routing.table.snapshot()
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routing.table.len()
    }
}
