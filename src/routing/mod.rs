//! Route table: the shared mapping from URL path prefixes to upstreams.
//!
//! Requests are routed by their first path segment (`/zhipu/v1/responses`
//! goes to the route configured as `/zhipu`). The table is replaced wholesale
//! on hot reload; readers work on immutable snapshots and never lock.

pub mod dispatch;
pub mod watcher;

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::{Route, RoutesConfig};

/// Split a request path into its first segment (without the leading slash)
/// and the remaining sub-path (with its leading slash, empty if none).
#[must_use]
pub fn split_first_segment(path: &str) -> (&str, &str) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    match trimmed.find('/') {
        Some(slash) => (&trimmed[..slash], &trimmed[slash..]),
        None => (trimmed, ""),
    }
}

/// Lock-free shared route list.
///
/// `replace` publishes a whole new snapshot atomically; in-flight requests
/// keep whatever snapshot they resolved against.
#[derive(Debug)]
pub struct RouteTable {
    routes: ArcSwap<Vec<Arc<Route>>>,
}

impl RouteTable {
    #[must_use]
    pub fn new(config: RoutesConfig) -> Self {
        Self {
            routes: ArcSwap::from_pointee(freeze(config)),
        }
    }

    /// Find the route whose configured prefix names `first_segment`.
    /// Exact segment match, not a string prefix: `zhipu2` never hits `/zhipu`.
    #[must_use]
    pub fn lookup(&self, first_segment: &str) -> Option<Arc<Route>> {
        if first_segment.is_empty() {
            return None;
        }
        self.routes
            .load()
            .iter()
            .find(|route| route.path.strip_prefix('/') == Some(first_segment))
            .cloned()
    }

    /// The current route list, in file order.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<Route>>> {
        self.routes.load_full()
    }

    /// Atomically publish a new route list.
    pub fn replace(&self, config: RoutesConfig) {
        self.routes.store(Arc::new(freeze(config)));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.load().is_empty()
    }
}

fn freeze(config: RoutesConfig) -> Vec<Arc<Route>> {
    config.routes.into_iter().map(Arc::new).collect()
}
