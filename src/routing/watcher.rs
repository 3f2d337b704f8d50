//! Hot reload of the routes file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::load_routes_config;
use crate::routing::RouteTable;

/// Watches the routes file and republishes the table on every change.
///
/// The handle owns the OS watcher; dropping it stops the watch.
pub struct RouteWatcher {
    _watcher: RecommendedWatcher,
}

impl RouteWatcher {
    /// Start watching `routes_file`.
    ///
    /// The parent directory is watched (non-recursively) rather than the file
    /// itself so editors that replace the file by rename are still caught.
    /// A rewrite that fails to parse or validate keeps the previous snapshot.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`notify::Error`] when the OS watch cannot be
    /// established.
    pub fn spawn(routes_file: &str, table: Arc<RouteTable>) -> Result<Self, notify::Error> {
        let path = PathBuf::from(routes_file);
        let path = std::fs::canonicalize(&path).unwrap_or(path);
        let file_name: Option<OsString> = path.file_name().map(OsString::from);
        let watch_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let reload_path = routes_file.to_string();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
                let Ok(event) = result else {
                    return;
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                let touches_routes_file = event
                    .paths
                    .iter()
                    .any(|changed| changed.file_name() == file_name.as_deref());
                if touches_routes_file {
                    reload(&reload_path, &table);
                }
            })?;

        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        Ok(Self { _watcher: watcher })
    }
}

fn reload(routes_file: &str, table: &RouteTable) {
    match load_routes_config(routes_file) {
        Ok(routes) => {
            let count = routes.routes.len();
            table.replace(routes);
            tracing::info!(file = routes_file, routes = count, "routes reloaded");
        }
        Err(error) => {
            tracing::warn!(
                file = routes_file,
                error = %error,
                "routes reload failed, keeping previous routes"
            );
        }
    }
}
