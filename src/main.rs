use std::io;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use futures_util::future;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use responsify_rs::auth::ClientAuth;
use responsify_rs::config::{load_config, load_routes_config, AppConfig, ServerConfig};
use responsify_rs::observability::init_tracing;
use responsify_rs::routing::dispatch::dispatch_request;
use responsify_rs::routing::watcher::RouteWatcher;
use responsify_rs::routing::RouteTable;
use responsify_rs::state::AppState;
use responsify_rs::transport::HttpTransport;
#[cfg(unix)]
use socket2::{Domain, Protocol, Socket, Type};

const LISTEN_BACKLOG: i32 = 1024;

fn main() {
    let config = load_config("config.yaml").unwrap_or_else(|e| {
        eprintln!("Cannot load configuration: {e}");
        eprintln!("Copy config.example.yaml to config.yaml and adjust it for this host.");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level);
    let runtime = build_runtime(&config.server);

    runtime.block_on(run(config));
}

fn build_runtime(server: &ServerConfig) -> tokio::runtime::Runtime {
    let mut builder = match server.runtime_worker_threads {
        Some(1) => tokio::runtime::Builder::new_current_thread(),
        configured => {
            let mut multi = tokio::runtime::Builder::new_multi_thread();
            if let Some(threads) = configured {
                multi.worker_threads(threads);
            }
            // Stack size only applies to threads the runtime itself spawns.
            if let Some(stack_kb) = server.runtime_thread_stack_size_kb {
                multi.thread_stack_size(stack_kb * 1024);
            }
            multi
        }
    };
    builder.enable_io().enable_time();
    if let Some(blocking) = server.runtime_max_blocking_threads {
        builder.max_blocking_threads(blocking);
    }
    builder.build().unwrap_or_else(|e| {
        eprintln!("Tokio runtime construction failed: {e}");
        std::process::exit(1);
    })
}

async fn run(config: AppConfig) {
    let host = config.server.host.clone();
    let port = config.server.port;

    let routes_config = load_routes_config(&config.routing.routes_file).unwrap_or_else(|e| {
        eprintln!(
            "Cannot load routes from '{}': {e}",
            config.routing.routes_file
        );
        eprintln!(
            "Copy routes.example.json to '{}' to get started.",
            config.routing.routes_file
        );
        std::process::exit(1);
    });

    let client_auth = ClientAuth::from_config(&config.client_authentication).unwrap_or_else(|e| {
        eprintln!("Client authentication configuration error: {e}");
        std::process::exit(1);
    });

    if client_auth.token_gate_enabled() {
        if let Some(header) = client_auth.token_header() {
            tracing::info!("token auth enabled, header={}", header.as_str());
        }
    }
    if client_auth.ip_gate_enabled() {
        tracing::info!("IP whitelist enabled, rules={}", client_auth.ip_rule_count());
    }

    let table = Arc::new(RouteTable::new(routes_config));
    tracing::info!(
        "loaded {} routes from '{}'",
        table.len(),
        config.routing.routes_file
    );

    let route_watcher = if config.routing.watch {
        match RouteWatcher::spawn(&config.routing.routes_file, Arc::clone(&table)) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                tracing::warn!(
                    "failed to watch '{}' for changes: {err}; hot reload disabled",
                    config.routing.routes_file
                );
                None
            }
        }
    } else {
        None
    };

    let transport = HttpTransport::new(&config.server);
    let state = Arc::new(AppState::new(
        config,
        transport,
        table,
        client_auth,
        route_watcher,
    ));

    tracing::info!("responsify-rs starting on {}:{}", host, port);

    let listeners = build_server_listeners(&state.config.server, &host, port)
        .await
        .unwrap_or_else(|err| {
            eprintln!("Cannot bind {host}:{port}: {err}");
            std::process::exit(1);
        });

    tracing::info!(
        "responsify-rs is ready to accept connections (listeners={}, reuse_port={})",
        listeners.len(),
        state.config.server.tcp_reuse_port_listener_count.is_some()
    );

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    let mut listeners = listeners;
    let last = listeners.pop();
    for listener in listeners {
        let loop_builder = conn_builder.clone();
        let loop_state = Arc::clone(&state);
        tokio::spawn(serve_accept_loop(listener, loop_builder, loop_state));
    }
    match last {
        // The final listener runs on this task so a single-listener setup
        // needs no extra spawn.
        Some(listener) => serve_accept_loop(listener, conn_builder, state).await,
        None => future::pending::<()>().await,
    }
}

async fn serve_accept_loop(
    listener: tokio::net::TcpListener,
    conn_builder: AutoBuilder<TokioExecutor>,
    dispatch_state: Arc<AppState>,
) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("accept error: {err}");
                continue;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("TCP_NODELAY not set for {remote_addr}: {err}");
        }

        let conn_builder = conn_builder.clone();
        let request_state = Arc::clone(&dispatch_state);
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| {
                dispatch_request(
                    Arc::clone(&request_state),
                    remote_addr,
                    request.map(Body::new),
                )
            });
            if let Err(err) = conn_builder
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("connection from {remote_addr} closed with error: {err:#}");
            }
        });
    }
}

async fn build_server_listeners(
    server: &ServerConfig,
    host: &str,
    port: u16,
) -> io::Result<Vec<tokio::net::TcpListener>> {
    let listener_count = match server.tcp_reuse_port_listener_count {
        Some(count) if cfg!(unix) => count.max(1),
        Some(_) => {
            tracing::warn!(
                "server.tcp_reuse_port_listener_count has no effect on this platform, using one listener"
            );
            1
        }
        None => 1,
    };

    if listener_count == 1 {
        let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
        return Ok(vec![listener]);
    }

    let mut listeners = Vec::with_capacity(listener_count);
    for _ in 0..listener_count {
        listeners.push(bind_reuse_port_listener(host, port)?);
    }
    Ok(listeners)
}

#[cfg(unix)]
fn bind_reuse_port_listener(host: &str, port: u16) -> io::Result<tokio::net::TcpListener> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let bound = (|| {
            let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            socket.set_reuse_port(true)?;
            socket.bind(&addr.into())?;
            socket.listen(LISTEN_BACKLOG)?;
            socket.set_nonblocking(true)?;
            tokio::net::TcpListener::from_std(socket.into())
        })();
        match bound {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("could not resolve a bindable address for {host}:{port}"),
        )
    }))
}

#[cfg(not(unix))]
fn bind_reuse_port_listener(_host: &str, _port: u16) -> io::Result<tokio::net::TcpListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_REUSEPORT listeners require a Unix platform",
    ))
}
