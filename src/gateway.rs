/**
 * Gateway orchestrator.
 *
 * Builds the HTTP surface: one SSE-fronted MCP server per configured backend,
 * mounted under `<baseURL.path>/<name>/` behind that backend's middleware
 * chain. All backends are initialized concurrently; the listener starts only
 * after every backend has either connected or been skipped, so a
 * `panicIfInvalid` failure can never race an already-serving socket.
 * Shutdown is signal driven and bounded by a five second deadline.
 */
use axum::{http::StatusCode, routing::any, Router};
use rmcp::{
    model::{ClientCapabilities, ClientInfo, Implementation},
    transport::sse_server::{SseServer, SseServerConfig},
};
use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use crate::backend::{BackendClient, BackendError};
use crate::config::Config;
use crate::middleware;
use crate::proxy_handler::ProxyHandler;
use crate::utils::mount_path;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid base URL {url:?}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid listen address {addr:?}: {source}")]
    InvalidAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("<{name}> failed to create client: {source}")]
    BackendCreate {
        name: String,
        #[source]
        source: BackendError,
    },
    #[error("<{name}> failed to initialize: {source}")]
    BackendInit {
        name: String,
        #[source]
        source: BackendError,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
    #[error("initialization task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("graceful shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// The assembled HTTP surface plus the backend clients it owns.
#[derive(Debug)]
pub struct GatewayApp {
    pub router: Router,
    pub clients: Vec<Arc<BackendClient>>,
}

struct PendingBackend {
    client: Arc<BackendClient>,
    router: Router,
    panic_if_invalid: bool,
}

fn gateway_client_info(config: &Config) -> ClientInfo {
    ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: config.mcp_proxy.name.clone(),
            version: config.mcp_proxy.version.clone(),
        },
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Construct the per-backend servers and routes and initialize every backend
/// concurrently. Backends that fail with a permissive policy are logged and
/// left unmounted; a failing backend with `panicIfInvalid` aborts the whole
/// startup.
pub async fn build_app(config: &Config, ct: &CancellationToken) -> Result<GatewayApp, GatewayError> {
    let base_url =
        Url::parse(&config.mcp_proxy.base_url).map_err(|source| GatewayError::InvalidBaseUrl {
            url: config.mcp_proxy.base_url.clone(),
            source,
        })?;
    let addr: SocketAddr =
        config
            .mcp_proxy
            .addr
            .parse()
            .map_err(|source| GatewayError::InvalidAddr {
                addr: config.mcp_proxy.addr.clone(),
                source,
            })?;
    let client_info = gateway_client_info(config);

    let mut pending: HashMap<String, PendingBackend> = HashMap::new();
    let mut join_set = JoinSet::new();

    for (name, backend_config) in &config.mcp_servers {
        let client = Arc::new(BackendClient::new(name, backend_config).map_err(|source| {
            GatewayError::BackendCreate {
                name: name.clone(),
                source,
            }
        })?);
        let options = client.options().clone();
        let server = ProxyHandler::new(
            name,
            &config.mcp_proxy.version,
            options.log_enabled.unwrap_or(false),
        );

        let route = mount_path(base_url.path(), name);
        let sse_config = SseServerConfig {
            bind: addr,
            sse_path: format!("{route}sse"),
            post_path: format!("{route}message"),
            ct: ct.child_token(),
            sse_keep_alive: Some(SSE_KEEP_ALIVE),
        };
        let (sse_server, sse_router) = SseServer::new(sse_config);
        let service_handler = server.clone();
        sse_server.with_service(move || service_handler.clone());

        // Unknown paths under the backend prefix answer 404 from behind the
        // same middleware chain, mirroring subtree mounting.
        let sse_router = sse_router
            .route(&route, any(not_found))
            .route(&format!("{route}{{*rest}}"), any(not_found));
        let wrapped = middleware::wrap(
            sse_router,
            name,
            options.log_enabled.unwrap_or(false),
            options.auth_tokens(),
        );

        pending.insert(
            name.clone(),
            PendingBackend {
                client: client.clone(),
                router: wrapped,
                panic_if_invalid: options.panic_if_invalid.unwrap_or(false),
            },
        );

        let task_name = name.clone();
        let task_info = client_info.clone();
        let task_ct = ct.clone();
        join_set.spawn(async move {
            info!("<{}> Connecting", task_name);
            let result = client.add_to_mcp_server(task_info, &server, &task_ct).await;
            (task_name, result)
        });
    }

    let mut router = Router::new();
    let mut clients: Vec<Arc<BackendClient>> = Vec::new();
    let mut failure: Option<GatewayError> = None;

    while let Some(joined) = join_set.join_next().await {
        let (name, result) = match joined {
            Ok(outcome) => outcome,
            Err(join_err) => {
                failure = Some(GatewayError::Task(join_err));
                join_set.abort_all();
                break;
            }
        };
        let Some(backend) = pending.remove(&name) else {
            continue;
        };
        match result {
            Ok(()) => {
                info!("<{}> Connected", name);
                router = router.merge(backend.router);
                clients.push(backend.client);
            }
            Err(err) => {
                error!("<{}> Failed to add client to server: {}", name, err);
                backend.client.close().await;
                if backend.panic_if_invalid {
                    failure = Some(GatewayError::BackendInit { name, source: err });
                    join_set.abort_all();
                    break;
                }
            }
        }
    }

    if let Some(err) = failure {
        for client in &clients {
            client.close().await;
        }
        for backend in pending.into_values() {
            backend.client.close().await;
        }
        return Err(err);
    }

    info!("All clients initialized");
    Ok(GatewayApp { router, clients })
}

/// Run the gateway until SIGINT or SIGTERM, then shut down gracefully.
pub async fn run(config: Config) -> Result<(), GatewayError> {
    run_until(config, shutdown_signal()).await
}

/// Run the gateway until `shutdown` resolves. The listener starts only after
/// every backend finished initializing; shutdown closes every backend client
/// exactly once and bounds the HTTP drain by a five second deadline.
pub async fn run_until(
    config: Config,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<(), GatewayError> {
    let ct = CancellationToken::new();
    let GatewayApp { router, clients } = match build_app(&config, &ct).await {
        Ok(app) => app,
        Err(err) => {
            ct.cancel();
            return Err(err);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&config.mcp_proxy.addr).await {
        Ok(listener) => listener,
        Err(source) => {
            ct.cancel();
            close_all(&clients).await;
            return Err(GatewayError::Bind {
                addr: config.mcp_proxy.addr.clone(),
                source,
            });
        }
    };
    info!("Starting SSE server");
    info!("SSE server listening on {}", config.mcp_proxy.addr);

    let graceful_ct = ct.clone();
    let mut server_task = tokio::spawn(
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { graceful_ct.cancelled().await })
            .into_future(),
    );

    tokio::select! {
        () = shutdown => {
            info!("Shutdown signal received");
        }
        joined = &mut server_task => {
            // The listener stopped on its own; treat anything but a clean
            // close as fatal, but still run the shutdown hooks.
            ct.cancel();
            close_all(&clients).await;
            return match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(GatewayError::Serve(err)),
                Err(join_err) => Err(GatewayError::Task(join_err)),
            };
        }
    }

    ct.cancel();
    close_all(&clients).await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server_task).await {
        Ok(Ok(Ok(()))) => {
            info!("All backends shut down");
            Ok(())
        }
        Ok(Ok(Err(err))) => Err(GatewayError::Serve(err)),
        Ok(Err(join_err)) => Err(GatewayError::Task(join_err)),
        Err(_) => {
            server_task.abort();
            Err(GatewayError::ShutdownTimeout(SHUTDOWN_TIMEOUT))
        }
    }
}

async fn close_all(clients: &[Arc<BackendClient>]) {
    for client in clients {
        info!("<{}> Shutting down", client.name());
        client.close().await;
    }
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn empty_config(addr: &str) -> Config {
        config::parse(
            format!(
                r#"{{
                    "mcpProxy": {{
                        "baseURL": "http://localhost:9090",
                        "addr": "{addr}",
                        "name": "gateway",
                        "version": "1.0.0"
                    }},
                    "mcpServers": {{}}
                }}"#
            )
            .as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_config_mounts_no_routes() {
        let ct = CancellationToken::new();
        let app = build_app(&empty_config("127.0.0.1:9090"), &ct).await.unwrap();
        assert!(app.clients.is_empty());

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .uri("/github/sse")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        ct.cancel();
    }

    #[tokio::test]
    async fn invalid_base_url_fails_closed() {
        let mut config = empty_config("127.0.0.1:9090");
        config.mcp_proxy.base_url = "::not a url::".into();
        let ct = CancellationToken::new();
        let err = build_app(&config, &ct).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidBaseUrl { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_config_starts_and_shuts_down_cleanly() {
        let config = empty_config("127.0.0.1:0");
        let (trigger, wait) = tokio::sync::oneshot::channel::<()>();
        let gateway = tokio::spawn(run_until(config, async move {
            let _ = wait.await;
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.send(()).expect("gateway exited early");

        let result = tokio::time::timeout(Duration::from_secs(5), gateway)
            .await
            .expect("shutdown exceeded the deadline")
            .expect("gateway task panicked");
        result.unwrap();
    }
}
