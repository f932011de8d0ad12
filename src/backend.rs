/**
 * Backend client: one per configured backend.
 *
 * Wraps a transport-specific rmcp client. A stdio backend spawns its child
 * process eagerly at construction; SSE and streamable-http backends connect
 * during initialization ("manual start") and keep their connection alive with
 * a periodic ping task afterwards.
 */
use rmcp::{
    model::ClientInfo,
    service::RunningService,
    transport::{
        child_process::TokioChildProcess,
        sse_client::{SseClientConfig, SseClientTransport},
        streamable_http_client::{
            StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
        },
        ConfigureCommandExt,
    },
    RoleClient, ServiceExt,
};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capabilities;
use crate::config::{resolve_transport, BackendConfig, ConfigError, Options, TransportConfig};
use crate::proxy_handler::ProxyHandler;

const PING_INTERVAL: Duration = Duration::from_secs(30);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn subprocess: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("handshake failed: {0}")]
    Handshake(#[source] BoxError),
    #[error("failed to list {family}: {source}")]
    Capability {
        family: &'static str,
        #[source]
        source: rmcp::service::ServiceError,
    },
    #[error("client already started")]
    AlreadyStarted,
}

/// Connection material prepared at construction and consumed by the
/// initialization protocol. Stdio is already running at this point; the HTTP
/// transports only carry their parameters until the manual start.
enum TransportSeed {
    Stdio(TokioChildProcess),
    Sse {
        url: String,
        headers: HashMap<String, String>,
    },
    StreamableHttp {
        url: String,
        headers: HashMap<String, String>,
        timeout: Option<Duration>,
    },
}

impl std::fmt::Debug for TransportSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportSeed::Stdio(_) => f.debug_tuple("Stdio").finish(),
            TransportSeed::Sse { url, headers } => f
                .debug_struct("Sse")
                .field("url", url)
                .field("headers", headers)
                .finish(),
            TransportSeed::StreamableHttp {
                url,
                headers,
                timeout,
            } => f
                .debug_struct("StreamableHttp")
                .field("url", url)
                .field("headers", headers)
                .field("timeout", timeout)
                .finish(),
        }
    }
}

enum ClientState {
    Created(TransportSeed),
    Running(RunningService<RoleClient, ClientInfo>),
    Closed,
}

impl std::fmt::Debug for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Created(seed) => f.debug_tuple("Created").field(seed).finish(),
            ClientState::Running(_) => f.debug_tuple("Running").finish(),
            ClientState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug)]
pub struct BackendClient {
    name: String,
    needs_manual_start: bool,
    needs_ping: bool,
    options: Options,
    state: Mutex<ClientState>,
}

impl BackendClient {
    /// Resolve the backend's transport variant and prepare it. A stdio
    /// backend's child process is spawned here.
    pub fn new(name: &str, conf: &BackendConfig) -> Result<Self, BackendError> {
        let (seed, needs_manual_start, needs_ping) = match resolve_transport(conf)? {
            TransportConfig::Stdio { command, args, env } => {
                let process = TokioChildProcess::new(
                    tokio::process::Command::new(&command).configure(|cmd| {
                        cmd.args(&args);
                        for (key, value) in &env {
                            cmd.env(key, value);
                        }
                    }),
                )
                .map_err(BackendError::Spawn)?;
                (TransportSeed::Stdio(process), false, false)
            }
            TransportConfig::Sse { url, headers } => {
                (TransportSeed::Sse { url, headers }, true, true)
            }
            TransportConfig::StreamableHttp {
                url,
                headers,
                timeout,
            } => (
                TransportSeed::StreamableHttp {
                    url,
                    headers,
                    timeout,
                },
                true,
                true,
            ),
        };

        Ok(Self {
            name: name.to_string(),
            needs_manual_start,
            needs_ping,
            options: conf.options.clone(),
            state: Mutex::new(ClientState::Created(seed)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn needs_manual_start(&self) -> bool {
        self.needs_manual_start
    }

    pub fn needs_ping(&self) -> bool {
        self.needs_ping
    }

    /// Run the initialization protocol against `server`:
    ///
    /// 1. start the transport when it requires a manual start;
    /// 2. perform the MCP initialize handshake with the gateway identity and
    ///    empty capability declarations;
    /// 3. register tools (fatal on error);
    /// 4. register prompts, resources and resource templates (best-effort);
    /// 5. fork the ping task for long-lived transports.
    pub async fn add_to_mcp_server(
        &self,
        client_info: ClientInfo,
        server: &ProxyHandler,
        ct: &CancellationToken,
    ) -> Result<(), BackendError> {
        let seed = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, ClientState::Closed) {
                ClientState::Created(seed) => seed,
                other => {
                    *state = other;
                    return Err(BackendError::AlreadyStarted);
                }
            }
        };

        let running = match seed {
            TransportSeed::Stdio(process) => client_info
                .serve(process)
                .await
                .map_err(|err| BackendError::Handshake(Box::new(err)))?,
            TransportSeed::Sse { url, headers } => {
                let http_client = build_http_client(&headers, None)?;
                let transport = SseClientTransport::start_with_client(
                    http_client,
                    SseClientConfig {
                        sse_endpoint: url.into(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|err| BackendError::Transport(Box::new(err)))?;
                client_info
                    .serve(transport)
                    .await
                    .map_err(|err| BackendError::Handshake(Box::new(err)))?
            }
            TransportSeed::StreamableHttp {
                url,
                headers,
                timeout,
            } => {
                let http_client = build_http_client(&headers, timeout)?;
                let transport = StreamableHttpClientTransport::with_client(
                    http_client,
                    StreamableHttpClientTransportConfig::with_uri(url),
                );
                client_info
                    .serve(transport)
                    .await
                    .map_err(|err| BackendError::Handshake(Box::new(err)))?
            }
        };
        info!("<{}> Successfully initialized MCP client", self.name);

        let peer = running.peer().clone();
        capabilities::register_tools(
            &self.name,
            &peer,
            self.options.tool_filter.as_ref(),
            server,
        )
        .await?;

        // The remaining capability families are advertised but non-essential:
        // a backend without prompt support still contributes its tools.
        if let Err(err) = capabilities::register_prompts(&self.name, &peer, server).await {
            debug!("<{}> Skipping prompts: {}", self.name, err);
        }
        if let Err(err) = capabilities::register_resources(&self.name, &peer, server).await {
            debug!("<{}> Skipping resources: {}", self.name, err);
        }
        if let Err(err) = capabilities::register_resource_templates(&self.name, &peer, server).await
        {
            debug!("<{}> Skipping resource templates: {}", self.name, err);
        }

        *self.state.lock().await = ClientState::Running(running);

        if self.needs_ping {
            self.start_ping_task(peer, ct.child_token());
        }
        Ok(())
    }

    /// Background keep-alive for long-lived transports: one ping every
    /// 30 seconds until the gateway token is cancelled. Individual ping
    /// failures are ignored.
    fn start_ping_task(&self, peer: rmcp::service::Peer<RoleClient>, ct: CancellationToken) {
        let name = self.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ct.cancelled() => {
                        debug!("<{}> Context done, stopping ping", name);
                        break;
                    }
                    _ = tokio::time::sleep(PING_INTERVAL) => {
                        let _ = peer
                            .send_request(rmcp::model::ClientRequest::PingRequest(
                                Default::default(),
                            ))
                            .await;
                    }
                }
            }
        });
    }

    /// Release the underlying transport. Idempotent; only the first call has
    /// an effect.
    pub async fn close(&self) {
        let state = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, ClientState::Closed)
        };
        match state {
            ClientState::Running(service) => {
                let _ = service.cancel().await;
            }
            // Dropping an unstarted stdio seed reaps the child process.
            ClientState::Created(_) | ClientState::Closed => {}
        }
    }
}

fn build_http_client(
    headers: &HashMap<String, String>,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, BackendError> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|err| BackendError::Transport(Box::new(err)))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|err| BackendError::Transport(Box::new(err)))?;
        header_map.insert(name, value);
    }

    let mut builder = reqwest::Client::builder().default_headers(header_map);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|err| BackendError::Transport(Box::new(err)))
}
