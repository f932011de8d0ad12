/**
 * Gateway configuration: typed model, loader, and transport inference.
 *
 * The JSON document is loaded from a local path or an http(s) URL. After
 * parsing, proxy-level options are propagated to backends that did not set
 * them, and every backend's transport variant is resolved up front so the
 * rest of the crate only ever sees the closed `TransportConfig` sum.
 */
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("mcpProxy is required")]
    MissingProxy,
    #[error("mcpServers is required")]
    MissingServers,
    #[error("command is required for stdio transport")]
    MissingCommand,
    #[error("invalid server type")]
    InvalidServerType,
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("<{name}> {source}")]
    Backend {
        name: String,
        #[source]
        source: Box<ConfigError>,
    },
}

/// Transport selector that a backend may declare explicitly. When omitted the
/// variant is inferred from the populated fields, see [`resolve_transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Tool filter: `allow` admits only listed names, `block` admits everything
/// except listed names. Mode is matched case-insensitively; an unknown mode
/// disables filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolFilterConfig {
    pub mode: String,
    pub list: Vec<String>,
}

/// Options shared by the proxy and the backends.
///
/// `panic_if_invalid`, `log_enabled` and `auth_tokens` are tri-state: `None`
/// means "unset, inherit the proxy-level value", which is distinct from an
/// explicit `false` or an explicit empty token list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panic_if_invalid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_tokens: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_filter: Option<ToolFilterConfig>,
}

impl Options {
    /// Effective auth token list (empty when unset).
    pub fn auth_tokens(&self) -> &[String] {
        self.auth_tokens.as_deref().unwrap_or(&[])
    }
}

/// Proxy-level settings: the externally visible base URL, the listen address
/// and the implementation identity advertised to backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub addr: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub options: Options,
}

/// Flat wire shape of a backend entry. The concrete transport variant is
/// resolved by [`resolve_transport`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_type: Option<TransportType>,

    // stdio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    // sse / streamable-http
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Request timeout in seconds, streamable-http only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    pub options: Options,
}

/// Closed sum of the supported backend transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
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

/// Infer the transport variant from the populated fields.
///
/// A non-empty `command` (or an explicit `stdio` declaration) wins over
/// everything else; otherwise a non-empty `url` selects streamable-http when
/// declared and sse by default.
pub fn resolve_transport(conf: &BackendConfig) -> Result<TransportConfig, ConfigError> {
    let command = conf.command.as_deref().unwrap_or("");
    if !command.is_empty() || conf.transport_type == Some(TransportType::Stdio) {
        if command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        return Ok(TransportConfig::Stdio {
            command: command.to_string(),
            args: conf.args.clone(),
            env: conf.env.clone(),
        });
    }
    if let Some(url) = conf.url.as_deref().filter(|u| !u.is_empty()) {
        if conf.transport_type == Some(TransportType::StreamableHttp) {
            return Ok(TransportConfig::StreamableHttp {
                url: url.to_string(),
                headers: conf.headers.clone(),
                timeout: conf.timeout.map(Duration::from_secs),
            });
        }
        return Ok(TransportConfig::Sse {
            url: url.to_string(),
            headers: conf.headers.clone(),
        });
    }
    Err(ConfigError::InvalidServerType)
}

/// The whole gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "mcpProxy")]
    pub mcp_proxy: ProxyConfig,
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, BackendConfig>,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(rename = "mcpProxy")]
    mcp_proxy: Option<ProxyConfig>,
    #[serde(rename = "mcpServers")]
    mcp_servers: Option<HashMap<String, BackendConfig>>,
}

/// Load the configuration from a local file path or an http(s) URL.
pub async fn load(path: &str) -> Result<Config, ConfigError> {
    let bytes = if path.starts_with("http://") || path.starts_with("https://") {
        reqwest::get(path)
            .await?
            .error_for_status()?
            .bytes()
            .await?
            .to_vec()
    } else {
        tokio::fs::read(path).await?
    };
    parse(&bytes)
}

/// Parse and validate a configuration document.
pub fn parse(bytes: &[u8]) -> Result<Config, ConfigError> {
    let raw: RawConfig = serde_json::from_slice(bytes)?;
    let proxy = raw.mcp_proxy.ok_or(ConfigError::MissingProxy)?;
    let mut servers = raw.mcp_servers.ok_or(ConfigError::MissingServers)?;

    let defaults = proxy.options.clone();
    for (name, backend) in servers.iter_mut() {
        if name.is_empty() || name.contains('/') {
            return Err(ConfigError::InvalidServerName(name.clone()));
        }
        let options = &mut backend.options;
        if options.auth_tokens.is_none() {
            options.auth_tokens = defaults.auth_tokens.clone();
        }
        if options.panic_if_invalid.is_none() {
            options.panic_if_invalid = defaults.panic_if_invalid;
        }
        if options.log_enabled.is_none() {
            options.log_enabled = defaults.log_enabled;
        }
        resolve_transport(backend).map_err(|source| ConfigError::Backend {
            name: name.clone(),
            source: Box::new(source),
        })?;
    }

    Ok(Config {
        mcp_proxy: proxy,
        mcp_servers: servers,
    })
}
