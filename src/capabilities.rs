/**
 * Capability registrar.
 *
 * Pages through a connected backend's capability lists and re-registers each
 * entry on the backend's `ProxyHandler` with a callback that forwards the
 * invocation to the backend peer. Pagination stops on an empty page (even if
 * the backend handed back a cursor) or on a missing/empty next cursor, so a
 * misbehaving backend cannot spin the loop forever.
 *
 * Filtering applies to tools only; prompts, resources and resource templates
 * are registered unconditionally.
 */
use futures::FutureExt;
use rmcp::{
    model::PaginatedRequestParam,
    service::{Peer, ServiceError},
    Error, RoleClient,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::BackendError;
use crate::config::ToolFilterConfig;
use crate::proxy_handler::ProxyHandler;

/// Tool admission policy compiled once per backend.
pub(crate) enum ToolFilter {
    AdmitAll,
    Allow(HashSet<String>),
    Block(HashSet<String>),
}

impl ToolFilter {
    /// An unknown mode admits everything; the warning is emitted once here
    /// rather than per tool.
    pub(crate) fn compile(name: &str, conf: Option<&ToolFilterConfig>) -> Self {
        let Some(conf) = conf.filter(|conf| !conf.list.is_empty()) else {
            return Self::AdmitAll;
        };
        let set: HashSet<String> = conf.list.iter().cloned().collect();
        match conf.mode.to_lowercase().as_str() {
            "allow" => Self::Allow(set),
            "block" => Self::Block(set),
            other => {
                warn!(
                    "<{}> Unknown tool filter mode: {}, skipping tool filter",
                    name, other
                );
                Self::AdmitAll
            }
        }
    }

    pub(crate) fn admits(&self, name: &str, tool: &str) -> bool {
        match self {
            Self::AdmitAll => true,
            Self::Allow(set) => {
                let in_list = set.contains(tool);
                if !in_list {
                    info!("<{}> Ignoring tool {} as it is not in allow list", name, tool);
                }
                in_list
            }
            Self::Block(set) => {
                let in_list = set.contains(tool);
                if in_list {
                    info!("<{}> Ignoring tool {} as it is in block list", name, tool);
                }
                !in_list
            }
        }
    }
}

fn service_error_to_mcp(err: ServiceError) -> Error {
    match err {
        ServiceError::McpError(err) => err,
        other => Error::internal_error(other.to_string(), None),
    }
}

fn page_request(cursor: &Option<String>) -> Option<PaginatedRequestParam> {
    cursor.clone().map(|cursor| PaginatedRequestParam {
        cursor: Some(cursor),
    })
}

/// Advance the cursor; `None` means the pagination is finished.
fn next_page(next_cursor: Option<String>) -> Option<String> {
    next_cursor.filter(|cursor| !cursor.is_empty())
}

/// Register the backend's tools, applying the configured tool filter.
/// A listing failure here is fatal for the backend.
pub async fn register_tools(
    name: &str,
    peer: &Peer<RoleClient>,
    filter: Option<&ToolFilterConfig>,
    server: &ProxyHandler,
) -> Result<(), BackendError> {
    let filter = ToolFilter::compile(name, filter);
    let mut cursor: Option<String> = None;
    loop {
        let result = peer
            .list_tools(page_request(&cursor))
            .await
            .map_err(|source| BackendError::Capability {
                family: "tools",
                source,
            })?;
        if result.tools.is_empty() {
            break;
        }
        info!("<{}> Successfully listed {} tools", name, result.tools.len());

        for tool in result.tools {
            if filter.admits(name, tool.name.as_ref()) {
                info!("<{}> Adding tool {}", name, tool.name);
                let peer = peer.clone();
                server
                    .add_tool(
                        tool,
                        Arc::new(move |request| {
                            let peer = peer.clone();
                            async move {
                                peer.call_tool(request).await.map_err(service_error_to_mcp)
                            }
                            .boxed()
                        }),
                    )
                    .await;
            }
        }

        cursor = match next_page(result.next_cursor) {
            Some(cursor) => Some(cursor),
            None => break,
        };
    }
    Ok(())
}

/// Register the backend's prompts.
pub async fn register_prompts(
    name: &str,
    peer: &Peer<RoleClient>,
    server: &ProxyHandler,
) -> Result<(), BackendError> {
    let mut cursor: Option<String> = None;
    loop {
        let result = peer
            .list_prompts(page_request(&cursor))
            .await
            .map_err(|source| BackendError::Capability {
                family: "prompts",
                source,
            })?;
        if result.prompts.is_empty() {
            break;
        }
        info!(
            "<{}> Successfully listed {} prompts",
            name,
            result.prompts.len()
        );

        for prompt in result.prompts {
            info!("<{}> Adding prompt {}", name, prompt.name);
            let peer = peer.clone();
            server
                .add_prompt(
                    prompt,
                    Arc::new(move |request| {
                        let peer = peer.clone();
                        async move { peer.get_prompt(request).await.map_err(service_error_to_mcp) }
                            .boxed()
                    }),
                )
                .await;
        }

        cursor = match next_page(result.next_cursor) {
            Some(cursor) => Some(cursor),
            None => break,
        };
    }
    Ok(())
}

/// Register the backend's resources. The read callback returns the backend's
/// contents payload verbatim.
pub async fn register_resources(
    name: &str,
    peer: &Peer<RoleClient>,
    server: &ProxyHandler,
) -> Result<(), BackendError> {
    let mut cursor: Option<String> = None;
    loop {
        let result = peer
            .list_resources(page_request(&cursor))
            .await
            .map_err(|source| BackendError::Capability {
                family: "resources",
                source,
            })?;
        if result.resources.is_empty() {
            break;
        }
        info!(
            "<{}> Successfully listed {} resources",
            name,
            result.resources.len()
        );

        for resource in result.resources {
            info!("<{}> Adding resource {}", name, resource.name);
            let peer = peer.clone();
            server
                .add_resource(
                    resource,
                    Arc::new(move |request| {
                        let peer = peer.clone();
                        async move {
                            peer.read_resource(request)
                                .await
                                .map_err(service_error_to_mcp)
                        }
                        .boxed()
                    }),
                )
                .await;
        }

        cursor = match next_page(result.next_cursor) {
            Some(cursor) => Some(cursor),
            None => break,
        };
    }
    Ok(())
}

/// Register the backend's resource templates. Reads against a template are
/// forwarded the same way as plain resource reads.
pub async fn register_resource_templates(
    name: &str,
    peer: &Peer<RoleClient>,
    server: &ProxyHandler,
) -> Result<(), BackendError> {
    let mut cursor: Option<String> = None;
    loop {
        let result = peer
            .list_resource_templates(page_request(&cursor))
            .await
            .map_err(|source| BackendError::Capability {
                family: "resource templates",
                source,
            })?;
        if result.resource_templates.is_empty() {
            break;
        }
        info!(
            "<{}> Successfully listed {} resource templates",
            name,
            result.resource_templates.len()
        );

        for template in result.resource_templates {
            info!("<{}> Adding resource template {}", name, template.name);
            let peer = peer.clone();
            server
                .add_resource_template(
                    template,
                    Arc::new(move |request| {
                        let peer = peer.clone();
                        async move {
                            peer.read_resource(request)
                                .await
                                .map_err(service_error_to_mcp)
                        }
                        .boxed()
                    }),
                )
                .await;
        }

        cursor = match next_page(result.next_cursor) {
            Some(cursor) => Some(cursor),
            None => break,
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(mode: &str, list: &[&str]) -> ToolFilter {
        ToolFilter::compile(
            "test",
            Some(&ToolFilterConfig {
                mode: mode.to_string(),
                list: list.iter().map(|s| s.to_string()).collect(),
            }),
        )
    }

    #[test]
    fn allow_mode_admits_only_listed_tools() {
        let filter = filter("allow", &["a", "c"]);
        assert!(filter.admits("test", "a"));
        assert!(!filter.admits("test", "b"));
        assert!(filter.admits("test", "c"));
    }

    #[test]
    fn block_mode_rejects_listed_tools() {
        let filter = filter("block", &["b"]);
        assert!(filter.admits("test", "a"));
        assert!(!filter.admits("test", "b"));
    }

    #[test]
    fn mode_is_case_insensitive() {
        let filter = filter("ALLOW", &["a"]);
        assert!(filter.admits("test", "a"));
        assert!(!filter.admits("test", "b"));
    }

    #[test]
    fn unknown_mode_admits_everything() {
        let filter = filter("whitelist", &["a"]);
        assert!(filter.admits("test", "a"));
        assert!(filter.admits("test", "b"));
    }

    #[test]
    fn empty_list_disables_filtering() {
        let filter = filter("allow", &[]);
        assert!(filter.admits("test", "anything"));
    }

    #[test]
    fn missing_filter_admits_everything() {
        let filter = ToolFilter::compile("test", None);
        assert!(filter.admits("test", "anything"));
    }

    #[test]
    fn pagination_cursor_handling() {
        assert_eq!(next_page(None), None);
        assert_eq!(next_page(Some(String::new())), None);
        assert_eq!(next_page(Some("abc".into())), Some("abc".to_string()));
        assert!(page_request(&None).is_none());
        assert_eq!(
            page_request(&Some("abc".into())).and_then(|p| p.cursor),
            Some("abc".to_string())
        );
    }
}
