/**
 * Per-backend MCP server.
 *
 * One `ProxyHandler` is created for every configured backend. During gateway
 * startup the capability registrar populates it with the backend's tools,
 * prompts, resources and resource templates, each paired with a forwarding
 * callback. At serve time the handler answers list requests from the
 * registered sets and dispatches invocations through the callbacks, so a call
 * received on the gateway's HTTP surface ends up on the transport of the
 * backend that owns the capability.
 */
use futures::future::BoxFuture;
use futures::FutureExt;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
        Implementation, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
        ListToolsResult, PaginatedRequestParam, Prompt, ReadResourceRequestParam,
        ReadResourceResult, Resource, ResourceTemplate, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
    Error, RoleServer, ServerHandler,
};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::utils::panic_message;

/// Forwarding callback for a registered tool.
pub type ToolHandler =
    Arc<dyn Fn(CallToolRequestParam) -> BoxFuture<'static, Result<CallToolResult, Error>> + Send + Sync>;

/// Forwarding callback for a registered prompt.
pub type PromptHandler =
    Arc<dyn Fn(GetPromptRequestParam) -> BoxFuture<'static, Result<GetPromptResult, Error>> + Send + Sync>;

/// Forwarding callback for a registered resource or resource template.
pub type ResourceHandler = Arc<
    dyn Fn(ReadResourceRequestParam) -> BoxFuture<'static, Result<ReadResourceResult, Error>>
        + Send
        + Sync,
>;

#[derive(Default)]
struct Registry {
    tools: HashMap<String, (Tool, ToolHandler)>,
    prompts: HashMap<String, (Prompt, PromptHandler)>,
    resources: HashMap<String, (Resource, ResourceHandler)>,
    resource_templates: Vec<(ResourceTemplate, ResourceHandler)>,
}

/// A per-backend MCP server backed by registered forwarding callbacks.
#[derive(Clone)]
pub struct ProxyHandler {
    name: Arc<str>,
    cached_info: Arc<ServerInfo>,
    registry: Arc<RwLock<Registry>>,
}

impl ProxyHandler {
    /// `name` is the backend name, `version` the gateway version; both are
    /// advertised as this server's implementation identity. `log_enabled`
    /// additionally advertises the MCP logging capability.
    pub fn new(name: &str, version: &str, log_enabled: bool) -> Self {
        let mut capabilities = ServerCapabilities::builder()
            .enable_tools()
            .enable_prompts()
            .enable_resources()
            .build();
        if let Some(resources) = capabilities.resources.as_mut() {
            resources.subscribe = Some(true);
            resources.list_changed = Some(true);
        }
        if log_enabled {
            capabilities.logging = Some(Default::default());
        }

        let cached_info = ServerInfo {
            protocol_version: Default::default(),
            capabilities,
            server_info: Implementation {
                name: name.to_string(),
                version: version.to_string(),
            },
            instructions: None,
        };

        Self {
            name: Arc::from(name),
            cached_info: Arc::new(cached_info),
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    pub async fn add_tool(&self, tool: Tool, handler: ToolHandler) {
        let mut registry = self.registry.write().await;
        registry.tools.insert(tool.name.to_string(), (tool, handler));
    }

    pub async fn add_prompt(&self, prompt: Prompt, handler: PromptHandler) {
        let mut registry = self.registry.write().await;
        registry.prompts.insert(prompt.name.clone(), (prompt, handler));
    }

    pub async fn add_resource(&self, resource: Resource, handler: ResourceHandler) {
        let mut registry = self.registry.write().await;
        registry
            .resources
            .insert(resource.uri.clone(), (resource, handler));
    }

    pub async fn add_resource_template(&self, template: ResourceTemplate, handler: ResourceHandler) {
        let mut registry = self.registry.write().await;
        registry.resource_templates.push((template, handler));
    }

    /// Run a forwarding callback, converting a panic into an MCP internal
    /// error instead of unwinding into the server runtime.
    async fn recovered<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    "<{}> Recovered from panic in {} handler: {}",
                    self.name,
                    what,
                    panic_message(panic.as_ref())
                );
                Err(Error::internal_error(
                    format!("{what} handler panicked"),
                    None,
                ))
            }
        }
    }

    async fn dispatch_tool(&self, request: CallToolRequestParam) -> Result<CallToolResult, Error> {
        let handler = {
            let registry = self.registry.read().await;
            registry
                .tools
                .get(request.name.as_ref())
                .map(|(_, handler)| handler.clone())
        };
        let Some(handler) = handler else {
            return Err(Error::invalid_params(
                format!("tool {} not found", request.name),
                None,
            ));
        };
        debug!("<{}> Forwarding tool call {}", self.name, request.name);
        self.recovered("tool", handler(request)).await
    }

    async fn dispatch_prompt(
        &self,
        request: GetPromptRequestParam,
    ) -> Result<GetPromptResult, Error> {
        let handler = {
            let registry = self.registry.read().await;
            registry
                .prompts
                .get(&request.name)
                .map(|(_, handler)| handler.clone())
        };
        let Some(handler) = handler else {
            return Err(Error::invalid_params(
                format!("prompt {} not found", request.name),
                None,
            ));
        };
        debug!("<{}> Forwarding prompt request {}", self.name, request.name);
        self.recovered("prompt", handler(request)).await
    }

    async fn dispatch_read(
        &self,
        request: ReadResourceRequestParam,
    ) -> Result<ReadResourceResult, Error> {
        let handler = {
            let registry = self.registry.read().await;
            if let Some((_, handler)) = registry.resources.get(&request.uri) {
                Some(handler.clone())
            } else {
                // No exact match: fall back to a registered template whose
                // static prefix (up to the first expansion) covers the URI.
                registry
                    .resource_templates
                    .iter()
                    .find(|(template, _)| {
                        let prefix = template.uri_template.split('{').next().unwrap_or_default();
                        !prefix.is_empty() && request.uri.starts_with(prefix)
                    })
                    .map(|(_, handler)| handler.clone())
            }
        };
        let Some(handler) = handler else {
            return Err(Error::resource_not_found(
                format!("resource {} not found", request.uri),
                None,
            ));
        };
        debug!("<{}> Forwarding resource read {}", self.name, request.uri);
        self.recovered("resource", handler(request)).await
    }
}

impl ServerHandler for ProxyHandler {
    fn get_info(&self) -> ServerInfo {
        self.cached_info.as_ref().clone()
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, Error> {
        let registry = self.registry.read().await;
        let tools = registry
            .tools
            .values()
            .map(|(tool, _)| tool.clone())
            .collect();
        Ok(ListToolsResult {
            next_cursor: None,
            tools,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, Error> {
        self.dispatch_tool(request).await
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, Error> {
        let registry = self.registry.read().await;
        let prompts = registry
            .prompts
            .values()
            .map(|(prompt, _)| prompt.clone())
            .collect();
        Ok(ListPromptsResult {
            next_cursor: None,
            prompts,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, Error> {
        self.dispatch_prompt(request).await
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, Error> {
        let registry = self.registry.read().await;
        let resources = registry
            .resources
            .values()
            .map(|(resource, _)| resource.clone())
            .collect();
        Ok(ListResourcesResult {
            next_cursor: None,
            resources,
        })
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, Error> {
        let registry = self.registry.read().await;
        let resource_templates = registry
            .resource_templates
            .iter()
            .map(|(template, _)| template.clone())
            .collect();
        Ok(ListResourceTemplatesResult {
            next_cursor: None,
            resource_templates,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, Error> {
        self.dispatch_read(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{AnnotateAble, Content, RawResource, RawResourceTemplate, ResourceContents};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_tool(name: &str) -> Tool {
        Tool::new(
            name.to_string(),
            "a test tool",
            Arc::new(serde_json::Map::new()),
        )
    }

    fn handler() -> ProxyHandler {
        ProxyHandler::new("github", "1.0.0", false)
    }

    #[tokio::test]
    async fn tool_calls_are_forwarded_to_the_registered_callback() {
        let proxy = handler();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        proxy
            .add_tool(
                test_tool("create_file"),
                Arc::new(move |request| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(CallToolResult::success(vec![Content::text(
                            request.name.to_string(),
                        )]))
                    }
                    .boxed()
                }),
            )
            .await;

        let result = proxy
            .dispatch_tool(CallToolRequestParam {
                name: "create_file".into(),
                arguments: None,
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.is_error, Some(false));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let proxy = handler();
        let err = proxy
            .dispatch_tool(CallToolRequestParam {
                name: "missing".into(),
                arguments: None,
            })
            .await
            .unwrap_err();
        assert!(err.message.contains("missing"));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let proxy = handler();
        proxy
            .add_tool(
                test_tool("bomb"),
                Arc::new(|_| async move { panic!("boom") }.boxed()),
            )
            .await;
        proxy
            .add_tool(
                test_tool("ok"),
                Arc::new(|_| async move { Ok(CallToolResult::success(vec![Content::text("fine")])) }.boxed()),
            )
            .await;

        let err = proxy
            .dispatch_tool(CallToolRequestParam {
                name: "bomb".into(),
                arguments: None,
            })
            .await
            .unwrap_err();
        assert!(err.message.contains("panicked"));

        // The handler keeps serving after a panic.
        proxy
            .dispatch_tool(CallToolRequestParam {
                name: "ok".into(),
                arguments: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resource_reads_fall_back_to_templates() {
        let proxy = handler();
        proxy
            .add_resource(
                RawResource::new("repo://readme", "readme").no_annotation(),
                Arc::new(|request| {
                    async move {
                        Ok(ReadResourceResult {
                            contents: vec![ResourceContents::text("exact", request.uri)],
                        })
                    }
                    .boxed()
                }),
            )
            .await;
        proxy
            .add_resource_template(
                RawResourceTemplate {
                    uri_template: "repo://files/{path}".to_string(),
                    name: "files".to_string(),
                    description: None,
                    mime_type: None,
                }
                .no_annotation(),
                Arc::new(|request| {
                    async move {
                        Ok(ReadResourceResult {
                            contents: vec![ResourceContents::text("templated", request.uri)],
                        })
                    }
                    .boxed()
                }),
            )
            .await;

        let exact = proxy
            .dispatch_read(ReadResourceRequestParam {
                uri: "repo://readme".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            &exact.contents[0],
            ResourceContents::TextResourceContents { text, .. } if text == "exact"
        ));

        let templated = proxy
            .dispatch_read(ReadResourceRequestParam {
                uri: "repo://files/src/main.rs".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            &templated.contents[0],
            ResourceContents::TextResourceContents { text, .. } if text == "templated"
        ));

        proxy
            .dispatch_read(ReadResourceRequestParam {
                uri: "other://nope".into(),
            })
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn get_info_advertises_resource_capabilities() {
        let info = handler().get_info();
        let resources = info.capabilities.resources.expect("resources capability");
        assert_eq!(resources.subscribe, Some(true));
        assert_eq!(resources.list_changed, Some(true));
        assert!(info.capabilities.logging.is_none());
        assert_eq!(info.server_info.name, "github");

        let logging = ProxyHandler::new("github", "1.0.0", true).get_info();
        assert!(logging.capabilities.logging.is_some());
    }
}
