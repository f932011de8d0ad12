/**
 * The entry point for the mcp-gateway application.
 * It sets up logging, loads the configuration and runs the gateway.
 */
use clap::Parser;
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// MCP Gateway CLI arguments
#[derive(Parser)]
#[command(
    name = "mcp-gateway",
    version,
    about = "Aggregate multiple MCP servers behind a single HTTP endpoint.",
    long_about = None,
    after_help = "Examples:\n  \
        Start the gateway with a local config file:\n  \
        mcp-gateway --config config.json\n\n  \
        Load the config from a URL:\n  \
        mcp-gateway --config https://example.com/mcp-gateway.json
",
)]
struct Cli {
    /// Path to the config file or a http(s) url
    #[arg(
        short,
        long,
        default_value = "config.json",
        env = "MCP_GATEWAY_CONFIG"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = rmcp_gateway::load(&cli.config).await?;
    rmcp_gateway::run(config).await?;

    Ok(())
}
