//! Dataverse MCP Server
//!
//! Entry point for the MCP server binary.
//! Implements MCP protocol over stdio using JSON-RPC 2.0.

use dataverse_connector::config::{Config, DEFAULT_LOG_LEVEL};
use dataverse_connector::mcp::{DataverseMcpServer, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_filter = init_logging();

    // Load configuration
    let config = Config::load_default()?;
    let runtime_config = config.to_runtime()?;

    if let Some(handle) = log_filter {
        handle.reload(EnvFilter::new(&runtime_config.log_level))?;
    }

    tracing::info!("Starting Dataverse MCP Server...");

    match runtime_config.environment_url {
        Some(ref url) => tracing::info!("Configured for environment {}", url),
        None => tracing::warn!(
            "No environment URL configured; every call must supply custom authentication options"
        ),
    }

    let server = DataverseMcpServer::from_runtime(&runtime_config)?;

    tracing::info!("MCP Server ready, listening on stdio...");

    // Run stdio message loop
    run_stdio_loop(server).await
}

/// Logging goes to stderr; stdout carries the protocol.
///
/// `RUST_LOG` pins the filter. Otherwise the default level applies until the configured
/// one is known, and the returned handle swaps it in.
fn init_logging() -> Option<FilterHandle> {
    let from_env = EnvFilter::try_from_default_env().ok();
    let pinned = from_env.is_some();
    let (filter, handle) =
        reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_LEVEL)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    (!pinned).then_some(handle)
}

async fn run_stdio_loop(server: DataverseMcpServer) -> anyhow::Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        tracing::debug!("Received: {}", line);

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let error_response =
                    JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {}", e));
                send_response(&mut stdout, &error_response).await?;
                continue;
            }
        };

        // Notifications carry no id and get no answer
        let is_notification = request.id.is_none();
        let response = server.handle_request(request).await;
        if !is_notification {
            send_response(&mut stdout, &response).await?;
        }
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

async fn send_response(stdout: &mut Stdout, response: &JsonRpcResponse) -> anyhow::Result<()> {
    let json = serde_json::to_string(response)?;
    tracing::debug!("Sending: {}", json);
    stdout.write_all(json.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
