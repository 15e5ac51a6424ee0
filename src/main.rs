//! Gemini MCP Server
//!
//! This binary serves Google Gemini text generation as an MCP tool, either
//! over stdio (default) or over streamable HTTP with per-client sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use gemini_mcp::config::Config;
use gemini_mcp::gemini::GeminiClient;
use gemini_mcp::logging;
use gemini_mcp::server::{GeminiMcpServer, ServerMode};
use gemini_mcp::session::{
    serve_http, McpRouter, RouterConfig, SessionRegistry, ShutdownController,
    TransportRegistry, RESPONSE_GRACE,
};
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "gemini-mcp", version, about = "Gemini MCP Server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the MCP server over stdio (default)
    Serve,
    /// Run the MCP server over streamable HTTP with per-client sessions
    ServeHttp(ServeHttpArgs),
}

#[derive(Args)]
struct ServeHttpArgs {
    /// Bind address override (default: 127.0.0.1:<MCP_PORT>)
    #[arg(long)]
    bind: Option<String>,
    /// SSE keep-alive interval in seconds (0 disables)
    #[arg(long, default_value_t = 15)]
    sse_keep_alive_secs: u64,
}

fn main() -> anyhow::Result<()> {
    // Configuration is validated before anything is built from it; a bad
    // environment never gets as far as serving a request.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    // Logging goes to stderr; stdout is the MCP protocol channel in stdio mode.
    logging::init(config.log_level);

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_stdio(config),
        Command::ServeHttp(args) => run_http(config, args),
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

fn run_stdio(config: Config) -> anyhow::Result<()> {
    info!("Starting Gemini MCP server (stdio mode)");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let client = Arc::new(GeminiClient::new(&config)?);
        let server = GeminiMcpServer::new(client, ServerMode::Stdio);

        info!("MCP server listening on stdio");
        let service = server.serve(stdio()).await?;

        tokio::select! {
            quit = service.waiting() => match quit {
                Ok(reason) => info!(?reason, "stdio transport closed"),
                Err(e) => error!(error = %e, "server task failed"),
            },
            _ = wait_for_shutdown_signal() => {
                info!("Shutdown signal received");
            }
        }

        info!("MCP server shutting down");
        Ok::<_, anyhow::Error>(())
    })?;

    info!("Server stopped");
    Ok(())
}

fn run_http(config: Config, args: ServeHttpArgs) -> anyhow::Result<()> {
    info!("Starting Gemini MCP server (streamable HTTP mode)");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let client = Arc::new(GeminiClient::new(&config)?);

        let bind = args
            .bind
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", config.port));
        let bind_addr: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;

        let registry: Arc<TransportRegistry> = Arc::new(SessionRegistry::new());
        let controller = Arc::new(ShutdownController::new());

        let keep_alive = (args.sse_keep_alive_secs != 0)
            .then(|| Duration::from_secs(args.sse_keep_alive_secs));
        let factory_client = Arc::clone(&client);
        let router = McpRouter::new(
            Arc::clone(&registry),
            Arc::new(move || {
                GeminiMcpServer::new(Arc::clone(&factory_client), ServerMode::Http)
            }),
            RouterConfig {
                allowed_origins: config.allowed_origins.clone(),
                response_timeout: config.request_timeout + RESPONSE_GRACE,
                sse_keep_alive: keep_alive,
            },
        );

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("bind failed: {e}"))?;
        info!("MCP HTTP server listening on http://{bind_addr}");

        // Signal-triggered shutdown: log the reason, close every session
        // best-effort, then stop the accept loop. Re-entrant triggers are
        // rejected by the controller.
        {
            let controller = Arc::clone(&controller);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                if wait_for_shutdown_signal().await.is_ok()
                    && controller.begin("termination signal")
                {
                    controller.close_all_sessions(&registry).await;
                    controller.finish();
                }
            });
        }

        if let Err(e) = serve_http(listener, router, controller.cancel_token()).await {
            // An accept failure is unrecoverable; run the same shutdown
            // sequence a signal would and exit cleanly.
            error!(error = %e, "HTTP server error");
            if controller.begin("unrecoverable server error") {
                controller.close_all_sessions(&registry).await;
                controller.finish();
            }
        }

        Ok::<_, anyhow::Error>(())
    })?;

    info!("Server stopped");
    Ok(())
}
