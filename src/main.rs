use clap::Parser;
use prompt_cache_proxy::config::config_search_paths;
use prompt_cache_proxy::{build_router, AppState, ProxyConfig, SharedAccessLog, UpstreamClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "prompt-cache-proxy",
    about = "Anthropic/OpenAI proxy that injects prompt-cache annotations",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Provider preset, used when no config file is found
    #[arg(long)]
    provider: Option<String>,

    /// Access log file (JSONL)
    #[arg(long, default_value = "prompt-cache-proxy.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prompt_cache_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref(), cli.provider.as_deref())?;

    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    // The key is read here, once; request handling never touches the environment.
    let target = config.upstream_target()?;
    let access_log = SharedAccessLog::open(&cli.log_file)?;

    info!("prompt-cache-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Provider:      {}", target.provider);
    info!("  Dialect:       {}", target.dialect);
    info!("  Endpoint:      {}", target.endpoint);
    info!("  API key:       {}", target.masked_key());
    info!("  Cache marker:  {}", target.cache_control.to_value());
    info!("  Pool:          {} connections", target.pool_capacity);
    info!("  Access log:    {}", cli.log_file.display());

    let upstream = UpstreamClient::new(target)?;
    let state = Arc::new(AppState::new(config.clone(), upstream, access_log));
    let shutdown = state.shutdown.clone();

    let app = build_router(state.clone());
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}{}", bind_addr, state.upstream.target().dialect.chat_path());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels every open session.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutting down, closing active streams");
    shutdown.cancel();
}
