use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use inferlink_server::{AppState, app, build_cors};
use libinferlink::{AccessKeyAdmission, BrokerConfig, ConnectionManager};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(author, version, about = "inferlink broker: queues chat groups onto inference workers")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:9050")]
    listen: String,
    /// TOML file with broker settings.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Shared key workers present in the `access_key` cookie.
    #[arg(long, env = "WORKER_ACCESS_KEY", hide_env_values = true)]
    worker_access_key: String,
    /// Allowed CORS origin; repeat for several. `*` allows any.
    #[arg(long = "allow-origin", default_value = "*")]
    allow_origins: Vec<String>,
    /// Overrides `heartbeat_secs` from the config file.
    #[arg(long)]
    heartbeat_secs: Option<u64>,
    /// Overrides `system_prompt` from the config file.
    #[arg(long)]
    system_prompt: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inferlink_server=info,libinferlink=info".into()),
        )
        .init();

    let args = Args::parse();
    if args.worker_access_key.is_empty() {
        bail!("--worker-access-key must not be empty");
    }
    let addr: SocketAddr = args
        .listen
        .parse()
        .with_context(|| format!("invalid --listen {}", args.listen))?;

    let mut config = BrokerConfig::load(args.config.as_deref())
        .context("failed to load broker config")?;
    if let Some(secs) = args.heartbeat_secs {
        config.heartbeat_secs = secs;
    }
    if let Some(prompt) = args.system_prompt {
        config.system_prompt = prompt;
    }

    let state = AppState::new(
        ConnectionManager::new(config),
        Arc::new(AccessKeyAdmission::new(args.worker_access_key)),
    );
    let router = app(state).layer(build_cors(&args.allow_origins)?);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("inferlink-server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router).await?;
    Ok(())
}
