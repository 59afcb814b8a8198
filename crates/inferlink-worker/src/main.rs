use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use inferlink_worker::{EchoBackend, connect, serve};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BackendKind {
    /// Stream the prompt back word by word.
    Echo,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "inferlink reference worker")]
struct Args {
    #[arg(long, env = "INFERLINK_URL", default_value = "ws://127.0.0.1:9050/connection/worker")]
    url: String,
    #[arg(long, env = "WORKER_ACCESS_KEY", hide_env_values = true)]
    access_key: String,
    #[arg(long, value_enum, default_value = "echo")]
    backend: BackendKind,
    /// Pause between streamed chunks.
    #[arg(long, default_value = "50")]
    chunk_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inferlink_worker=info".into()),
        )
        .init();

    let args = Args::parse();
    let ws = connect(&args.url, &args.access_key)
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;

    match args.backend {
        BackendKind::Echo => {
            let backend = Arc::new(EchoBackend::new(Duration::from_millis(args.chunk_delay_ms)));
            serve(ws, backend).await?;
        }
    }
    tracing::info!("broker connection closed");
    Ok(())
}
