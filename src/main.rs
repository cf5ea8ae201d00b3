//! winprob - live win-probability engine server
//!
//! Loads configuration, opens the cold store and serves REST + websocket
//! traffic until the process is stopped.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use winprob_engine::{api, Engine, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "winprob")]
#[command(about = "Live win-probability engine: ingest, smooth, persist, stream and replay")]
struct Args {
    /// TOML config file
    #[arg(long, env = "WINPROB_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides config
    #[arg(long)]
    bind: Option<String>,

    /// Cold store root, overrides config
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();
    let args = Args::parse();

    let mut config = EngineConfig::resolve(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    config.data_dir = resolve_data_dir(&config.data_dir);
    config.validate()?;

    info!("🏈 Win-probability engine starting");
    info!(
        "⚙️ alpha={} window={} latency_bound={}ms data_dir={}",
        config.alpha,
        config.window_size,
        config.latency_bound_ms,
        config.data_dir.display()
    );

    let bind_addr = config.bind_addr.clone();
    let engine = Arc::new(Engine::open(config).context("Failed to start engine")?);
    let app = api::create_router(engine);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("🎯 API server listening on {}", bind_addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "winprob_engine=debug,winprob=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Relative data dirs resolve against the crate root, not the caller's cwd.
fn resolve_data_dir(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    Path::new(env!("CARGO_MANIFEST_DIR")).join(path)
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also the crate-root .env when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_data_dir() {
        let abs = PathBuf::from("/var/lib/winprob");
        assert_eq!(resolve_data_dir(&abs), abs);
        let rel = resolve_data_dir(Path::new("data"));
        assert!(rel.is_absolute());
        assert!(rel.ends_with("data"));
    }

    #[test]
    fn test_cli_overrides_parse() {
        let args = Args::parse_from(["winprob", "--bind", "127.0.0.1:9000", "--data-dir", "/tmp/wp"]);
        assert_eq!(args.bind.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(args.data_dir, Some(PathBuf::from("/tmp/wp")));
    }
}
