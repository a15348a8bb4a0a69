//! s3venti server
//!
//! Serves the Venti protocol over TCP, storing blocks through the tiered
//! block store (local index, shared cache, durable object store).

mod protocol;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use s3venti_common::Config;
use s3venti_common::config::{BackendKind, LoggingConfig, WriteStrategy};
use s3venti_store::BlockStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::server::VentiServer;

#[derive(Parser, Debug)]
#[command(name = "s3venti-server")]
#[command(about = "Venti block server backed by S3")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/s3venti/s3venti.toml")]
    config: PathBuf,

    /// Venti listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Durable backend (s3 or memory)
    #[arg(long, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    /// S3 bucket
    #[arg(long)]
    bucket: Option<String>,

    /// S3 endpoint URL
    #[arg(long)]
    endpoint: Option<String>,

    /// memcached address (host:port)
    #[arg(long)]
    memcache: Option<String>,

    /// Local index database path
    #[arg(long)]
    index: Option<PathBuf>,

    /// Write strategy (direct or batched)
    #[arg(long, value_parser = parse_strategy)]
    strategy: Option<WriteStrategy>,

    /// Blocks per chunk before a batched flush
    #[arg(long)]
    chunk_blocks: Option<usize>,

    /// Milliseconds an open chunk waits before a batched flush
    #[arg(long)]
    chunk_age_ms: Option<u64>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Debug verbosity (1 = debug, 2 = trace)
    #[arg(short, long, default_value_t = 0)]
    debug: u8,
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    match s {
        "s3" => Ok(BackendKind::S3),
        "memory" => Ok(BackendKind::Memory),
        other => Err(format!("unknown backend {other:?} (expected s3 or memory)")),
    }
}

fn parse_strategy(s: &str) -> Result<WriteStrategy, String> {
    match s {
        "direct" => Ok(WriteStrategy::Direct),
        "batched" => Ok(WriteStrategy::Batched),
        other => Err(format!(
            "unknown strategy {other:?} (expected direct or batched)"
        )),
    }
}

impl Args {
    /// Command-line values win over the configuration file
    fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if let Some(kind) = self.backend {
            config.backend.kind = kind;
        }
        if let Some(bucket) = self.bucket {
            config.backend.bucket = bucket;
        }
        if let Some(endpoint) = self.endpoint {
            config.backend.endpoint = endpoint;
        }
        if let Some(address) = self.memcache {
            config.shared_cache.address = Some(address);
        }
        if let Some(path) = self.index {
            config.index.path = Some(path);
        }
        if let Some(strategy) = self.strategy {
            config.batching.strategy = strategy;
        }
        if let Some(blocks) = self.chunk_blocks {
            config.batching.max_blocks = blocks;
        }
        if let Some(age) = self.chunk_age_ms {
            config.batching.max_age_ms = age;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.debug > 0 {
            config.logging.debug = self.debug;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.effective_level().into());
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone();
    let mut config = Config::load(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    args.apply(&mut config);

    init_tracing(&config.logging);

    info!("Starting s3venti server");
    info!("Config file: {}", config_path.display());
    info!("Local index: {}", config.index.resolved_path().display());

    let store = Arc::new(
        BlockStore::open(&config)
            .await
            .context("open block store")?,
    );

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("bind {}", config.server.listen))?;

    let server = Arc::new(VentiServer::new(Arc::clone(&store)));
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };
    server
        .serve(listener, shutdown)
        .await
        .context("serve venti protocol")?;

    if let Err(e) = store.close().await {
        error!("Final flush failed: {e}");
        return Err(e).context("close block store");
    }
    info!("s3venti server shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config_file() {
        let mut config = Config::from_toml(
            r#"
            [server]
            listen = "127.0.0.1:1"

            [backend]
            bucket = "from-file"
            "#,
        )
        .unwrap();

        let args = Args::parse_from([
            "s3venti-server",
            "--bucket",
            "from-flag",
            "--backend",
            "memory",
            "--strategy",
            "batched",
            "-d",
            "2",
        ]);
        args.apply(&mut config);

        assert_eq!(config.server.listen, "127.0.0.1:1");
        assert_eq!(config.backend.bucket, "from-flag");
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.batching.strategy, WriteStrategy::Batched);
        assert_eq!(config.logging.effective_level(), "trace");
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!(
            Args::try_parse_from(["s3venti-server", "--strategy", "eventual"]).is_err()
        );
    }
}
