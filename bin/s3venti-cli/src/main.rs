//! s3venti CLI - maintenance tooling
//!
//! Offline jobs against the durable store, shared cache and local index.
//! None of these are needed for the server to run.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use s3venti_common::config::BackendKind;
use s3venti_common::{Config, ContentAddresser};
use s3venti_store::maintenance::{
    DEFAULT_OBJECT_LIST_KEY, build_object_list, load_object_list, rebuild_chunk_refs,
    warm_markers,
};
use s3venti_store::{DurableBackend, LocalIndex, MemcachedCache, backend};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "s3venti-cli")]
#[command(about = "s3venti maintenance CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/s3venti/s3venti.toml")]
    config: PathBuf,

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

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the score of a file ("-" reads stdin)
    Score { file: PathBuf },
    /// List durable object keys
    ListKeys {
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Store the list of every durable key as one object
    MkObjectList {
        #[arg(long, default_value = "")]
        prefix: String,
        /// Object key for the list
        #[arg(long, default_value = DEFAULT_OBJECT_LIST_KEY)]
        key: String,
    },
    /// Print the head of the stored key list
    ShowObjectList {
        #[arg(long, default_value = DEFAULT_OBJECT_LIST_KEY)]
        key: String,
        /// Number of keys to print
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Set shared-cache existence markers from the stored key list
    WarmCache {
        #[arg(long, default_value = DEFAULT_OBJECT_LIST_KEY)]
        key: String,
    },
    /// Recreate score → chunk refs in the local index from chunk objects
    RebuildChunkRefs {
        /// Object key of the key list, skipped while scanning
        #[arg(long, default_value = DEFAULT_OBJECT_LIST_KEY)]
        key: String,
    },
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(&self.config)
            .with_context(|| format!("load config {}", self.config.display()))?;
        if let Some(bucket) = &self.bucket {
            config.backend.bucket = bucket.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.backend.endpoint = endpoint.clone();
        }
        if let Some(address) = &self.memcache {
            config.shared_cache.address = Some(address.clone());
        }
        if let Some(path) = &self.index {
            config.index.path = Some(path.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = args.load_config()?;

    match args.command {
        Commands::Score { file } => {
            let data = read_input(&file)?;
            println!("{}", ContentAddresser::default().score(&data));
        }
        Commands::ListKeys { prefix } => {
            let backend = open_backend(&config)?;
            let keys = backend.list_all(&prefix).await.context("list keys")?;
            for key in &keys {
                println!("{key}");
            }
            eprintln!("{} keys", keys.len());
        }
        Commands::MkObjectList { prefix, key } => {
            let backend = open_backend(&config)?;
            let keys = build_object_list(backend.as_ref(), &prefix, &key)
                .await
                .context("build object list")?;
            println!("Stored {} keys as {key}", keys.len());
        }
        Commands::ShowObjectList { key, limit } => {
            let backend = open_backend(&config)?;
            let keys = load_object_list(backend.as_ref(), &key)
                .await
                .with_context(|| format!("load object list {key}"))?;
            println!("Got {} items. First {} items:", keys.len(), limit.min(keys.len()));
            for k in keys.iter().take(limit) {
                println!("{k}");
            }
        }
        Commands::WarmCache { key } => {
            let Some(address) = config.shared_cache.address.clone() else {
                bail!("no shared cache configured (set [shared_cache] address or --memcache)");
            };
            let backend = open_backend(&config)?;
            let keys = load_object_list(backend.as_ref(), &key)
                .await
                .with_context(|| format!("load object list {key}"))?;
            let cache = MemcachedCache::new(address);
            let warmed = warm_markers(&cache, &keys).await;
            println!("Warmed {warmed} existence markers");
        }
        Commands::RebuildChunkRefs { key } => {
            let backend = open_backend(&config)?;
            let path = config.index.resolved_path();
            let index = LocalIndex::open(&path)
                .with_context(|| format!("open local index {}", path.display()))?;
            let report = rebuild_chunk_refs(backend.as_ref(), &index, &key)
                .await
                .context("rebuild chunk refs")?;
            println!(
                "Recorded {} refs from {} chunks ({} objects skipped)",
                report.refs, report.chunks, report.skipped
            );
        }
    }

    Ok(())
}

fn open_backend(config: &Config) -> Result<Arc<dyn DurableBackend>> {
    if config.backend.kind == BackendKind::Memory {
        bail!("the memory backend holds nothing outside a running server");
    }
    backend::build(&config.backend).context("open durable backend")
}

fn read_input(file: &Path) -> Result<Vec<u8>> {
    if file.as_os_str() == "-" {
        let mut data = Vec::new();
        std::io::stdin()
            .read_to_end(&mut data)
            .context("read stdin")?;
        return Ok(data);
    }
    std::fs::read(file).with_context(|| format!("read {}", file.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcommand_defaults() {
        let args = Args::parse_from(["s3venti-cli", "show-object-list"]);
        match args.command {
            Commands::ShowObjectList { key, limit } => {
                assert_eq!(key, "allKeys.bin");
                assert_eq!(limit, 10);
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "s3venti-cli",
            "--config",
            "/nonexistent/s3venti.toml",
            "--bucket",
            "daves-venti",
            "--memcache",
            "127.0.0.1:11211",
            "warm-cache",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.backend.bucket, "daves-venti");
        assert_eq!(
            config.shared_cache.address.as_deref(),
            Some("127.0.0.1:11211")
        );
    }

    #[test]
    fn test_score_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();
        let data = read_input(&path).unwrap();
        assert_eq!(
            ContentAddresser::default().score(&data).to_hex(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
