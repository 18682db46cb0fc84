use clap::Parser;
use pfg_api::HttpRemote;
use pfg_cache::{BlockCache, CacheParams, MetadataCache, spawn_prefetch_workers};
use pfg_web::{Server, router};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "Public-Folder-Gateway", version = "0.1.0")]
struct Cli {
    /// Percorso del file di configurazione JSON
    #[arg(short, long, default_value = "gateway.json")]
    config: PathBuf,

    /// Indirizzo di ascolto del server HTTP
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    listen: String,
}

#[derive(Deserialize, Debug)]
struct GatewayConfig {
    /// Remote folder served by the gateway, e.g. "/Public".
    root: String,
    access_token: String,
    /// Local block-cache directory, emptied at startup.
    blockcache: PathBuf,
    /// Kilobytes; larger files are never prefetched.
    prefetch: u64,
    /// Megabytes; larger files bypass the cache.
    cacheable: u64,
    /// Megabytes of total cache budget.
    cache_size: u64,
    /// Megabytes per stream chunk.
    chunk_size: u64,
    prefetch_threads: usize,
}

impl GatewayConfig {
    fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let config: GatewayConfig =
            serde_json::from_str(&raw).map_err(|e| format!("cannot parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.root != "/" && (!self.root.starts_with('/') || self.root.ends_with('/')) {
            return Err(format!(
                "root must be \"/\" or start with \"/\" and not end with \"/\", got {:?}",
                self.root
            ));
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be at least 1 MB".to_string());
        }
        Ok(())
    }

    fn cache_params(&self) -> CacheParams {
        CacheParams {
            chunk_size: (self.chunk_size << 20) as usize,
            prefetch_size: self.prefetch << 10,
            cacheable_size: self.cacheable << 20,
            max_size: self.cache_size << 20,
            prefetch_threads: self.prefetch_threads,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("unable to install the ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("unable to install the SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("signal received, shutting down");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match GatewayConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let remote = Arc::new(HttpRemote::new(&config.access_token));
    let metadata = Arc::new(MetadataCache::new(Arc::clone(&remote), &config.root));
    let blocks = match BlockCache::new(
        Arc::clone(&remote),
        Arc::clone(&metadata),
        &config.blockcache,
        config.cache_params(),
    ) {
        Ok(blocks) => Arc::new(blocks),
        Err(e) => {
            tracing::error!(dir = %config.blockcache.display(), error = %e, "cannot set up the block cache");
            std::process::exit(1);
        }
    };

    // the sync worker feeds dirty paths to the prefetch workers
    let dirty = metadata.take_dirty_paths();
    spawn_prefetch_workers(Arc::clone(&blocks), dirty);
    tokio::spawn(Arc::clone(&metadata).run_sync());

    let app = router(Arc::new(Server::new(remote, Arc::clone(&metadata), blocks)));

    let listener = tokio::net::TcpListener::bind(&cli.listen)
        .await
        .expect("unable to bind the listen address");
    tracing::info!(listen = %cli.listen, root = %config.root, "gateway ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(root: &str) -> GatewayConfig {
        GatewayConfig {
            root: root.to_string(),
            access_token: "token".to_string(),
            blockcache: PathBuf::from("/tmp/blockcache"),
            prefetch: 256,
            cacheable: 8,
            cache_size: 64,
            chunk_size: 4,
            prefetch_threads: 2,
        }
    }

    #[test]
    fn parses_the_documented_keys() {
        let raw = r#"{
            "root": "/Public",
            "access_token": "secret",
            "blockcache": "/var/cache/pfg",
            "prefetch": 512,
            "cacheable": 16,
            "cache_size": 128,
            "chunk_size": 4,
            "prefetch_threads": 3
        }"#;
        let config: GatewayConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.root, "/Public");
        assert_eq!(config.prefetch_threads, 3);
    }

    #[test]
    fn validates_root_shape() {
        assert!(sample("/").validate().is_ok());
        assert!(sample("/Public").validate().is_ok());
        assert!(sample("Public").validate().is_err());
        assert!(sample("/Public/").validate().is_err());
        assert!(sample("").validate().is_err());
    }

    #[test]
    fn converts_units_to_bytes() {
        let params = sample("/Public").cache_params();
        assert_eq!(params.prefetch_size, 256 * 1024);
        assert_eq!(params.cacheable_size, 8 * 1024 * 1024);
        assert_eq!(params.max_size, 64 * 1024 * 1024);
        assert_eq!(params.chunk_size, 4 * 1024 * 1024);
    }
}
