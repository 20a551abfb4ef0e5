//! davfs mount daemon

use anyhow::Context;
use clap::Parser;
use davfs_client::{DavClient, MemStore, RemoteStore};
use davfs_fuse::{DaemonConfig, DavFs, DavFuse, MountConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Mount a WebDAV share as a local filesystem.
#[derive(Parser, Debug)]
#[command(name = "davfs", version, about)]
struct Cli {
    /// WebDAV base URL
    #[arg(env = "DAVFS_URL")]
    url: Option<String>,

    /// Directory to mount on
    mountpoint: Option<PathBuf>,

    /// Config file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated mount options, e.g. allow_other,ro
    #[arg(short = 'o', long = "options")]
    options: Option<String>,

    #[arg(short, long, env = "DAVFS_USERNAME")]
    username: Option<String>,

    #[arg(short, long, env = "DAVFS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Serve an empty in-memory tree instead of a remote server
    #[arg(long)]
    memory: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(DaemonConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => DaemonConfig::default(),
        };
        if let Some(url) = self.url {
            config.dav.url = url;
        }
        if let Some(mountpoint) = self.mountpoint {
            config.mountpoint = mountpoint;
        }
        if let Some(options) = self.options {
            config.mount_options = options;
        }
        if self.username.is_some() {
            config.dav.username = self.username;
        }
        if self.password.is_some() {
            config.dav.password = self.password;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        Ok((config, self.memory))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, memory) = Cli::parse().into_config()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    tracing::info!("davfs daemon starting");

    let store: Arc<dyn RemoteStore> = if memory {
        tracing::info!("serving in-memory store");
        Arc::new(MemStore::new())
    } else {
        tracing::info!("remote store {}", config.dav.url);
        Arc::new(DavClient::new(&config.dav).context("creating WebDAV client")?)
    };

    let mount_config = MountConfig::from_daemon(&config)?;
    let fs = Arc::new(DavFs::new(store, config.fs.clone()));
    let adapter = DavFuse::new(fs, tokio::runtime::Handle::current());

    tokio::task::spawn_blocking(move || davfs_fuse::mount::mount(adapter, &mount_config))
        .await
        .context("mount task panicked")??;

    tracing::info!("davfs daemon stopped");
    Ok(())
}
