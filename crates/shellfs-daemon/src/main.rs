//! shellfs
//!
//! Mounts a conversation backend as a filesystem and serves it until
//! interrupted.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shellfs_client::{BackendClient, CachingClient};
use shellfs_daemon::config::Config;
use shellfs_daemon::fuse::ShellFuse;
use shellfs_daemon::nodes::Engine;
use shellfs_daemon::state::StateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!(
        mountpoint = %config.mountpoint.display(),
        backend = %config.backend_url,
        cache_ttl = ?config.cache_ttl,
        clone_timeout = ?config.clone_timeout,
        "starting shellfs"
    );

    let backend = BackendClient::new(&config.backend_url).context("backend client")?;
    let client = CachingClient::new(backend, config.cache_ttl);
    let state = StateStore::open_default(&config.backend_url).context("state store")?;
    let engine = Arc::new(Engine::new(state, client, config.clone_timeout));

    let fs = ShellFuse::new(engine, tokio::runtime::Handle::current());
    let options = [
        fuser::MountOption::FSName("shellfs".to_string()),
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::AutoUnmount,
    ];
    let session = fuser::spawn_mount2(fs, &config.mountpoint, &options)
        .with_context(|| format!("mounting at {}", config.mountpoint.display()))?;

    info!("mounted");
    let mut sigterm = signal(SignalKind::terminate()).context("signal handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("signal handler")?,
        _ = sigterm.recv() => {}
    }
    info!("unmounting");
    drop(session);

    Ok(())
}
