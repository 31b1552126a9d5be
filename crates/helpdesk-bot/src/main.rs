mod config;
mod gateway;
mod logging;
mod routes;
mod tasks;
mod tree_source;

use anyhow::{Context, Result};
use clap::Parser;
use helpdesk_engine::{SessionEngine, StoreRecorder};
use helpdesk_lifecycle::ThreadLifecycleMonitor;
use helpdesk_storage::{HelpdeskStore, SharedStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, info};

use crate::config::{Args, BotConfig};
use crate::gateway::HttpForumGateway;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = BotConfig::load(&args)?;
    let log_guard = logging::init_logging(&config);

    let tree = match tree_source::load_tree(&config.tree_path) {
        Ok(tree) => Arc::new(tree),
        Err(err) => {
            error!(event = "tree_invalid", error = %format!("{err:#}"));
            return Err(err);
        }
    };
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr {}", config.listen_addr))?;

    let store = SharedStore::new(
        HelpdeskStore::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );
    let recorder = Arc::new(StoreRecorder::new(store.clone()));
    let engine = Arc::new(SessionEngine::new(
        Arc::clone(&tree),
        recorder,
        config.engine_config(),
    ));
    let gateway = Arc::new(
        HttpForumGateway::new(&config.bridge_url, Handle::current())
            .context("building bridge client")?,
    );
    let monitor = Arc::new(ThreadLifecycleMonitor::new(
        store,
        gateway,
        config.lifecycle_config(),
    ));

    tasks::start_scan_loop(Arc::clone(&monitor), config.scan_interval());
    tasks::start_session_sweeper(Arc::clone(&engine), tasks::SESSION_SWEEP_INTERVAL);

    let app = routes::router(AppState {
        engine,
        monitor,
        triage_delay: config.triage_delay(),
    });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(
        event = "bot_start",
        addr = %addr,
        root = %tree.root(),
        nodes = tree.len(),
        watched_tag = %config.watched_tag,
        inactivity_hours = config.inactivity_hours,
        log_file = log_guard.as_ref().is_some_and(logging::LogGuard::has_file),
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving http")?;

    info!(event = "bot_stop");
    Ok(())
}
