//! merel - mail server entry point

use std::sync::Arc;

use anyhow::{Context, Result};
use merel_common::clock::{Clock, SystemClock};
use merel_common::config::Config;
use merel_common::dns::SystemResolver;
use merel_core::{CtlServer, MtastsCache, Queue, Scheduler, SmtpAgent};
use merel_storage::Store;
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load()?);
    let reload_handle = init_logging(&config.log_level);

    info!(hostname = %config.hostname, "starting merel");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let resolver = Arc::new(SystemResolver::new());

    let store = Arc::new(Store::open(config.clone()).await?);

    // Outbound delivery consults the MTA-STS policy cache at the top of
    // the data directory.
    let mtasts = Arc::new(MtastsCache::open(&config.data_dir, clock.clone()).await?);

    let queue = Arc::new(Queue::open(&config.data_dir.join("queue"), clock.clone()).await?);
    let agent = Arc::new(
        SmtpAgent::new(resolver, config.hostname.clone(), None).with_mtasts(mtasts),
    );
    let scheduler = Scheduler::new(
        queue.clone(),
        agent,
        config.queue.clone(),
        clock.clone(),
        config.hostname.clone(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run());

    // Control socket; a stale socket file from a previous run is replaced.
    let socket_path = config.data_dir.join("ctl");
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;

    let shutdown = Arc::new(Notify::new());
    let set_level = {
        let handle = reload_handle.clone();
        Box::new(move |level: &str| match level.parse::<EnvFilter>() {
            Ok(filter) => handle.reload(filter).is_ok(),
            Err(_) => false,
        })
    };
    let ctl = CtlServer::new(
        store.clone(),
        queue.clone(),
        clock,
        shutdown.clone(),
        config.log_level.clone(),
        set_level,
    );
    let ctl_handle = tokio::spawn(ctl.serve(listener));

    info!("merel started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = shutdown.notified() => info!("shutdown requested"),
    }

    scheduler_handle.abort();
    ctl_handle.abort();
    store.close_idle().await;
    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(error = %e, "removing control socket");
    }

    info!("merel shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> reload::Handle<EnvFilter, tracing_subscriber::Registry> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| level.parse())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true).with_level(true))
        .init();
    handle
}
