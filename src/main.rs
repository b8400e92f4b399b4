use agentcoord_core::autoscaler::AutoScaler;
use agentcoord_core::config::Config;
use agentcoord_core::session::{connect_kv, CoordinationSession, SessionOptions};
use agentcoord_core::spawner::WorkerSpawner;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// The `coordinatord` binary: a standalone coordinator process that opens
/// the shared KV, runs the retry/reclamation sweepers and the auto-scaler,
/// and otherwise stays out of the way of workers started elsewhere.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("starting agentcoord-core coordinator");

    let config = Config::load()?;
    let kv = connect_kv(config.kv.redis_url.as_deref(), &config.kv.fallback_dir).await?;

    let session = Arc::new(
        CoordinationSession::start(
            kv.clone(),
            "coordinator",
            "coordinatord",
            "supervising the task queue",
            Default::default(),
            SessionOptions {
                heartbeat_interval_seconds: config.heartbeat.interval_seconds,
                hung_after_seconds: config.heartbeat.hung_seconds,
                lock_ttl_seconds: config.lock.default_ttl_seconds,
            },
        )
        .await?,
    );

    let queue = session.queue.clone();
    let sweeper_queue = queue.clone();
    let retry_sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                    agentcoord_core::constants::DEFAULT_SWEEPER_INTERVAL_SECONDS,
            ));
            loop {
                interval.tick().await;
                if let Err(e) = sweeper_queue.sweep_due_retries().await {
                    tracing::warn!(error = %e, "retry sweep failed, continuing");
                }
            }
    });

    let reclaim_queue = queue.clone();
    let reclamation_sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                    agentcoord_core::constants::DEFAULT_SWEEPER_INTERVAL_SECONDS,
            ));
            loop {
                interval.tick().await;
                if let Err(e) = reclaim_queue.sweep_reclaim_hung().await {
                    tracing::warn!(error = %e, "reclamation sweep failed, continuing");
                }
            }
    });

    let spawner = Arc::new(WorkerSpawner::new());
    let scaler = Arc::new(AutoScaler::new(
            kv.clone(),
            queue.clone(),
            spawner,
            config.autoscaler,
            "true",
            Vec::new(),
            Default::default(),
    ));
    let autoscaler_loop = tokio::spawn(scaler.run_forever());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = retry_sweeper => {
            if let Err(e) = result {
                tracing::error!(error = %e, "retry sweeper task panicked");
            }
        }
        result = reclamation_sweeper => {
            if let Err(e) = result {
                tracing::error!(error = %e, "reclamation sweeper task panicked");
            }
        }
        result = autoscaler_loop => {
            if let Err(e) = result {
                tracing::error!(error = %e, "autoscaler task panicked");
            }
        }
    }

    session.end().await?;
    Ok(())
}
