use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use ethergate::config::Config;
use ethergate::policy::StandardPolicy;
use ethergate::stratum::StratumServer;
use ethergate::upstream::NodeUpstream;
use ethergate::util;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(&path)?;
    info!("🚀 {} starting (algo {})", config.name, config.algo);

    if !config.proxy.stratum.enabled {
        bail!("stratum.enabled is false; nothing to serve");
    }

    let policy = Arc::new(StandardPolicy::new(&config.proxy.policy)?);
    policy.start_refill(
        util::parse_duration(&config.proxy.policy.limits.grace).context("policy.limits.grace")?,
    );

    let upstream = NodeUpstream::new(&config)?;
    {
        let upstream = Arc::clone(&upstream);
        let every = util::parse_duration(&config.proxy.block_refresh_interval)
            .context("proxy.blockRefreshInterval")?;
        tokio::spawn(async move {
            upstream.refresh_loop(every).await;
        });
    }

    let server = StratumServer::new(
        config.clone(),
        upstream.clone(),
        upstream.clone(),
        policy.clone(),
    )?;
    let listener = server.bind().await?;
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!("stratum server stopped: {:#}", e);
            }
        });
    }

    // Push fresh jobs to every live miner whenever the upstream header moves.
    {
        let server = Arc::clone(&server);
        let mut templates = upstream.subscribe();
        tokio::spawn(async move {
            while templates.changed().await.is_ok() {
                server.broadcast_new_jobs().await;
            }
        });
    }

    shutdown_signal().await;
    info!("🏁 {} shut down", config.name);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("registering SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM — shutting down"),
            _ = tokio::signal::ctrl_c() => info!("SIGINT — shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("registering Ctrl+C handler");
        info!("Ctrl+C — shutting down");
    }
}
