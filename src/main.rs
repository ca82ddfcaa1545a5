//! Coin Flip Session Server
//!
//! Loads configuration from the environment and serves WebSocket clients
//! until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use coinflip::{
    EntropySource, GameServer, OutcomeSource, SeededSource, ServerConfig, VERSION,
    persistence::{JournalGateway, MemoryGateway, PersistenceHandle},
    persistence::worker::DEFAULT_QUEUE_CAPACITY,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env().context("loading configuration")?;

    info!("Coin Flip Server v{}", VERSION);
    info!(
        "Turn timeout: {}s, default series: best of {}",
        config.session.turn_timeout.as_secs(),
        config.session.max_rounds
    );

    let (persistence, worker) = match &config.journal_path {
        Some(path) => {
            let journal = JournalGateway::open(path)
                .with_context(|| format!("opening journal {}", path.display()))?;
            info!("Journal: {}", path.display());
            PersistenceHandle::spawn(journal, DEFAULT_QUEUE_CAPACITY)
        }
        None => {
            info!("Journal: none, records kept in memory");
            PersistenceHandle::spawn(MemoryGateway::new(), DEFAULT_QUEUE_CAPACITY)
        }
    };

    let outcomes: Arc<dyn OutcomeSource> = match config.rng_seed {
        Some(seed) => {
            info!("RNG Seed: {}", seed);
            Arc::new(SeededSource::new(seed))
        }
        None => Arc::new(EntropySource),
    };

    let server = Arc::new(GameServer::new(config, outcomes, persistence));
    let running = server.clone();
    let mut serve = tokio::spawn(async move { running.run().await });

    tokio::select! {
        result = &mut serve => {
            result.context("server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            server.shutdown();
            serve.await.context("server task panicked")??;
        }
    }

    // Countdown tasks may still hold handles; the runtime drops them on exit
    drop(server);
    if tokio::time::timeout(Duration::from_secs(2), worker).await.is_err() {
        warn!("Persistence worker still draining at exit");
    }

    Ok(())
}
