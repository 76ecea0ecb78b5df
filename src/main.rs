use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use event_aggregator::config::Config;
use event_aggregator::handlers;
use event_aggregator::storage::{EventStorage, InMemoryStorage, RedisListStore, RemoteStorage};
use event_aggregator::Aggregator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "event_aggregator=debug,warp=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let storage: Arc<dyn EventStorage> = match &config.redis {
        Some(redis) => {
            info!("Using Redis storage at {}", redis.addr);
            let url = RedisListStore::url(&redis.addr, redis.password.as_deref(), redis.db);
            let store = RedisListStore::connect(&url).await?;
            Arc::new(RemoteStorage::new(Arc::new(store)))
        }
        None => {
            info!("Using in-memory storage");
            Arc::new(InMemoryStorage::new())
        }
    };

    let aggregator = Arc::new(Aggregator::new(storage, config.queue));
    aggregator.start();

    let routes = handlers::routes(aggregator.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let stop = CancellationToken::new();
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, stop.clone().cancelled_owned())?;

    info!("Starting server on http://{}", bound);
    let mut server = tokio::spawn(server);

    let server_exited = tokio::select! {
        _ = shutdown_signal() => false,
        res = &mut server => {
            if let Err(e) = res {
                error!("Server task failed: {}", e);
            }
            true
        }
    };

    stop.cancel();
    let deadline = Instant::now() + config.shutdown_timeout;
    if !server_exited && timeout_at(deadline, &mut server).await.is_err() {
        warn!("Server did not drain within {:?}, aborting", config.shutdown_timeout);
        server.abort();
    }
    if timeout_at(deadline, aggregator.shutdown()).await.is_err() {
        warn!("Event consumer did not stop before the shutdown deadline");
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
