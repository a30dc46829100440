use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::{Config, StorageBackend};
use crate::database::{FlagStore, InMemoryFlagStore, PgFlagStore};
use crate::flags::evaluation_cache::EvaluationCache;
use crate::flags::flag_service::FlagService;
use crate::redis::RedisClient;
use crate::router;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let redis_client =
        match RedisClient::new(config.redis_url.clone(), config.redis_timeout()).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::error!("Failed to create Redis client for {}: {}", config.redis_url, e);
                return;
            }
        };

    let cache = match EvaluationCache::new(redis_client, config.evaluation_cache_ttl()) {
        Ok(cache) => cache,
        Err(e) => {
            tracing::error!("Invalid evaluation cache configuration: {}", e);
            return;
        }
    };

    let store: Arc<dyn FlagStore + Send + Sync> = match config.storage_backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory flag storage, flags will not survive a restart");
            Arc::new(InMemoryFlagStore::new())
        }
        StorageBackend::Postgres => match connect_postgres(&config).await {
            Some(store) => Arc::new(store),
            None => return,
        },
    };

    let flag_service = FlagService::new(store, cache);
    let app = router::router(flag_service, &config);

    serve_router(app, listener, shutdown).await
}

async fn connect_postgres(config: &Config) -> Option<PgFlagStore> {
    let store = match PgFlagStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.acquire_timeout(),
    )
    .await
    {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to connect to Postgres: {}", e);
            return None;
        }
    };

    if *config.run_migrations {
        tracing::info!("running database migrations");
        if let Err(e) = store.run_migrations().await {
            tracing::error!("Failed to run database migrations: {}", e);
            return None;
        }
    }
    Some(store)
}

/// Serves an already-built router until `shutdown` resolves.
pub async fn serve_router<F>(app: Router, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("listening on an unknown address: {}", e),
    }

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("server error: {}", e);
    }
}
