use std::sync::Arc;
use std::time::Duration;

use rand::{distributions::Alphanumeric, Rng};

use crate::{
    database::InMemoryFlagStore,
    flags::{evaluation_cache::EvaluationCache, flag_service::FlagService},
    redis::MockRedisClient,
};

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// A service over an empty in-memory store and a fresh mock redis, with the default TTL.
pub fn setup_memory_service() -> (FlagService, Arc<InMemoryFlagStore>, MockRedisClient) {
    let redis = MockRedisClient::new();
    let (service, store) = setup_memory_service_with(redis.clone(), Duration::from_secs(300));
    (service, store, redis)
}

pub fn setup_memory_service_with(
    redis: MockRedisClient,
    ttl: Duration,
) -> (FlagService, Arc<InMemoryFlagStore>) {
    let store = Arc::new(InMemoryFlagStore::new());
    let cache = EvaluationCache::new(Arc::new(redis), ttl).expect("valid evaluation cache ttl");
    (FlagService::new(store.clone(), cache), store)
}
