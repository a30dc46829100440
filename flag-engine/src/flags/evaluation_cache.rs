use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::{
    api::errors::FlagError,
    flags::flag_models::{EvaluationContext, OverrideKind},
    metrics_consts::CACHE_ERRORS_COUNTER,
    metrics_utils::inc,
    redis::{Client as RedisClient, CustomRedisError},
};

// Other services may read these keys directly, so the prefix and segment order are fixed.
pub const CACHE_PREFIX: &str = "feature_eval:";

/// Key for a flag evaluated with no targeting attributes.
pub fn base_cache_key(flag_key: &str) -> String {
    format!("{CACHE_PREFIX}{flag_key}")
}

/// Key for a full evaluation context. Segments are appended region, then group, then user,
/// each only when present.
pub fn cache_key(flag_key: &str, context: &EvaluationContext) -> String {
    let mut key = base_cache_key(flag_key);
    for kind in [OverrideKind::Region, OverrideKind::Group, OverrideKind::User] {
        if let Some(value) = context.value_for(kind) {
            push_segment(&mut key, kind, value);
        }
    }
    key
}

/// Key for a context that carries only the dimension of a single override.
pub fn scoped_cache_key(flag_key: &str, kind: OverrideKind, target_id: &str) -> String {
    let mut key = base_cache_key(flag_key);
    push_segment(&mut key, kind, target_id);
    key
}

fn push_segment(key: &mut String, kind: OverrideKind, value: &str) {
    key.push(':');
    key.push_str(kind.as_ref());
    key.push(':');
    key.push_str(value);
}

/// Typed view over the redis client for cached boolean decisions.
#[derive(Clone)]
pub struct EvaluationCache {
    client: Arc<dyn RedisClient + Send + Sync>,
    ttl: Duration,
}

impl EvaluationCache {
    /// Fails with `InvalidConfiguration` when `ttl` is under one second, since `SETEX`
    /// only accepts a positive whole number of seconds.
    pub fn new(
        client: Arc<dyn RedisClient + Send + Sync>,
        ttl: Duration,
    ) -> Result<Self, CustomRedisError> {
        if ttl.as_secs() == 0 {
            return Err(CustomRedisError::InvalidConfiguration(format!(
                "evaluation cache ttl must be at least one second, got {ttl:?}"
            )));
        }
        Ok(Self { client, ttl })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `Ok(None)` means the key is absent; a cached `false` comes back as `Ok(Some(false))`.
    #[instrument(skip(self))]
    pub async fn get_decision(&self, key: &str) -> Result<Option<bool>, FlagError> {
        match self.client.get(key.to_string()).await {
            Ok(raw) => serde_json::from_str::<bool>(&raw).map(Some).map_err(|e| {
                tracing::error!("cached decision under {} is not a boolean: {}", key, e);
                inc(
                    CACHE_ERRORS_COUNTER,
                    &[("op".to_string(), "parse".to_string())],
                    1,
                );
                FlagError::RedisDataParsingError
            }),
            Err(CustomRedisError::NotFound) => Ok(None),
            Err(e) => Err(cache_failure("get", e)),
        }
    }

    #[instrument(skip(self))]
    pub async fn set_decision(&self, key: &str, decision: bool) -> Result<(), FlagError> {
        let value = serde_json::to_string(&decision)
            .map_err(|e| FlagError::Internal(format!("failed to serialize decision: {e}")))?;

        self.client
            .setex(key.to_string(), value, self.ttl.as_secs())
            .await
            .map_err(|e| cache_failure("setex", e))
    }

    #[instrument(skip(self))]
    pub async fn invalidate(&self, key: &str) -> Result<(), FlagError> {
        self.client
            .del(key.to_string())
            .await
            .map_err(|e| cache_failure("del", e))
    }

    /// Drops every cached decision for `flag_key`: the base entry and all targeted entries.
    /// Returns how many targeted entries were removed.
    #[instrument(skip(self))]
    pub async fn invalidate_flag(&self, flag_key: &str) -> Result<u64, FlagError> {
        let base = base_cache_key(flag_key);
        self.invalidate(&base).await?;

        let targeted = self
            .client
            .del_prefix(format!("{base}:"))
            .await
            .map_err(|e| cache_failure("del_prefix", e))?;
        Ok(targeted)
    }
}

fn cache_failure(op: &str, err: CustomRedisError) -> FlagError {
    tracing::error!("evaluation cache {} failed: {}", op, err);
    inc(
        CACHE_ERRORS_COUNTER,
        &[("op".to_string(), op.to_string())],
        1,
    );
    FlagError::from(err)
}
