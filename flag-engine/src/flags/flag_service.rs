use std::sync::Arc;

use tracing::instrument;
use uuid::Uuid;

use crate::{
    api::errors::FlagError,
    database::FlagStore,
    flags::{
        evaluation_cache::{base_cache_key, cache_key, scoped_cache_key, EvaluationCache},
        flag_models::{
            validate_context, validate_description, validate_key, validate_target_id,
            EvaluationContext,
            FeatureFlag, FlagOverride, NewFlag, OverrideKind,
        },
        override_resolver::resolve,
    },
    metrics_consts::{
        CACHE_INVALIDATIONS_COUNTER, FLAG_EVALUATION_COUNTER, FLAG_EVALUATION_ERROR_COUNTER,
        FLAG_EVALUATION_TIME, FLAG_MUTATIONS_COUNTER,
    },
    metrics_utils::{inc, timing_guard},
};

/// Outcome of one evaluation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub enabled: bool,
    pub from_cache: bool,
}

/// Owns the cache-aside protocol around flag evaluation and the mutations that must
/// invalidate cached decisions.
///
/// Concurrent misses on the same key may both resolve and write the same decision; the
/// resolver is deterministic for a given flag snapshot, so no coordination is needed.
#[derive(Clone)]
pub struct FlagService {
    store: Arc<dyn FlagStore + Send + Sync>,
    cache: EvaluationCache,
}

impl FlagService {
    pub fn new(store: Arc<dyn FlagStore + Send + Sync>, cache: EvaluationCache) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn FlagStore + Send + Sync> {
        &self.store
    }

    /// Evaluates `key` for `context`, serving from cache when possible.
    ///
    /// A cache miss loads the flag, resolves it and writes the decision back with the
    /// configured TTL. Cache and storage failures fail the call; they are never turned into
    /// a disabled decision.
    #[instrument(skip(self), fields(cache_hit = tracing::field::Empty))]
    pub async fn evaluate(
        &self,
        key: &str,
        context: &EvaluationContext,
    ) -> Result<Evaluation, FlagError> {
        let _timer = timing_guard(FLAG_EVALUATION_TIME, &[]);

        let result = self.evaluate_inner(key, context).await;

        match &result {
            Ok(evaluation) => {
                tracing::Span::current().record("cache_hit", evaluation.from_cache);
                inc(
                    FLAG_EVALUATION_COUNTER,
                    &[("cache_hit".to_string(), evaluation.from_cache.to_string())],
                    1,
                );
            }
            Err(e) => inc(
                FLAG_EVALUATION_ERROR_COUNTER,
                &[("reason".to_string(), e.error_code().to_string())],
                1,
            ),
        }

        result
    }

    async fn evaluate_inner(
        &self,
        key: &str,
        context: &EvaluationContext,
    ) -> Result<Evaluation, FlagError> {
        validate_context(context)?;
        let cache_key = cache_key(key, context);

        if let Some(enabled) = self.cache.get_decision(&cache_key).await? {
            tracing::debug!(cache_key, enabled, "served evaluation from cache");
            return Ok(Evaluation {
                enabled,
                from_cache: true,
            });
        }

        let flag = self.load_flag(key).await?;
        let enabled = resolve(flag.is_enabled, &flag.overrides, context);

        self.cache.set_decision(&cache_key, enabled).await?;
        tracing::debug!(cache_key, enabled, "resolved evaluation");

        Ok(Evaluation {
            enabled,
            from_cache: false,
        })
    }

    /// Inserts or updates the override for (kind, target_id) and invalidates the cache entry
    /// for that single targeting dimension.
    #[instrument(skip(self))]
    pub async fn add_or_update_override(
        &self,
        key: &str,
        kind: OverrideKind,
        target_id: &str,
        is_enabled: bool,
    ) -> Result<FlagOverride, FlagError> {
        validate_target_id(target_id)?;
        let flag = self.load_flag(key).await?;

        let candidate = FlagOverride {
            id: Uuid::now_v7(),
            feature_flag_id: flag.id,
            kind,
            target_id: target_id.to_string(),
            is_enabled,
        };
        let flag_override = self.store.upsert_override(key, &candidate).await?;

        record_mutation(if flag_override.id != candidate.id {
            "override_updated"
        } else {
            "override_added"
        });
        self.invalidate(&scoped_cache_key(key, kind, target_id), kind.as_ref())
            .await?;

        Ok(flag_override)
    }

    #[instrument(skip(self))]
    pub async fn remove_override(
        &self,
        key: &str,
        kind: OverrideKind,
        target_id: &str,
    ) -> Result<(), FlagError> {
        let flag = self.load_flag(key).await?;

        if !self.store.delete_override(flag.id, kind, target_id).await? {
            tracing::warn!(key, %kind, target_id, "override not found");
            return Err(FlagError::OverrideNotFound {
                key: key.to_string(),
                kind: kind.to_string(),
                target_id: target_id.to_string(),
            });
        }

        record_mutation("override_removed");
        self.invalidate(&scoped_cache_key(key, kind, target_id), kind.as_ref())
            .await
    }

    /// Sets the global state and invalidates only the base (no context) entry. Entries that
    /// resolve through an override stay valid since the override still wins.
    #[instrument(skip(self))]
    pub async fn update_global_state(&self, key: &str, is_enabled: bool) -> Result<(), FlagError> {
        let flag = self.load_flag(key).await?;

        if !self.store.set_global_state(flag.id, is_enabled).await? {
            return Err(FlagError::FlagNotFound(key.to_string()));
        }

        record_mutation("global_state_updated");
        self.invalidate(&base_cache_key(key), "base").await
    }

    /// Creates a flag, failing with `FlagAlreadyExists` if the key is taken.
    #[instrument(skip_all, fields(key = %new_flag.key))]
    pub async fn create_flag(&self, new_flag: NewFlag) -> Result<FeatureFlag, FlagError> {
        validate_key(&new_flag.key)?;
        validate_description(new_flag.description.as_deref())?;
        for o in &new_flag.overrides {
            validate_target_id(&o.target_id)?;
        }

        if self
            .store
            .get_flag_with_overrides(&new_flag.key)
            .await?
            .is_some()
        {
            tracing::warn!(key = new_flag.key, "flag already exists");
            return Err(FlagError::FlagAlreadyExists(new_flag.key));
        }

        let id = Uuid::now_v7();
        let overrides = new_flag
            .overrides
            .into_iter()
            .map(|o| FlagOverride {
                id: Uuid::now_v7(),
                feature_flag_id: id,
                kind: o.kind,
                target_id: o.target_id,
                is_enabled: o.is_enabled,
            })
            .collect();
        let flag = FeatureFlag {
            id,
            key: new_flag.key,
            is_enabled: new_flag.is_enabled,
            description: new_flag.description,
            overrides,
        };

        // The store enforces key uniqueness too, which covers a concurrent create.
        self.store.insert(&flag).await?;
        record_mutation("flag_created");
        tracing::info!(key = flag.key, id = %flag.id, "created flag");

        Ok(flag)
    }

    pub async fn list_flags(&self, include_overrides: bool) -> Result<Vec<FeatureFlag>, FlagError> {
        if include_overrides {
            self.store.get_all_flags_with_overrides().await
        } else {
            self.store.get_all().await
        }
    }

    pub async fn get_flag(&self, key: &str) -> Result<FeatureFlag, FlagError> {
        self.load_flag(key).await
    }

    /// Updates the free-text description. The key is immutable and the global state has its
    /// own operation, so neither is touched here.
    #[instrument(skip(self, description))]
    pub async fn update_description(
        &self,
        key: &str,
        description: Option<String>,
    ) -> Result<FeatureFlag, FlagError> {
        validate_description(description.as_deref())?;
        let mut flag = self.load_flag(key).await?;

        if !self
            .store
            .set_description(flag.id, description.as_deref())
            .await?
        {
            return Err(FlagError::FlagNotFound(key.to_string()));
        }
        flag.description = description;
        record_mutation("description_updated");

        Ok(flag)
    }

    /// Deletes the flag and its overrides, then drops every cached decision for the key.
    #[instrument(skip(self))]
    pub async fn delete_flag(&self, key: &str) -> Result<(), FlagError> {
        let flag = self.load_flag(key).await?;

        if !self.store.delete(flag.id).await? {
            return Err(FlagError::FlagNotFound(key.to_string()));
        }
        record_mutation("flag_deleted");
        tracing::info!(key, id = %flag.id, "deleted flag");

        let removed = self.cache.invalidate_flag(key).await?;
        inc(
            CACHE_INVALIDATIONS_COUNTER,
            &[("scope".to_string(), "flag".to_string())],
            1,
        );
        tracing::debug!(key, removed, "invalidated cached evaluations for flag");
        Ok(())
    }

    async fn load_flag(&self, key: &str) -> Result<FeatureFlag, FlagError> {
        self.store
            .get_flag_with_overrides(key)
            .await?
            .ok_or_else(|| {
                tracing::warn!(key, "flag not found");
                FlagError::FlagNotFound(key.to_string())
            })
    }

    async fn invalidate(&self, cache_key: &str, scope: &str) -> Result<(), FlagError> {
        self.cache.invalidate(cache_key).await?;
        inc(
            CACHE_INVALIDATIONS_COUNTER,
            &[("scope".to_string(), scope.to_string())],
            1,
        );
        tracing::debug!(cache_key, scope, "invalidated cached evaluation");
        Ok(())
    }
}

fn record_mutation(op: &str) {
    inc(
        FLAG_MUTATIONS_COUNTER,
        &[("op".to_string(), op.to_string())],
        1,
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        database::{InMemoryFlagStore, Repository},
        flags::flag_models::NewOverride,
        redis::{CustomRedisError, MockRedisClient},
        test_utils::{setup_memory_service, setup_memory_service_with},
    };

    /// Delegates to an in-memory store but yields after every flag lookup, so concurrent
    /// mutations interleave between their read and their write.
    struct YieldingStore(Arc<InMemoryFlagStore>);

    #[async_trait]
    impl Repository<FeatureFlag> for YieldingStore {
        async fn get_all(&self) -> Result<Vec<FeatureFlag>, FlagError> {
            self.0.get_all().await
        }
        async fn get_by_id(&self, id: Uuid) -> Result<Option<FeatureFlag>, FlagError> {
            self.0.get_by_id(id).await
        }
        async fn insert(&self, flag: &FeatureFlag) -> Result<(), FlagError> {
            self.0.insert(flag).await
        }
        async fn update(&self, flag: &FeatureFlag) -> Result<(), FlagError> {
            self.0.update(flag).await
        }
        async fn delete(&self, id: Uuid) -> Result<bool, FlagError> {
            self.0.delete(id).await
        }
        async fn exists(&self, id: Uuid) -> Result<bool, FlagError> {
            self.0.exists(id).await
        }
    }

    #[async_trait]
    impl FlagStore for YieldingStore {
        async fn get_flag_with_overrides(
            &self,
            key: &str,
        ) -> Result<Option<FeatureFlag>, FlagError> {
            let flag = self.0.get_flag_with_overrides(key).await;
            tokio::task::yield_now().await;
            flag
        }
        async fn get_all_flags_with_overrides(&self) -> Result<Vec<FeatureFlag>, FlagError> {
            self.0.get_all_flags_with_overrides().await
        }
        async fn save(&self, flag: &FeatureFlag) -> Result<(), FlagError> {
            self.0.save(flag).await
        }
        async fn upsert_override(
            &self,
            flag_key: &str,
            candidate: &FlagOverride,
        ) -> Result<FlagOverride, FlagError> {
            self.0.upsert_override(flag_key, candidate).await
        }
        async fn delete_override(
            &self,
            flag_id: Uuid,
            kind: OverrideKind,
            target_id: &str,
        ) -> Result<bool, FlagError> {
            self.0.delete_override(flag_id, kind, target_id).await
        }
        async fn set_global_state(
            &self,
            flag_id: Uuid,
            is_enabled: bool,
        ) -> Result<bool, FlagError> {
            self.0.set_global_state(flag_id, is_enabled).await
        }
        async fn set_description(
            &self,
            flag_id: Uuid,
            description: Option<&str>,
        ) -> Result<bool, FlagError> {
            self.0.set_description(flag_id, description).await
        }
        async fn ping(&self) -> Result<(), FlagError> {
            self.0.ping().await
        }
    }

    fn setup_yielding_service() -> (FlagService, Arc<InMemoryFlagStore>) {
        let inner = Arc::new(InMemoryFlagStore::new());
        let cache = EvaluationCache::new(
            Arc::new(MockRedisClient::new()),
            Duration::from_secs(300),
        )
        .unwrap();
        (
            FlagService::new(Arc::new(YieldingStore(inner.clone())), cache),
            inner,
        )
    }

    fn targets(flag: &FeatureFlag) -> Vec<(OverrideKind, String, bool)> {
        let mut targets: Vec<_> = flag
            .overrides
            .iter()
            .map(|o| (o.kind, o.target_id.clone(), o.is_enabled))
            .collect();
        targets.sort_by(|a, b| (a.0.as_ref(), &a.1).cmp(&(b.0.as_ref(), &b.1)));
        targets
    }

    fn new_flag(key: &str, is_enabled: bool) -> NewFlag {
        NewFlag {
            key: key.to_string(),
            is_enabled,
            description: None,
            overrides: vec![],
        }
    }

    fn ctx(user: Option<&str>, group: Option<&str>, region: Option<&str>) -> EvaluationContext {
        EvaluationContext::new(
            user.map(str::to_string),
            group.map(str::to_string),
            region.map(str::to_string),
        )
    }

    fn hit(enabled: bool) -> Evaluation {
        Evaluation {
            enabled,
            from_cache: true,
        }
    }

    fn miss(enabled: bool) -> Evaluation {
        Evaluation {
            enabled,
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn test_evaluate_global_disabled_then_cached() {
        let (service, _, _) = setup_memory_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();

        let none = EvaluationContext::default();
        assert_eq!(service.evaluate("f1", &none).await.unwrap(), miss(false));
        assert_eq!(service.evaluate("f1", &none).await.unwrap(), hit(false));
        assert_eq!(service.evaluate("f1", &none).await.unwrap(), hit(false));
    }

    #[tokio::test]
    async fn test_evaluate_writes_decision_with_five_minute_ttl() {
        let (service, _, redis) = setup_memory_service();
        service.create_flag(new_flag("f1", true)).await.unwrap();

        service
            .evaluate("f1", &EvaluationContext::default())
            .await
            .unwrap();

        let sets = redis.calls_for("setex");
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].key, "feature_eval:f1");
        assert_eq!(
            sets[0].value,
            crate::redis::MockRedisValue::StringWithTTL("true".to_string(), 300)
        );
    }

    #[tokio::test]
    async fn test_region_override_and_fallback_to_global() {
        let (service, _, _) = setup_memory_service();
        service
            .create_flag(new_flag("NewDashboard", false))
            .await
            .unwrap();
        service
            .add_or_update_override("NewDashboard", OverrideKind::Region, "IN", true)
            .await
            .unwrap();

        assert_eq!(
            service
                .evaluate("NewDashboard", &ctx(None, None, Some("IN")))
                .await
                .unwrap(),
            miss(true)
        );
        assert_eq!(
            service
                .evaluate("NewDashboard", &ctx(None, None, Some("US")))
                .await
                .unwrap(),
            miss(false)
        );
    }

    #[tokio::test]
    async fn test_user_override_wins_over_region() {
        let (service, _, _) = setup_memory_service();
        service
            .create_flag(new_flag("NewDashboard", false))
            .await
            .unwrap();
        service
            .add_or_update_override("NewDashboard", OverrideKind::Region, "IN", false)
            .await
            .unwrap();
        service
            .add_or_update_override("NewDashboard", OverrideKind::User, "user123", true)
            .await
            .unwrap();

        assert_eq!(
            service
                .evaluate("NewDashboard", &ctx(Some("user123"), None, Some("IN")))
                .await
                .unwrap(),
            miss(true)
        );
    }

    #[tokio::test]
    async fn test_group_override_wins_over_region_and_global() {
        let (service, _, _) = setup_memory_service();
        service.create_flag(new_flag("f", true)).await.unwrap();
        service
            .add_or_update_override("f", OverrideKind::Region, "EU", true)
            .await
            .unwrap();
        service
            .add_or_update_override("f", OverrideKind::Group, "legacy", false)
            .await
            .unwrap();

        let evaluation = service
            .evaluate("f", &ctx(Some("nobody"), Some("legacy"), Some("EU")))
            .await
            .unwrap();
        assert!(!evaluation.enabled);
    }

    #[tokio::test]
    async fn test_evaluate_missing_flag_is_not_found_and_not_cached() {
        let (service, _, redis) = setup_memory_service();

        match service
            .evaluate("missing", &EvaluationContext::default())
            .await
        {
            Err(FlagError::FlagNotFound(key)) => assert_eq!(key, "missing"),
            other => panic!("Expected FlagNotFound, got {:?}", other),
        }
        assert!(redis.calls_for("setex").is_empty());
    }

    #[tokio::test]
    async fn test_update_global_state_invalidates_base_entry() {
        let (service, _, redis) = setup_memory_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();
        let none = EvaluationContext::default();
        service.evaluate("f1", &none).await.unwrap();

        service.update_global_state("f1", true).await.unwrap();

        assert!(!redis.contains_key("feature_eval:f1"));
        assert_eq!(service.evaluate("f1", &none).await.unwrap(), miss(true));
        assert_eq!(service.evaluate("f1", &none).await.unwrap(), hit(true));
    }

    #[tokio::test]
    async fn test_update_global_state_keeps_targeted_entries() {
        let (service, _, _) = setup_memory_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();
        service
            .add_or_update_override("f1", OverrideKind::User, "u1", true)
            .await
            .unwrap();
        let user = EvaluationContext::for_user("u1");
        service.evaluate("f1", &user).await.unwrap();

        service.update_global_state("f1", false).await.unwrap();

        assert_eq!(service.evaluate("f1", &user).await.unwrap(), hit(true));
    }

    #[tokio::test]
    async fn test_override_change_invalidates_only_its_dimension() {
        let (service, _, redis) = setup_memory_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();
        let base = EvaluationContext::default();
        let u1 = EvaluationContext::for_user("u1");
        let u2 = EvaluationContext::for_user("u2");
        let group = EvaluationContext::for_group("g1");
        for c in [&base, &u1, &u2, &group] {
            service.evaluate("f1", c).await.unwrap();
        }

        service
            .add_or_update_override("f1", OverrideKind::User, "u1", true)
            .await
            .unwrap();

        assert_eq!(
            redis
                .calls_for("del")
                .into_iter()
                .map(|c| c.key)
                .collect::<Vec<_>>(),
            vec!["feature_eval:f1:user:u1".to_string()]
        );
        assert_eq!(service.evaluate("f1", &u1).await.unwrap(), miss(true));
        assert_eq!(service.evaluate("f1", &u2).await.unwrap(), hit(false));
        assert_eq!(service.evaluate("f1", &group).await.unwrap(), hit(false));
        assert_eq!(service.evaluate("f1", &base).await.unwrap(), hit(false));
    }

    #[tokio::test]
    async fn test_upsert_updates_existing_override_in_place() {
        let (service, store, _) = setup_memory_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();

        let first = service
            .add_or_update_override("f1", OverrideKind::Group, "beta", true)
            .await
            .unwrap();
        let second = service
            .add_or_update_override("f1", OverrideKind::Group, "beta", false)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let flag = store.get_flag_with_overrides("f1").await.unwrap().unwrap();
        assert_eq!(flag.overrides.len(), 1);
        assert!(!flag.overrides.get(OverrideKind::Group, "beta").unwrap().is_enabled);
    }

    #[tokio::test]
    async fn test_remove_override_restores_global_and_invalidates() {
        let (service, _, redis) = setup_memory_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();
        service
            .add_or_update_override("f1", OverrideKind::Region, "IN", true)
            .await
            .unwrap();
        let region = EvaluationContext::for_region("IN");
        assert!(service.evaluate("f1", &region).await.unwrap().enabled);

        service
            .remove_override("f1", OverrideKind::Region, "IN")
            .await
            .unwrap();

        assert!(!redis.contains_key("feature_eval:f1:region:IN"));
        assert_eq!(service.evaluate("f1", &region).await.unwrap(), miss(false));
    }

    #[tokio::test]
    async fn test_remove_missing_override_is_not_found() {
        let (service, _, redis) = setup_memory_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();

        match service
            .remove_override("f1", OverrideKind::User, "ghost")
            .await
        {
            Err(FlagError::OverrideNotFound { target_id, .. }) => assert_eq!(target_id, "ghost"),
            other => panic!("Expected OverrideNotFound, got {:?}", other),
        }
        assert!(redis.calls_for("del").is_empty());
    }

    #[tokio::test]
    async fn test_mutations_on_missing_flag_are_not_found() {
        let (service, _, _) = setup_memory_service();

        assert!(service
            .add_or_update_override("nope", OverrideKind::User, "u1", true)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(service
            .remove_override("nope", OverrideKind::User, "u1")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(service
            .update_global_state("nope", true)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(service.delete_flag("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_duplicate_key_is_conflict_and_not_persisted() {
        let (service, store, _) = setup_memory_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();

        match service.create_flag(new_flag("f1", true)).await {
            Err(FlagError::FlagAlreadyExists(key)) => assert_eq!(key, "f1"),
            other => panic!("Expected FlagAlreadyExists, got {:?}", other),
        }

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].is_enabled);
    }

    #[tokio::test]
    async fn test_create_with_duplicate_overrides_keeps_first() {
        let (service, _, _) = setup_memory_service();
        let flag = service
            .create_flag(NewFlag {
                key: "f1".to_string(),
                is_enabled: false,
                description: Some("dashboard".to_string()),
                overrides: vec![
                    NewOverride {
                        kind: OverrideKind::User,
                        target_id: "u1".to_string(),
                        is_enabled: true,
                    },
                    NewOverride {
                        kind: OverrideKind::User,
                        target_id: "u1".to_string(),
                        is_enabled: false,
                    },
                ],
            })
            .await
            .unwrap();

        assert_eq!(flag.overrides.len(), 1);
        assert!(
            service
                .evaluate("f1", &EvaluationContext::for_user("u1"))
                .await
                .unwrap()
                .enabled
        );
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let (service, _, _) = setup_memory_service();

        assert!(matches!(
            service.create_flag(new_flag("  ", true)).await,
            Err(FlagError::BadRequest(_))
        ));
        assert!(matches!(
            service
                .add_or_update_override("f1", OverrideKind::User, "", true)
                .await,
            Err(FlagError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_flag_removes_it_and_base_entry() {
        let (service, _, redis) = setup_memory_service();
        service.create_flag(new_flag("f1", true)).await.unwrap();
        service
            .evaluate("f1", &EvaluationContext::default())
            .await
            .unwrap();

        service.delete_flag("f1").await.unwrap();

        assert!(!redis.contains_key("feature_eval:f1"));
        assert!(service
            .evaluate("f1", &EvaluationContext::default())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_update_description_leaves_state_alone() {
        let (service, _, _) = setup_memory_service();
        service.create_flag(new_flag("f1", true)).await.unwrap();

        let flag = service
            .update_description("f1", Some("new dashboard".to_string()))
            .await
            .unwrap();

        assert_eq!(flag.description.as_deref(), Some("new dashboard"));
        let loaded = service.get_flag("f1").await.unwrap();
        assert_eq!(loaded.description.as_deref(), Some("new dashboard"));
        assert!(loaded.is_enabled);
    }

    #[tokio::test]
    async fn test_list_flags_with_and_without_overrides() {
        let (service, _, _) = setup_memory_service();
        service.create_flag(new_flag("b", true)).await.unwrap();
        service.create_flag(new_flag("a", false)).await.unwrap();
        service
            .add_or_update_override("a", OverrideKind::User, "u1", true)
            .await
            .unwrap();

        let bare = service.list_flags(false).await.unwrap();
        assert_eq!(
            bare.iter().map(|f| f.key.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(bare[0].overrides.is_empty());

        let full = service.list_flags(true).await.unwrap();
        assert_eq!(full[0].overrides.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_read_failure_fails_evaluation() {
        let redis = MockRedisClient::new();
        let (service, _) = setup_memory_service_with(redis.clone(), Duration::from_secs(300));
        service.create_flag(new_flag("f1", true)).await.unwrap();
        redis.get_err(Some(CustomRedisError::Timeout));

        assert!(matches!(
            service.evaluate("f1", &EvaluationContext::default()).await,
            Err(FlagError::TimeoutError)
        ));
    }

    #[tokio::test]
    async fn test_cache_write_failure_fails_evaluation() {
        let redis = MockRedisClient::new();
        let (service, _) = setup_memory_service_with(redis.clone(), Duration::from_secs(300));
        service.create_flag(new_flag("f1", true)).await.unwrap();
        redis.set_err(Some(CustomRedisError::InvalidConfiguration(
            "read only".to_string(),
        )));

        assert!(matches!(
            service.evaluate("f1", &EvaluationContext::default()).await,
            Err(FlagError::RedisUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_storage_failure_fails_evaluation_on_miss() {
        let store = Arc::new(InMemoryFlagStore::new());
        let redis = MockRedisClient::new();
        let service = FlagService::new(
            store.clone(),
            EvaluationCache::new(Arc::new(redis), Duration::from_secs(300)).unwrap(),
        );
        service.create_flag(new_flag("f1", true)).await.unwrap();
        store.set_unavailable(true);

        assert!(matches!(
            service.evaluate("f1", &EvaluationContext::default()).await,
            Err(FlagError::DatabaseUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_misses_agree() {
        let (service, _, _) = setup_memory_service();
        service.create_flag(new_flag("f1", true)).await.unwrap();
        service
            .add_or_update_override("f1", OverrideKind::Group, "g", false)
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .evaluate("f1", &EvaluationContext::for_group("g"))
                        .await
                        .unwrap()
                        .enabled
                })
            })
            .collect();

        for handle in handles {
            assert!(!handle.await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_concurrent_upserts_on_one_flag_keep_both() {
        let (service, store) = setup_yielding_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();

        let (a, b) = tokio::join!(
            service.add_or_update_override("f1", OverrideKind::User, "u1", true),
            service.add_or_update_override("f1", OverrideKind::User, "u2", true)
        );
        a.unwrap();
        b.unwrap();

        let flag = store.get_flag_with_overrides("f1").await.unwrap().unwrap();
        assert_eq!(
            targets(&flag),
            vec![
                (OverrideKind::User, "u1".to_string(), true),
                (OverrideKind::User, "u2".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_mixed_mutations_on_one_flag() {
        let (service, store) = setup_yielding_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();
        service
            .add_or_update_override("f1", OverrideKind::User, "u1", true)
            .await
            .unwrap();
        service
            .add_or_update_override("f1", OverrideKind::User, "u2", true)
            .await
            .unwrap();

        let (upserted, removed, grouped, updated, global) = tokio::join!(
            service.add_or_update_override("f1", OverrideKind::User, "u3", false),
            service.remove_override("f1", OverrideKind::User, "u1"),
            service.add_or_update_override("f1", OverrideKind::Group, "g1", true),
            service.add_or_update_override("f1", OverrideKind::User, "u2", false),
            service.update_global_state("f1", true)
        );
        upserted.unwrap();
        removed.unwrap();
        grouped.unwrap();
        updated.unwrap();
        global.unwrap();

        let flag = store.get_flag_with_overrides("f1").await.unwrap().unwrap();
        assert!(flag.is_enabled);
        assert_eq!(
            targets(&flag),
            vec![
                (OverrideKind::Group, "g1".to_string(), true),
                (OverrideKind::User, "u2".to_string(), false),
                (OverrideKind::User, "u3".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_removes_of_one_override_find_it_once() {
        let (service, store) = setup_yielding_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();
        service
            .add_or_update_override("f1", OverrideKind::Region, "IN", true)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            service.remove_override("f1", OverrideKind::Region, "IN"),
            service.remove_override("f1", OverrideKind::Region, "IN")
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(
            a.err().or(b.err()),
            Some(FlagError::OverrideNotFound { .. })
        ));
        let flag = store.get_flag_with_overrides("f1").await.unwrap().unwrap();
        assert!(flag.overrides.is_empty());
    }

    #[tokio::test]
    async fn test_delete_flag_drops_targeted_entries_too() {
        let (service, _, redis) = setup_memory_service();
        service.create_flag(new_flag("f1", true)).await.unwrap();
        let user = EvaluationContext::for_user("u1");
        let full = ctx(Some("u2"), Some("g1"), Some("IN"));
        service.evaluate("f1", &user).await.unwrap();
        service.evaluate("f1", &full).await.unwrap();
        assert_eq!(service.evaluate("f1", &user).await.unwrap(), hit(true));

        service.delete_flag("f1").await.unwrap();

        assert!(!redis.contains_key("feature_eval:f1:user:u1"));
        assert!(!redis.contains_key("feature_eval:f1:region:IN:group:g1:user:u2"));
        assert!(service
            .evaluate("f1", &user)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(service
            .evaluate("f1", &full)
            .await
            .unwrap_err()
            .is_not_found());

        service.create_flag(new_flag("f1", false)).await.unwrap();
        assert_eq!(service.evaluate("f1", &user).await.unwrap(), miss(false));
    }

    #[tokio::test]
    async fn test_delete_flag_leaves_other_flags_cached() {
        let (service, _, _) = setup_memory_service();
        service.create_flag(new_flag("f1", true)).await.unwrap();
        service.create_flag(new_flag("f10", true)).await.unwrap();
        let user = EvaluationContext::for_user("u1");
        service.evaluate("f10", &user).await.unwrap();

        service.delete_flag("f1").await.unwrap();

        assert_eq!(service.evaluate("f10", &user).await.unwrap(), hit(true));
    }

    #[tokio::test]
    async fn test_separator_in_context_is_rejected_before_cache() {
        let (service, _, redis) = setup_memory_service();
        service.create_flag(new_flag("f1", false)).await.unwrap();
        service
            .add_or_update_override("f1", OverrideKind::User, "u1", true)
            .await
            .unwrap();
        service
            .evaluate("f1", &EvaluationContext::for_user("u1"))
            .await
            .unwrap();

        // Would alias feature_eval:f1:region:IN:user:u1 without the check.
        assert!(matches!(
            service
                .evaluate("f1", &ctx(None, None, Some("IN:user:u1")))
                .await,
            Err(FlagError::BadRequest(_))
        ));
        assert!(matches!(
            service
                .add_or_update_override("f1", OverrideKind::Region, "IN:user:u1", true)
                .await,
            Err(FlagError::BadRequest(_))
        ));
        assert_eq!(redis.calls_for("get").len(), 1);
    }
}
