use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    api::errors::FlagError,
    database::{FlagStore, Repository},
    flags::flag_models::{FeatureFlag, FlagOverride, FlagOverrides, OverrideKind},
};

/// Flag store kept in process memory. Used by tests and by `STORAGE_BACKEND=memory`.
#[derive(Default)]
pub struct InMemoryFlagStore {
    flags: RwLock<HashMap<Uuid, FeatureFlag>>,
    unavailable: AtomicBool,
}

impl InMemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `DatabaseUnavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), FlagError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FlagError::DatabaseUnavailable);
        }
        Ok(())
    }
}

fn without_overrides(flag: &FeatureFlag) -> FeatureFlag {
    FeatureFlag {
        overrides: FlagOverrides::new(),
        ..flag.clone()
    }
}

#[async_trait]
impl Repository<FeatureFlag> for InMemoryFlagStore {
    async fn get_all(&self) -> Result<Vec<FeatureFlag>, FlagError> {
        self.check_available()?;
        let mut flags: Vec<FeatureFlag> =
            self.flags.read().await.values().map(without_overrides).collect();
        flags.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(flags)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<FeatureFlag>, FlagError> {
        self.check_available()?;
        Ok(self.flags.read().await.get(&id).cloned())
    }

    async fn insert(&self, flag: &FeatureFlag) -> Result<(), FlagError> {
        self.check_available()?;
        let mut flags = self.flags.write().await;
        if flags.values().any(|f| f.key == flag.key) {
            return Err(FlagError::FlagAlreadyExists(flag.key.clone()));
        }
        if flags.contains_key(&flag.id) {
            return Err(FlagError::Internal(format!("duplicate flag id {}", flag.id)));
        }
        flags.insert(flag.id, flag.clone());
        Ok(())
    }

    async fn update(&self, flag: &FeatureFlag) -> Result<(), FlagError> {
        self.check_available()?;
        let mut flags = self.flags.write().await;
        let stored = flags
            .get_mut(&flag.id)
            .ok_or_else(|| FlagError::FlagNotFound(flag.key.clone()))?;
        stored.is_enabled = flag.is_enabled;
        stored.description = flag.description.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, FlagError> {
        self.check_available()?;
        Ok(self.flags.write().await.remove(&id).is_some())
    }

    async fn exists(&self, id: Uuid) -> Result<bool, FlagError> {
        self.check_available()?;
        Ok(self.flags.read().await.contains_key(&id))
    }
}

#[async_trait]
impl FlagStore for InMemoryFlagStore {
    async fn get_flag_with_overrides(&self, key: &str) -> Result<Option<FeatureFlag>, FlagError> {
        self.check_available()?;
        Ok(self
            .flags
            .read()
            .await
            .values()
            .find(|f| f.key == key)
            .cloned())
    }

    async fn get_all_flags_with_overrides(&self) -> Result<Vec<FeatureFlag>, FlagError> {
        self.check_available()?;
        let mut flags: Vec<FeatureFlag> = self.flags.read().await.values().cloned().collect();
        flags.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(flags)
    }

    async fn save(&self, flag: &FeatureFlag) -> Result<(), FlagError> {
        self.check_available()?;
        let mut flags = self.flags.write().await;
        match flags.get_mut(&flag.id) {
            Some(stored) => {
                *stored = flag.clone();
                Ok(())
            }
            None => Err(FlagError::FlagNotFound(flag.key.clone())),
        }
    }

    async fn upsert_override(
        &self,
        flag_key: &str,
        candidate: &FlagOverride,
    ) -> Result<FlagOverride, FlagError> {
        self.check_available()?;
        let mut flags = self.flags.write().await;
        let flag = flags
            .get_mut(&candidate.feature_flag_id)
            .ok_or_else(|| FlagError::FlagNotFound(flag_key.to_string()))?;

        let stored = match flag.overrides.get(candidate.kind, &candidate.target_id) {
            Some(existing) => FlagOverride {
                is_enabled: candidate.is_enabled,
                ..existing.clone()
            },
            None => candidate.clone(),
        };
        flag.overrides.upsert(stored.clone());
        Ok(stored)
    }

    async fn delete_override(
        &self,
        flag_id: Uuid,
        kind: OverrideKind,
        target_id: &str,
    ) -> Result<bool, FlagError> {
        self.check_available()?;
        let mut flags = self.flags.write().await;
        Ok(flags
            .get_mut(&flag_id)
            .and_then(|flag| flag.overrides.remove(kind, target_id))
            .is_some())
    }

    async fn set_global_state(&self, flag_id: Uuid, is_enabled: bool) -> Result<bool, FlagError> {
        self.check_available()?;
        let mut flags = self.flags.write().await;
        match flags.get_mut(&flag_id) {
            Some(flag) => {
                flag.is_enabled = is_enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_description(
        &self,
        flag_id: Uuid,
        description: Option<&str>,
    ) -> Result<bool, FlagError> {
        self.check_available()?;
        let mut flags = self.flags.write().await;
        match flags.get_mut(&flag_id) {
            Some(flag) => {
                flag.description = description.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), FlagError> {
        self.check_available()
    }
}
