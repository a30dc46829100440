pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    api::errors::FlagError,
    flags::flag_models::{FeatureFlag, FlagOverride, OverrideKind},
};

pub use memory::InMemoryFlagStore;
pub use postgres::PgFlagStore;

/// Generic id-based access to a persisted entity.
#[async_trait]
pub trait Repository<T>: Send + Sync {
    async fn get_all(&self) -> Result<Vec<T>, FlagError>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<T>, FlagError>;
    async fn insert(&self, entity: &T) -> Result<(), FlagError>;
    async fn update(&self, entity: &T) -> Result<(), FlagError>;
    /// Returns false when nothing was deleted.
    async fn delete(&self, id: Uuid) -> Result<bool, FlagError>;
    async fn exists(&self, id: Uuid) -> Result<bool, FlagError>;
}

/// Storage for flags and their overrides.
///
/// For `FeatureFlag`, `Repository::get_all` returns flags without their overrides,
/// `Repository::update` writes only the flag's own columns, and `Repository::insert`
/// fails with `FlagError::FlagAlreadyExists` on a duplicate key.
///
/// The single-row mutations touch only the row they name, so concurrent mutations of
/// different overrides on one flag never undo each other.
#[async_trait]
pub trait FlagStore: Repository<FeatureFlag> {
    async fn get_flag_with_overrides(&self, key: &str) -> Result<Option<FeatureFlag>, FlagError>;
    async fn get_all_flags_with_overrides(&self) -> Result<Vec<FeatureFlag>, FlagError>;
    /// Persists the flag's own columns and replaces its stored override set with
    /// `flag.overrides`. Last writer wins over the whole set, so read-modify-save cycles
    /// racing on one flag can drop each other's overrides; concurrent edits go through the
    /// single-row mutations below.
    async fn save(&self, flag: &FeatureFlag) -> Result<(), FlagError>;

    /// Inserts `candidate`, or sets `is_enabled` on the stored override with the same
    /// (flag, kind, target id), keeping that override's id. Returns the stored override.
    /// `flag_key` is only used for the `FlagNotFound` error.
    async fn upsert_override(
        &self,
        flag_key: &str,
        candidate: &FlagOverride,
    ) -> Result<FlagOverride, FlagError>;
    /// Returns false when the flag has no such override.
    async fn delete_override(
        &self,
        flag_id: Uuid,
        kind: OverrideKind,
        target_id: &str,
    ) -> Result<bool, FlagError>;
    /// Returns false when the flag no longer exists.
    async fn set_global_state(&self, flag_id: Uuid, is_enabled: bool) -> Result<bool, FlagError>;
    /// Returns false when the flag no longer exists.
    async fn set_description(
        &self,
        flag_id: Uuid,
        description: Option<&str>,
    ) -> Result<bool, FlagError>;

    async fn ping(&self) -> Result<(), FlagError>;
}
