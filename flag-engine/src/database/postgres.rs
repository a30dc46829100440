use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    api::errors::FlagError,
    database::{FlagStore, Repository},
    flags::flag_models::{FeatureFlag, FlagOverride, FlagOverrides, OverrideKind},
    metrics_consts::DB_FLAG_READS_COUNTER,
    metrics_utils::inc,
};

const FLAG_COLUMNS: &str = "id, key, is_enabled, description";
const OVERRIDE_COLUMNS: &str = "id, feature_flag_id, kind, target_id, is_enabled";

#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    id: Uuid,
    key: String,
    is_enabled: bool,
    description: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct OverrideRow {
    id: Uuid,
    feature_flag_id: Uuid,
    kind: String,
    target_id: String,
    is_enabled: bool,
}

impl TryFrom<OverrideRow> for FlagOverride {
    type Error = FlagError;

    fn try_from(row: OverrideRow) -> Result<Self, Self::Error> {
        let kind = OverrideKind::from_str(&row.kind).map_err(|_| {
            tracing::error!("override {} has unknown kind '{}'", row.id, row.kind);
            FlagError::Internal(format!("unknown override kind '{}'", row.kind))
        })?;

        Ok(FlagOverride {
            id: row.id,
            feature_flag_id: row.feature_flag_id,
            kind,
            target_id: row.target_id,
            is_enabled: row.is_enabled,
        })
    }
}

impl FlagRow {
    fn into_flag(self, overrides: FlagOverrides) -> FeatureFlag {
        FeatureFlag {
            id: self.id,
            key: self.key,
            is_enabled: self.is_enabled,
            description: self.description,
            overrides,
        }
    }
}

fn map_insert_error(err: sqlx::Error, key: &str) -> FlagError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return FlagError::FlagAlreadyExists(key.to_string());
        }
    }
    FlagError::from(err)
}

fn map_override_error(err: sqlx::Error, key: &str) -> FlagError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_foreign_key_violation() {
            return FlagError::FlagNotFound(key.to_string());
        }
    }
    FlagError::from(err)
}

/// Flag store backed by the `feature_flags` and `feature_overrides` tables.
#[derive(Clone)]
pub struct PgFlagStore {
    pool: PgPool,
}

impl PgFlagStore {
    pub async fn new(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, FlagError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    async fn overrides_for(&self, flag_id: Uuid) -> Result<FlagOverrides, FlagError> {
        let query = format!(
            "SELECT {OVERRIDE_COLUMNS} FROM feature_overrides WHERE feature_flag_id = $1 ORDER BY id"
        );
        let rows = sqlx::query_as::<_, OverrideRow>(&query)
            .bind(flag_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(FlagOverride::try_from).collect()
    }

    async fn insert_overrides(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        flag: &FeatureFlag,
    ) -> Result<(), FlagError> {
        for o in flag.overrides.iter() {
            sqlx::query(
                "INSERT INTO feature_overrides (id, feature_flag_id, kind, target_id, is_enabled)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (feature_flag_id, kind, target_id) DO NOTHING",
            )
            .bind(o.id)
            .bind(flag.id)
            .bind(o.kind.as_ref())
            .bind(&o.target_id)
            .bind(o.is_enabled)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Repository<FeatureFlag> for PgFlagStore {
    #[instrument(skip_all)]
    async fn get_all(&self) -> Result<Vec<FeatureFlag>, FlagError> {
        let query = format!("SELECT {FLAG_COLUMNS} FROM feature_flags ORDER BY key");
        let rows = sqlx::query_as::<_, FlagRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| row.into_flag(FlagOverrides::new()))
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: Uuid) -> Result<Option<FeatureFlag>, FlagError> {
        let query = format!("SELECT {FLAG_COLUMNS} FROM feature_flags WHERE id = $1");
        let row = sqlx::query_as::<_, FlagRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let overrides = self.overrides_for(row.id).await?;
                Ok(Some(row.into_flag(overrides)))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(key = %flag.key))]
    async fn insert(&self, flag: &FeatureFlag) -> Result<(), FlagError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO feature_flags (id, key, is_enabled, description) VALUES ($1, $2, $3, $4)",
        )
        .bind(flag.id)
        .bind(&flag.key)
        .bind(flag.is_enabled)
        .bind(&flag.description)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, &flag.key))?;

        Self::insert_overrides(&mut tx, flag).await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %flag.key))]
    async fn update(&self, flag: &FeatureFlag) -> Result<(), FlagError> {
        let result = sqlx::query(
            "UPDATE feature_flags SET is_enabled = $2, description = $3 WHERE id = $1",
        )
        .bind(flag.id)
        .bind(flag.is_enabled)
        .bind(&flag.description)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FlagError::FlagNotFound(flag.key.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, FlagError> {
        let result = sqlx::query("DELETE FROM feature_flags WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn exists(&self, id: Uuid) -> Result<bool, FlagError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM feature_flags WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }
}

#[async_trait]
impl FlagStore for PgFlagStore {
    #[instrument(skip(self))]
    async fn get_flag_with_overrides(&self, key: &str) -> Result<Option<FeatureFlag>, FlagError> {
        inc(DB_FLAG_READS_COUNTER, &[], 1);

        let query = format!("SELECT {FLAG_COLUMNS} FROM feature_flags WHERE key = $1");
        let row = sqlx::query_as::<_, FlagRow>(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let overrides = self.overrides_for(row.id).await?;
                Ok(Some(row.into_flag(overrides)))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip_all)]
    async fn get_all_flags_with_overrides(&self) -> Result<Vec<FeatureFlag>, FlagError> {
        let flags_query = format!("SELECT {FLAG_COLUMNS} FROM feature_flags ORDER BY key");
        let flag_rows = sqlx::query_as::<_, FlagRow>(&flags_query)
            .fetch_all(&self.pool)
            .await?;

        let overrides_query = format!("SELECT {OVERRIDE_COLUMNS} FROM feature_overrides ORDER BY id");
        let override_rows = sqlx::query_as::<_, OverrideRow>(&overrides_query)
            .fetch_all(&self.pool)
            .await?;

        let mut by_flag: HashMap<Uuid, Vec<FlagOverride>> = HashMap::new();
        for row in override_rows {
            let o = FlagOverride::try_from(row)?;
            by_flag.entry(o.feature_flag_id).or_default().push(o);
        }

        Ok(flag_rows
            .into_iter()
            .map(|row| {
                let overrides = by_flag.remove(&row.id).unwrap_or_default();
                row.into_flag(overrides.into_iter().collect())
            })
            .collect())
    }

    #[instrument(skip_all, fields(key = %flag.key))]
    async fn save(&self, flag: &FeatureFlag) -> Result<(), FlagError> {
        let mut tx = self.pool.begin().await?;

        // The row lock only serializes saves against each other. A save still replaces the
        // whole override set with whatever the caller read earlier.
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM feature_flags WHERE id = $1 FOR UPDATE")
                .bind(flag.id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(FlagError::FlagNotFound(flag.key.clone()));
        }

        sqlx::query("UPDATE feature_flags SET is_enabled = $2, description = $3 WHERE id = $1")
            .bind(flag.id)
            .bind(flag.is_enabled)
            .bind(&flag.description)
            .execute(&mut *tx)
            .await?;

        let kept: Vec<Uuid> = flag.overrides.iter().map(|o| o.id).collect();
        sqlx::query("DELETE FROM feature_overrides WHERE feature_flag_id = $1 AND NOT (id = ANY($2))")
            .bind(flag.id)
            .bind(&kept)
            .execute(&mut *tx)
            .await?;

        for o in flag.overrides.iter() {
            sqlx::query(
                "INSERT INTO feature_overrides (id, feature_flag_id, kind, target_id, is_enabled)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (id) DO UPDATE SET is_enabled = EXCLUDED.is_enabled",
            )
            .bind(o.id)
            .bind(flag.id)
            .bind(o.kind.as_ref())
            .bind(&o.target_id)
            .bind(o.is_enabled)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %flag_key, kind = %candidate.kind, target_id = %candidate.target_id))]
    async fn upsert_override(
        &self,
        flag_key: &str,
        candidate: &FlagOverride,
    ) -> Result<FlagOverride, FlagError> {
        let query = format!(
            "INSERT INTO feature_overrides ({OVERRIDE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (feature_flag_id, kind, target_id) DO UPDATE SET is_enabled = EXCLUDED.is_enabled
             RETURNING {OVERRIDE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, OverrideRow>(&query)
            .bind(candidate.id)
            .bind(candidate.feature_flag_id)
            .bind(candidate.kind.as_ref())
            .bind(&candidate.target_id)
            .bind(candidate.is_enabled)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_override_error(e, flag_key))?;

        FlagOverride::try_from(row)
    }

    #[instrument(skip(self))]
    async fn delete_override(
        &self,
        flag_id: Uuid,
        kind: OverrideKind,
        target_id: &str,
    ) -> Result<bool, FlagError> {
        let result = sqlx::query(
            "DELETE FROM feature_overrides WHERE feature_flag_id = $1 AND kind = $2 AND target_id = $3",
        )
        .bind(flag_id)
        .bind(kind.as_ref())
        .bind(target_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn set_global_state(&self, flag_id: Uuid, is_enabled: bool) -> Result<bool, FlagError> {
        let result = sqlx::query("UPDATE feature_flags SET is_enabled = $2 WHERE id = $1")
            .bind(flag_id)
            .bind(is_enabled)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn set_description(
        &self,
        flag_id: Uuid,
        description: Option<&str>,
    ) -> Result<bool, FlagError> {
        let result = sqlx::query("UPDATE feature_flags SET description = $2 WHERE id = $1")
            .bind(flag_id)
            .bind(description)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<(), FlagError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
