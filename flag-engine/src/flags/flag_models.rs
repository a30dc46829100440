use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::api::errors::FlagError;

pub const MAX_KEY_LENGTH: usize = 100;
pub const MAX_TARGET_ID_LENGTH: usize = 100;
pub const MAX_DESCRIPTION_LENGTH: usize = 500;

/// Separates cache key segments, so it may not appear inside a key, target id or context value.
pub const KEY_SEPARATOR: char = ':';

/// The targeting dimension an override applies to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OverrideKind {
    #[serde(alias = "User", alias = "USER")]
    User,
    #[serde(alias = "Group", alias = "GROUP")]
    Group,
    #[serde(alias = "Region", alias = "REGION")]
    Region,
}

impl OverrideKind {
    /// Resolution order, highest priority first.
    pub const PRECEDENCE: [OverrideKind; 3] =
        [OverrideKind::User, OverrideKind::Group, OverrideKind::Region];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagOverride {
    pub id: Uuid,
    pub feature_flag_id: Uuid,
    pub kind: OverrideKind,
    pub target_id: String,
    pub is_enabled: bool,
}

/// Overrides of a single flag, indexed by kind and then by target id.
/// At most one rule exists per (kind, target id).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagOverrides {
    by_kind: HashMap<OverrideKind, HashMap<String, FlagOverride>>,
}

impl FlagOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: OverrideKind, target_id: &str) -> Option<&FlagOverride> {
        self.by_kind.get(&kind)?.get(target_id)
    }

    /// Inserts the override, or replaces the one with the same kind and target id.
    /// Returns the replaced override, if any.
    pub fn upsert(&mut self, flag_override: FlagOverride) -> Option<FlagOverride> {
        self.by_kind
            .entry(flag_override.kind)
            .or_default()
            .insert(flag_override.target_id.clone(), flag_override)
    }

    pub fn remove(&mut self, kind: OverrideKind, target_id: &str) -> Option<FlagOverride> {
        let targets = self.by_kind.get_mut(&kind)?;
        let removed = targets.remove(target_id);
        if targets.is_empty() {
            self.by_kind.remove(&kind);
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlagOverride> {
        self.by_kind.values().flat_map(|targets| targets.values())
    }

    pub fn len(&self) -> usize {
        self.by_kind.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overrides in a stable order (kind precedence, then target id), for responses and tests.
    pub fn to_sorted_vec(&self) -> Vec<FlagOverride> {
        let mut overrides: Vec<FlagOverride> = self.iter().cloned().collect();
        overrides.sort_by(|a, b| {
            precedence_rank(a.kind)
                .cmp(&precedence_rank(b.kind))
                .then_with(|| a.target_id.cmp(&b.target_id))
        });
        overrides
    }
}

fn precedence_rank(kind: OverrideKind) -> usize {
    OverrideKind::PRECEDENCE
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(OverrideKind::PRECEDENCE.len())
}

impl FromIterator<FlagOverride> for FlagOverrides {
    /// Duplicate (kind, target id) pairs keep the first override seen.
    fn from_iter<I: IntoIterator<Item = FlagOverride>>(iter: I) -> Self {
        let mut overrides = FlagOverrides::new();
        for flag_override in iter {
            overrides
                .by_kind
                .entry(flag_override.kind)
                .or_default()
                .entry(flag_override.target_id.clone())
                .or_insert(flag_override);
        }
        overrides
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureFlag {
    pub id: Uuid,
    pub key: String,
    pub is_enabled: bool,
    pub description: Option<String>,
    pub overrides: FlagOverrides,
}

/// Input to flag creation. Overrides supplied here are attached to the new flag.
#[derive(Debug, Clone, Default)]
pub struct NewFlag {
    pub key: String,
    pub is_enabled: bool,
    pub description: Option<String>,
    pub overrides: Vec<NewOverride>,
}

#[derive(Debug, Clone)]
pub struct NewOverride {
    pub kind: OverrideKind,
    pub target_id: String,
    pub is_enabled: bool,
}

/// Targeting attributes supplied with one evaluation call.
/// Blank values are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EvaluationContext {
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub region: Option<String>,
}

impl EvaluationContext {
    pub fn new(user_id: Option<String>, group_id: Option<String>, region: Option<String>) -> Self {
        Self {
            user_id: present(user_id),
            group_id: present(group_id),
            region: present(region),
        }
    }

    pub fn for_user(user_id: &str) -> Self {
        Self::new(Some(user_id.to_string()), None, None)
    }

    pub fn for_group(group_id: &str) -> Self {
        Self::new(None, Some(group_id.to_string()), None)
    }

    pub fn for_region(region: &str) -> Self {
        Self::new(None, None, Some(region.to_string()))
    }

    /// The context value that overrides of `kind` are matched against.
    pub fn value_for(&self, kind: OverrideKind) -> Option<&str> {
        let value = match kind {
            OverrideKind::User => self.user_id.as_deref(),
            OverrideKind::Group => self.group_id.as_deref(),
            OverrideKind::Region => self.region.as_deref(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn validate_key(key: &str) -> Result<(), FlagError> {
    if key.trim().is_empty() {
        return Err(FlagError::BadRequest("flag key must not be empty".to_string()));
    }
    if key.chars().count() > MAX_KEY_LENGTH {
        return Err(FlagError::BadRequest(format!(
            "flag key must be at most {MAX_KEY_LENGTH} characters"
        )));
    }
    reject_separator("flag key", key)
}

pub fn validate_target_id(target_id: &str) -> Result<(), FlagError> {
    if target_id.trim().is_empty() {
        return Err(FlagError::BadRequest(
            "override target_id must not be empty".to_string(),
        ));
    }
    if target_id.chars().count() > MAX_TARGET_ID_LENGTH {
        return Err(FlagError::BadRequest(format!(
            "override target_id must be at most {MAX_TARGET_ID_LENGTH} characters"
        )));
    }
    reject_separator("override target_id", target_id)
}

/// Context values must be free of the key separator, otherwise `region = "IN:user:u1"`
/// would share a cache entry with `region = "IN", user_id = "u1"`.
pub fn validate_context(context: &EvaluationContext) -> Result<(), FlagError> {
    for kind in OverrideKind::PRECEDENCE {
        if let Some(value) = context.value_for(kind) {
            reject_separator(kind.as_ref(), value)?;
        }
    }
    Ok(())
}

fn reject_separator(field: &str, value: &str) -> Result<(), FlagError> {
    if value.contains(KEY_SEPARATOR) {
        return Err(FlagError::BadRequest(format!(
            "{field} must not contain '{KEY_SEPARATOR}'"
        )));
    }
    Ok(())
}

pub fn validate_description(description: Option<&str>) -> Result<(), FlagError> {
    match description {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LENGTH => Err(FlagError::BadRequest(
            format!("description must be at most {MAX_DESCRIPTION_LENGTH} characters"),
        )),
        _ => Ok(()),
    }
}
