use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flags::flag_models::{
    EvaluationContext, FeatureFlag, FlagOverride, NewFlag, NewOverride, OverrideKind,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvaluateQueryParams {
    #[serde(alias = "userId")]
    pub user_id: Option<String>,
    #[serde(alias = "groupId")]
    pub group_id: Option<String>,
    pub region: Option<String>,
}

impl From<EvaluateQueryParams> for EvaluationContext {
    fn from(params: EvaluateQueryParams) -> Self {
        EvaluationContext::new(params.user_id, params.group_id, params.region)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFlagsQueryParams {
    #[serde(default, alias = "includeOverrides")]
    pub include_overrides: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalStateQueryParams {
    #[serde(alias = "isEnabled")]
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveOverrideQueryParams {
    pub kind: OverrideKind,
    #[serde(alias = "targetId")]
    pub target_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFlagRequest {
    pub key: String,
    #[serde(default, alias = "isEnabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub overrides: Vec<OverrideRequest>,
}

impl From<CreateFlagRequest> for NewFlag {
    fn from(request: CreateFlagRequest) -> Self {
        NewFlag {
            key: request.key,
            is_enabled: request.is_enabled,
            description: request.description,
            overrides: request.overrides.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateFlagRequest {
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverrideRequest {
    pub kind: OverrideKind,
    #[serde(alias = "targetId")]
    pub target_id: String,
    #[serde(alias = "isEnabled")]
    pub is_enabled: bool,
}

impl From<OverrideRequest> for NewOverride {
    fn from(request: OverrideRequest) -> Self {
        NewOverride {
            kind: request.kind,
            target_id: request.target_id,
            is_enabled: request.is_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResponse {
    pub key: String,
    pub enabled: bool,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideResponse {
    pub id: Uuid,
    pub kind: OverrideKind,
    pub target_id: String,
    pub is_enabled: bool,
}

impl From<FlagOverride> for OverrideResponse {
    fn from(o: FlagOverride) -> Self {
        OverrideResponse {
            id: o.id,
            kind: o.kind,
            target_id: o.target_id,
            is_enabled: o.is_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagResponse {
    pub id: Uuid,
    pub key: String,
    pub is_enabled: bool,
    pub description: Option<String>,
    /// Omitted when the flag was listed without overrides.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Vec<OverrideResponse>>,
}

impl FlagResponse {
    pub fn with_overrides(flag: FeatureFlag) -> Self {
        let overrides = flag
            .overrides
            .to_sorted_vec()
            .into_iter()
            .map(OverrideResponse::from)
            .collect();
        FlagResponse {
            overrides: Some(overrides),
            ..Self::without_overrides(flag)
        }
    }

    pub fn without_overrides(flag: FeatureFlag) -> Self {
        FlagResponse {
            id: flag.id,
            key: flag.key,
            is_enabled: flag.is_enabled,
            description: flag.description,
            overrides: None,
        }
    }
}
