use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{debug_handler, Json};
use serde::de::DeserializeOwned;

use crate::{
    api::{
        errors::FlagError,
        types::{
            CreateFlagRequest, EvaluateQueryParams, EvaluationResponse, FlagResponse,
            GlobalStateQueryParams, ListFlagsQueryParams, OverrideRequest, OverrideResponse,
            RemoveOverrideQueryParams, UpdateFlagRequest,
        },
    },
    flags::flag_models::EvaluationContext,
    router,
};

pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache");

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, FlagError> {
    params
        .map(|Query(params)| params)
        .map_err(|e| FlagError::BadRequest(e.body_text()))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, FlagError> {
    Ok(serde_json::from_slice(body)?)
}

/// Evaluates one flag for the targeting attributes in the query string.
#[debug_handler]
pub async fn evaluate(
    State(state): State<router::State>,
    Path(key): Path<String>,
    params: Result<Query<EvaluateQueryParams>, QueryRejection>,
) -> Result<Response, FlagError> {
    let context = EvaluationContext::from(query(params)?);
    let evaluation = state.flag_service.evaluate(&key, &context).await?;

    let cache_status = if evaluation.from_cache { "HIT" } else { "MISS" };
    Ok((
        [(CACHE_STATUS_HEADER, HeaderValue::from_static(cache_status))],
        Json(EvaluationResponse {
            key,
            enabled: evaluation.enabled,
            from_cache: evaluation.from_cache,
        }),
    )
        .into_response())
}

pub async fn list_flags(
    State(state): State<router::State>,
    params: Result<Query<ListFlagsQueryParams>, QueryRejection>,
) -> Result<Json<Vec<FlagResponse>>, FlagError> {
    let include_overrides = query(params)?.include_overrides;
    let flags = state.flag_service.list_flags(include_overrides).await?;

    let to_response = if include_overrides {
        FlagResponse::with_overrides
    } else {
        FlagResponse::without_overrides
    };
    Ok(Json(flags.into_iter().map(to_response).collect()))
}

pub async fn create_flag(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<(StatusCode, Json<FlagResponse>), FlagError> {
    let request: CreateFlagRequest = parse_body(&body)?;
    let flag = state.flag_service.create_flag(request.into()).await?;

    Ok((StatusCode::CREATED, Json(FlagResponse::with_overrides(flag))))
}

pub async fn get_flag(
    State(state): State<router::State>,
    Path(key): Path<String>,
) -> Result<Json<FlagResponse>, FlagError> {
    let flag = state.flag_service.get_flag(&key).await?;
    Ok(Json(FlagResponse::with_overrides(flag)))
}

pub async fn update_flag(
    State(state): State<router::State>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<FlagResponse>, FlagError> {
    let request: UpdateFlagRequest = parse_body(&body)?;
    let flag = state
        .flag_service
        .update_description(&key, request.description)
        .await?;

    Ok(Json(FlagResponse::with_overrides(flag)))
}

pub async fn delete_flag(
    State(state): State<router::State>,
    Path(key): Path<String>,
) -> Result<StatusCode, FlagError> {
    state.flag_service.delete_flag(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_global_state(
    State(state): State<router::State>,
    Path(key): Path<String>,
    params: Result<Query<GlobalStateQueryParams>, QueryRejection>,
) -> Result<StatusCode, FlagError> {
    let is_enabled = query(params)?.is_enabled;
    state
        .flag_service
        .update_global_state(&key, is_enabled)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn upsert_override(
    State(state): State<router::State>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<OverrideResponse>, FlagError> {
    let request: OverrideRequest = parse_body(&body)?;
    let flag_override = state
        .flag_service
        .add_or_update_override(&key, request.kind, &request.target_id, request.is_enabled)
        .await?;

    Ok(Json(flag_override.into()))
}

pub async fn remove_override(
    State(state): State<router::State>,
    Path(key): Path<String>,
    params: Result<Query<RemoveOverrideQueryParams>, QueryRejection>,
) -> Result<StatusCode, FlagError> {
    let params = query(params)?;
    state
        .flag_service
        .remove_override(&key, params.kind, &params.target_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
