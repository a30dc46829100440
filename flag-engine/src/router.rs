use std::future::ready;
use std::sync::Arc;

use axum::{
    http::{Method, StatusCode},
    routing::{get, patch, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    api::endpoint,
    config::Config,
    database::FlagStore,
    flags::flag_service::FlagService,
    metrics_utils::{setup_metrics_recorder, track_metrics},
};

#[derive(Clone)]
pub struct State {
    pub flag_service: FlagService,
}

pub fn router(flag_service: FlagService, config: &Config) -> Router {
    let store = flag_service.store().clone();
    let state = State { flag_service };

    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
            Method::HEAD,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    // liveness/readiness checks
    let status_router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(move || readiness(store.clone())))
        .route("/_liveness", get(|| ready("ok")));

    let flags_router = Router::new()
        .route(
            "/flags",
            get(endpoint::list_flags).post(endpoint::create_flag),
        )
        .route(
            "/flags/:key",
            get(endpoint::get_flag)
                .put(endpoint::update_flag)
                .delete(endpoint::delete_flag),
        )
        .route(
            "/flags/:key/global",
            patch(endpoint::update_global_state),
        )
        .route(
            "/flags/:key/overrides",
            post(endpoint::upsert_override).delete(endpoint::remove_override),
        )
        .route("/flags/:key/evaluate", get(endpoint::evaluate))
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency));

    let router = Router::new()
        .merge(status_router)
        .merge(flags_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Global metrics recorders can play poorly with tests, so only install when asked to.
    if config.enable_metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}

pub async fn readiness(
    store: Arc<dyn FlagStore + Send + Sync>,
) -> Result<&'static str, (StatusCode, String)> {
    store.ping().await.map_err(|e| {
        tracing::warn!("readiness check failed: {}", e);
        (StatusCode::SERVICE_UNAVAILABLE, "store unavailable".to_string())
    })?;

    Ok("ready")
}

pub async fn index() -> &'static str {
    "feature flag engine"
}
