//! HTTP 接口：提交任务、查看配额、任务控制、健康检查与运行时设置。

pub mod handler;

use axum::routing::{get, post};
use axum::{Router, middleware};
use std::sync::Arc;

pub use handler::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    // === 公开路由（不需要认证）===
    let public_routes = Router::new().route("/health", get(handler::handle_health));

    // === API 路由（配置了 ACCESS_KEY 时需要认证）===
    let api_routes = Router::new()
        .route("/api/jobs", post(handler::handle_submit_job))
        .route("/api/jobs/progress", get(handler::handle_progress))
        .route("/api/jobs/pause", post(handler::handle_pause))
        .route("/api/jobs/resume", post(handler::handle_resume))
        .route("/api/jobs/stop", post(handler::handle_stop))
        .route("/api/quota", get(handler::handle_quota))
        .route("/api/health-check", post(handler::handle_health_check))
        .route(
            "/api/settings",
            get(handler::handle_settings_get).post(handler::handle_settings_post),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handler::access_key_middleware,
        ))
        .with_state(state);

    Router::new().merge(public_routes).merge(api_routes)
}
