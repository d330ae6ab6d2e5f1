use crate::batch::types::{JobRequest, Progress};
use crate::batch::{BatchOrchestrator, RunState};
use crate::config::Config;
use crate::credential::QuotaStatusEntry;
use crate::credential::health::{HealthSummary, run_health_check};
use crate::error::AppError;
use crate::llm::LlmCaller;
use crate::logging::{self, LogLevel};
use crate::runtime_config::{self, EditableSettings};
use axum::{
    Json,
    body::Bytes,
    extract::{OriginalUri, Request, State},
    http::{HeaderMap, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub struct AppState {
    pub cfg: Config,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub llm: Arc<dyn LlmCaller>,
    /// 最近一次进度快照，供轮询。
    pub last_progress: Mutex<Option<Progress>>,
}

impl AppState {
    pub fn new(cfg: Config, orchestrator: Arc<BatchOrchestrator>, llm: Arc<dyn LlmCaller>) -> Self {
        Self {
            cfg,
            orchestrator,
            llm,
            last_progress: Mutex::new(None),
        }
    }

    fn record_progress(&self, p: &Progress) {
        *self
            .last_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(p.clone());
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaResponse {
    pub model: String,
    pub available_count: usize,
    /// 下一次请求会优先使用的凭证（脱敏标签）
    pub next_credential: Option<String>,
    pub credentials: Vec<QuotaStatusEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub state: RunState,
    pub active_jobs: usize,
}

/// 设置保存响应
#[derive(Debug, Serialize)]
struct SettingsResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn handle_health() -> &'static str {
    "ok"
}

/// ACCESS_KEY 非空时，要求 `Authorization: Bearer <key>` 或 `x-api-key: <key>`。
pub async fn access_key_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let expected = state.cfg.access_key.trim();
    if expected.is_empty() || presented_key(&headers) == Some(expected) {
        return next.run(request).await;
    }
    tracing::warn!(path = %request.uri().path(), "访问密钥缺失或错误");
    AppError::unauthorized("缺少或错误的访问密钥").into_response()
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bearer "))
    {
        return Some(v.trim());
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

/// POST /api/jobs - 运行一个批处理任务，完成后返回报告
pub async fn handle_submit_job(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let log_level = runtime_config::get().log_level();
    if log_level.client_enabled() {
        logging::client_request(method.as_str(), uri.0.path(), &headers, body.as_ref());
    }

    let req = match JobRequest::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(e) => {
            return error_response(
                AppError::bad_request(format!("请求 JSON 解析失败: {e}")),
                start,
                log_level,
            );
        }
    };

    let on_progress = |p: &Progress| {
        log_progress(p);
        state.record_progress(p);
    };
    match state
        .orchestrator
        .submit_batch_job(req.items, req.params, &on_progress)
        .await
    {
        Ok(report) => json_response(StatusCode::OK, &report, start, log_level),
        Err(e) => error_response(e.into(), start, log_level),
    }
}

pub(crate) fn log_progress(p: &Progress) {
    if let Some(reason) = &p.wait_reason {
        tracing::info!(
            batch = p.current_batch,
            phase = ?p.phase,
            available = p.available_credentials,
            "{reason}"
        );
    } else {
        tracing::debug!(
            batch = p.current_batch,
            phase = ?p.phase,
            "进度 {}/{} 条，{}/{} 批",
            p.processed_items,
            p.total_items,
            p.current_batch,
            p.total_batches
        );
    }
}

/// GET /api/jobs/progress - 最近一次进度；还没有任务时为 null
pub async fn handle_progress(State(state): State<Arc<AppState>>) -> Json<Option<Progress>> {
    Json(
        state
            .last_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone(),
    )
}

pub async fn handle_pause(State(state): State<Arc<AppState>>) -> Json<ControlResponse> {
    let control = state.orchestrator.control();
    let s = control.pause();
    tracing::info!("收到暂停请求，当前状态 {s:?}");
    control_response(&state, s)
}

pub async fn handle_resume(State(state): State<Arc<AppState>>) -> Json<ControlResponse> {
    let s = state.orchestrator.control().resume();
    tracing::info!("收到恢复请求，当前状态 {s:?}");
    control_response(&state, s)
}

pub async fn handle_stop(State(state): State<Arc<AppState>>) -> Json<ControlResponse> {
    let s = state.orchestrator.control().stop();
    tracing::info!("收到停止请求");
    control_response(&state, s)
}

fn control_response(state: &AppState, s: RunState) -> Json<ControlResponse> {
    Json(ControlResponse {
        state: s,
        active_jobs: state.orchestrator.active_jobs(),
    })
}

/// GET /api/quota - 每个凭证的状态与各窗口余量（只含脱敏标签）
pub async fn handle_quota(State(state): State<Arc<AppState>>) -> Json<QuotaResponse> {
    let manager = state.orchestrator.manager();
    Json(QuotaResponse {
        model: manager.model().to_string(),
        available_count: manager.available_count(),
        next_credential: manager
            .select_credential(1)
            .map(|c| c.label().to_string()),
        credentials: manager.quota_status(),
    })
}

/// POST /api/health-check - 立即探测一次全部凭证
pub async fn handle_health_check(State(state): State<Arc<AppState>>) -> Json<HealthSummary> {
    let summary = run_health_check(
        state.orchestrator.manager(),
        &state.llm,
        state.cfg.effective_health_check_model(),
        Duration::from_millis(state.cfg.timeout_ms.max(1)),
    )
    .await;
    tracing::info!(
        "手动健康探测：健康 {}，繁忙 {}，不健康 {}，失效 {}",
        summary.healthy,
        summary.busy,
        summary.unhealthy,
        summary.invalid
    );
    Json(summary)
}

/// GET /api/settings - 当前运行时设置
pub async fn handle_settings_get() -> Json<EditableSettings> {
    Json(EditableSettings::from_runtime(&runtime_config::get()))
}

/// POST /api/settings - 保存设置
pub async fn handle_settings_post(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EditableSettings>,
) -> Response {
    if let Err(msg) = req.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(SettingsResponse {
                success: false,
                error: Some(msg),
            }),
        )
            .into_response();
    }

    // 持久化到 .env
    if let Err(e) = runtime_config::persist_to_dotenv(&req) {
        tracing::error!("保存设置失败: {e}");
        return AppError::config(format!("保存设置失败: {e}")).into_response();
    }

    // 更新运行时配置
    let new_settings = req.to_runtime();
    runtime_config::update(new_settings.clone());
    state.orchestrator.apply_runtime(&new_settings);

    tracing::info!(
        "设置已更新: temperature={}, batchSize={}, maxConcurrentBatches={}, fallback={}, debug={}",
        new_settings.temperature,
        new_settings.batch_size,
        new_settings.max_concurrent_batches,
        new_settings.fallback,
        new_settings.debug
    );

    Json(SettingsResponse {
        success: true,
        error: None,
    })
    .into_response()
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
    start: Instant,
    log_level: LogLevel,
) -> Response {
    let bytes = match sonic_rs::to_vec(value) {
        Ok(b) => b,
        Err(e) => {
            return error_response(
                AppError::Anyhow(anyhow::anyhow!("响应序列化失败: {e}")),
                start,
                log_level,
            );
        }
    };
    if log_level.client_enabled() {
        let v = sonic_rs::from_slice::<sonic_rs::Value>(&bytes).ok();
        logging::client_response(status.as_u16(), start.elapsed(), v.as_ref());
    }
    (status, [(header::CONTENT_TYPE, "application/json")], bytes).into_response()
}

fn error_response(err: AppError, start: Instant, log_level: LogLevel) -> Response {
    tracing::warn!("请求失败: {err}");
    if log_level.client_enabled() {
        logging::client_response(err.status().as_u16(), start.elapsed(), None);
    }
    err.into_response()
}
