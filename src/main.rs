pub mod batch;
pub mod config;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod logging;
pub mod quota;
pub mod runtime_config;
pub mod util;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::batch::{BatchOrchestrator, JobRequest, OrchestratorSettings, Progress};
use crate::credential::health::{MaintenanceSettings, spawn_maintenance_task};
use crate::credential::{CredentialManager, GeminiClassifier};
use crate::llm::{GeminiClient, LlmCaller};
use crate::quota::{JsonFilePersistence, MemoryPersistence, QuotaPersistence, QuotaTracker};
use crate::util::clock::{Clock, SystemClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing();

    // 初始化运行时配置
    runtime_config::init(&cfg);

    let keys = credential::store::Store::new(&cfg)
        .load_keys()
        .await
        .context("加载凭证失败")?;
    if keys.is_empty() {
        tracing::warn!("没有可用的 API 密钥，所有批次都会走回退策略");
    } else {
        tracing::info!("已加载 {} 个 API 密钥", keys.len());
    }

    // DATA_DIR 为空时配额只保存在内存里，重启即清零
    let persistence: Arc<dyn QuotaPersistence> = if cfg.data_dir.trim().is_empty() {
        tracing::warn!("DATA_DIR 为空，配额记录不会持久化");
        Arc::new(MemoryPersistence::new())
    } else {
        Arc::new(JsonFilePersistence::new(cfg.data_dir.trim()))
    };
    let tracker = QuotaTracker::open(
        persistence,
        cfg.reset_tz(),
        SystemClock.now(),
    )
    .await
    .context("加载配额记录失败")?;

    let manager = Arc::new(CredentialManager::new(
        keys,
        &cfg.model,
        tracker.clone(),
        Arc::new(GeminiClassifier),
        Arc::new(SystemClock),
    ));

    let llm: Arc<dyn LlmCaller> =
        Arc::new(GeminiClient::new(&cfg).context("初始化 GeminiClient 失败")?);

    let settings = OrchestratorSettings::from_config(&cfg).with_runtime(&runtime_config::get());
    let orchestrator = Arc::new(BatchOrchestrator::new(
        manager.clone(),
        llm.clone(),
        settings,
    ));

    let result = match cfg.input.clone() {
        Some(input) => run_once(&orchestrator, &input, cfg.output.as_deref()).await,
        None => serve(cfg, orchestrator, manager, llm).await,
    };

    // 退出前把未写盘的配额计数落盘
    tracker.flush().await;
    result
}

/// 单次模式：读取 -input 文件，跑完一个任务后把报告写到 -output（未指定时写 stdout）。
async fn run_once(
    orchestrator: &BatchOrchestrator,
    input: &Path,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("读取输入文件 {} 失败", input.display()))?;
    let req = JobRequest::from_slice(&bytes)
        .with_context(|| format!("解析输入文件 {} 失败", input.display()))?;

    tracing::info!("开始处理 {} 条记录（任务 {:?}）", req.items.len(), req.params.task);
    let on_progress = |p: &Progress| gateway::handler::log_progress(p);
    let report = orchestrator
        .submit_batch_job(req.items, req.params, &on_progress)
        .await?;
    tracing::info!(
        job = %report.job_id,
        results = report.results.len(),
        unresolved = report.unresolved.len(),
        stopped = report.stopped,
        "任务完成"
    );

    let json = sonic_rs::to_string_pretty(&report).context("序列化任务报告失败")?;
    match output {
        Some(path) => tokio::fs::write(path, json)
            .await
            .with_context(|| format!("写入输出文件 {} 失败", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

async fn serve(
    cfg: config::Config,
    orchestrator: Arc<BatchOrchestrator>,
    manager: Arc<CredentialManager>,
    llm: Arc<dyn LlmCaller>,
) -> anyhow::Result<()> {
    // 后台维护：回收已过重置时间的凭证，并定期做健康探测。
    let maintenance = spawn_maintenance_task(
        manager,
        llm.clone(),
        MaintenanceSettings::from_config(&cfg),
    );

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    let state = Arc::new(gateway::AppState::new(cfg, orchestrator, llm));
    let app = gateway::router(state);

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出");

    maintenance.abort();
    served
}

fn init_tracing() {
    // DEBUG 只控制请求/响应详细日志块，服务自身日志始终保留。
    // 依赖库日志默认压到 warn，本项目日志至少为 info，避免预设的 RUST_LOG=warn 把关键日志过滤掉。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,litscreen=info")
    } else if env.contains("litscreen") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},litscreen=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
