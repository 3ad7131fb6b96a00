use std::sync::Arc;

use anyhow::Context;
use rpc_admission::{
    api::{AppState, routes},
    config::{AdmissionConfig, LogFormat, ServiceConfig},
    metrics::AdmissionMetrics,
    ratelimit::registry::{RateLimitBudgetRegistry, RateLimitEngineRegistry},
    storage::StorageRegistry,
    upstream::UpstreamRegistry,
};
use tokio::{net::TcpListener, sync::broadcast};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ServiceConfig::from_env().context("failed to build service config")?;
    init_tracing(&cfg);

    let admission = match &cfg.admission_config_path {
        Some(path) => AdmissionConfig::from_file(path)
            .with_context(|| format!("failed to load admission config from {}", path.display()))?,
        None => {
            tracing::warn!("ADMISSION_CONFIG not set; starting without budgets or upstreams");
            AdmissionConfig::default()
        }
    };

    let storages = StorageRegistry::connect(&admission.storages)
        .await
        .context("failed to open storages")?;
    let engines = RateLimitEngineRegistry::from_config(&admission.rate_limiters.engines, &storages)
        .context("failed to build rate limit engines")?;
    let budgets = Arc::new(
        RateLimitBudgetRegistry::from_config(&admission.rate_limiters.budgets, &engines)
            .context("failed to build rate limit budgets")?,
    );
    let upstreams = Arc::new(
        UpstreamRegistry::from_config(&admission.upstreams, &budgets)
            .context("failed to build upstreams")?,
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let auto_tune_tasks = upstreams.start(&shutdown_tx);

    let app = routes(AppState::new(
        budgets.clone(),
        upstreams,
        Arc::new(AdmissionMetrics::new()),
    ));

    let listener = TcpListener::bind(cfg.bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(
        addr = %cfg.bind_addr,
        budgets = budgets.len(),
        auto_tuned = auto_tune_tasks.len(),
        "admission service listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("admission server error")?;

    let _ = shutdown_tx.send(());
    for task in auto_tune_tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "auto-tune task ended abnormally");
        }
    }
    tracing::info!("admission service stopped");

    Ok(())
}

fn init_tracing(cfg: &ServiceConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));

    match cfg.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
    }
}
