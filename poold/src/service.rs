//! Process wiring for the pool daemon.
//!
//! Builds the node RPC client, the job manager and the TCP Stratum server,
//! hands them to a [`Pool`], and bridges the pool's event stream into
//! `tracing` and Prometheus.

use crate::block_notify;
use anyhow::Context;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use pool_core::metrics::{MetricsSummary, PoolMetrics};
use pool_core::server::AuthorizeFn;
use pool_core::{
    LogLevel, Pool, PoolComponents, PoolConfig, PoolEvent, PoolEventReceiver, RpcDaemon, TemplateJobManager,
    TcpStratumServerFactory,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Run the pool until Ctrl+C
pub async fn run(config: PoolConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(PoolMetrics::new(&config.name).context("Failed to create metrics")?);

    let (daemon, daemon_events) = RpcDaemon::new(config.daemon.clone())?;
    let daemon = Arc::new(daemon);
    let (job_manager, job_events) = TemplateJobManager::new(config.job.clone());

    // Miners are not authenticated; the payout address is the pool's
    let authorize: AuthorizeFn = Arc::new(|_ip: &str, _worker: &str, _password: &str| true);

    let components = PoolComponents {
        daemon: daemon.clone(),
        daemon_events,
        job_manager: Arc::new(job_manager),
        job_events,
        stratum_factory: Arc::new(TcpStratumServerFactory::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))),
        authorize,
    };

    let (pool, handle, events) = Pool::new(config.clone(), components);
    let pool_task = tokio::spawn(pool.run());
    let forwarder = tokio::spawn(forward_events(events, Arc::clone(&metrics)));

    if config.monitoring.enable_metrics {
        let bind_address = config.monitoring.metrics_bind_address;
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = serve_monitoring(bind_address, metrics).await {
                error!("Monitoring server error: {:#}", e);
            }
        });
    }

    if config.block_notify.enabled {
        let listener = block_notify::bind(config.block_notify.bind_address).await?;
        tokio::spawn(block_notify::serve(listener, handle.clone()));
    }

    daemon.init();

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }

    handle.shutdown();
    pool_task.await.context("Pool task failed")?;
    forwarder.abort();

    Ok(())
}

/// Drain pool events into the log and the metrics registry
pub async fn forward_events(mut events: PoolEventReceiver, metrics: Arc<PoolMetrics>) {
    while let Some(event) = events.recv().await {
        metrics.record_event(&event);

        match &event {
            PoolEvent::Log { level, category, message } => match level {
                LogLevel::Debug => debug!(category = %category, "{}", message),
                LogLevel::Warning => warn!(category = %category, "{}", message),
                LogLevel::Error => error!(category = %category, "{}", message),
            },
            PoolEvent::Share { valid_share, valid_block, data } => {
                if *valid_block {
                    info!(
                        worker = %data.worker,
                        height = data.height,
                        "Block {} found",
                        data.block_hash.as_deref().unwrap_or_default()
                    );
                } else if *valid_share {
                    debug!(worker = %data.worker, difficulty = data.difficulty, "Share accepted");
                } else {
                    debug!(
                        worker = %data.worker,
                        "Share rejected: {}",
                        data.error.as_deref().unwrap_or("invalid")
                    );
                }
            }
            PoolEvent::Started => info!("Pool is accepting miners"),
        }
    }
}

fn monitoring_router(metrics: Arc<PoolMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/health", get(health_check))
        .with_state(metrics)
}

async fn serve_monitoring(bind_address: SocketAddr, metrics: Arc<PoolMetrics>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind monitoring server on {}", bind_address))?;

    info!("Monitoring server listening on http://{}", bind_address);
    axum::serve(listener, monitoring_router(metrics)).await?;
    Ok(())
}

async fn get_metrics(State(metrics): State<Arc<PoolMetrics>>) -> Result<String, StatusCode> {
    metrics.export_prometheus().map_err(|e| {
        error!("Failed to export metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn health_check(State(metrics): State<Arc<PoolMetrics>>) -> Json<serde_json::Value> {
    let summary: MetricsSummary = metrics.get_summary();
    Json(serde_json::json!({
        "status": if summary.stratum_started { "healthy" } else { "starting" },
        "timestamp": chrono::Utc::now().timestamp(),
        "metrics": summary,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_core::events::PoolEventSender;
    use pool_core::ShareData;

    fn create_test_share(block_hash: Option<&str>) -> ShareData {
        ShareData {
            job_id: "1".to_string(),
            ip: "127.0.0.1".to_string(),
            worker: "bc1qworker".to_string(),
            height: 800_000,
            block_reward: 625_000_000,
            difficulty: 8.0,
            share_diff: 12.5,
            block_diff: 1_000_000.0,
            block_hash: block_hash.map(str::to_string),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_forward_events_updates_metrics() {
        let metrics = Arc::new(PoolMetrics::new("test").unwrap());
        let (sender, events) = PoolEventSender::channel();

        sender.started();
        sender.share(true, false, create_test_share(None));
        sender.share(true, true, create_test_share(Some("00000000abcd")));
        sender.error("system", "boom");
        drop(sender);

        forward_events(events, Arc::clone(&metrics)).await;

        let summary = metrics.get_summary();
        assert!(summary.stratum_started);
        assert_eq!(summary.shares_accepted, 2);
        assert_eq!(summary.blocks_found, 1);
    }

    #[tokio::test]
    async fn test_health_reports_started() {
        let metrics = Arc::new(PoolMetrics::new("test").unwrap());

        let Json(body) = health_check(State(Arc::clone(&metrics))).await;
        assert_eq!(body["status"], "starting");

        metrics.record_event(&PoolEvent::Started);
        let Json(body) = health_check(State(metrics)).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["metrics"]["stratum_started"], true);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exports_text() {
        let metrics = Arc::new(PoolMetrics::new("test").unwrap());
        metrics.record_event(&PoolEvent::Started);

        let body = get_metrics(State(metrics)).await.unwrap();
        assert!(body.contains("pool_shares_accepted_total"));
    }
}
