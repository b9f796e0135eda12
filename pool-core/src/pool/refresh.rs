use super::{ChainContext, PoolServices};
use crate::error::Result;
use crate::events::category;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

/// Fetch a template and hand it to the job manager; true when it produced a new job
pub async fn refresh_template(services: &PoolServices, context: &ChainContext) -> Result<bool> {
    let template = services.daemon.get_block_template().await?;
    services.job_manager.process_template(template, &context.public_key).await
}

/// Start the polling timer; `None` when the interval is zero
pub fn start_polling(
    services: PoolServices,
    context: Arc<ChainContext>,
    interval_secs: u64,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        services.events.debug(category::SYSTEM, "Block template polling has been disabled");
        return None;
    }

    let period = Duration::from_secs(interval_secs);
    services.events.debug(
        category::SYSTEM,
        format!("Block polling setup for every {} milliseconds", period.as_millis()),
    );

    Some(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            // Each tick fetches on its own; a slow node must not delay the next tick
            let services = services.clone();
            let context = Arc::clone(&context);
            tokio::spawn(async move {
                if let Err(e) = refresh_template(&services, &context).await {
                    services.events.error(
                        category::SYSTEM,
                        format!("Block polling error getting block template for {}: {}", services.pool_name, e),
                    );
                }
            });
        }
    }))
}

/// Refresh on an external best-block notification unless it names the current tip
pub async fn on_block_notify(services: &PoolServices, context: &ChainContext, block_hash: &str) {
    if let Some(job) = services.job_manager.current_job().await {
        if job.previous_block_hash() == block_hash {
            return;
        }
    }

    match refresh_template(services, context).await {
        Ok(true) => services.events.debug(category::SYSTEM, format!("Block notification for {} produced a new job", block_hash)),
        Ok(false) => {}
        Err(e) => services.events.error(
            category::SYSTEM,
            format!("Block notify error getting block template for {}: {}", services.pool_name, e),
        ),
    }
}
