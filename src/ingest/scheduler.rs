// src/ingest/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ingest::types::CachePolicy;
use crate::ingest::Pipeline;
use crate::remedy::RemedyPoller;

/// Periodic refresh driver. The pipeline's own run gate absorbs overlap, so
/// a tick that lands while the previous refresh is still running is simply
/// skipped.
pub fn spawn_refresh_scheduler(pipeline: Arc<Pipeline>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match pipeline.run_refresh(CachePolicy::LiveThenCache).await {
                Ok(summary) => tracing::info!(
                    target: "ingest",
                    new = summary.new,
                    updated = summary.updated,
                    total = summary.total,
                    alerts = summary.alerts_created,
                    "refresh tick"
                ),
                Err(e) => tracing::warn!(target: "ingest", error = %e, "refresh tick skipped"),
            }
        }
    })
}

pub fn spawn_remedy_scheduler(poller: Arc<RemedyPoller>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let summary = poller.run_once(chrono::Utc::now()).await;
            tracing::info!(
                target: "remedy",
                checked = summary.checked,
                updated = summary.updated,
                alerts = summary.alerts_created,
                "remedy poll tick"
            );
        }
    })
}
