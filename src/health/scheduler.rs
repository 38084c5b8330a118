use chrono::Utc;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, warn};

use crate::config;
use crate::engine::GovernanceEngine;

/// key: health-scheduler -> timer-driven sweep
pub fn spawn(engine: GovernanceEngine) {
    let interval = TokioDuration::from_secs(*config::HEALTH_SWEEP_INTERVAL_SECS);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match engine.check_all_tenants_health(Utc::now()).await {
                Ok(report) if report.failed.is_empty() => {
                    debug!(processed = report.processed.len(), "health sweep completed");
                }
                Ok(report) => {
                    warn!(
                        processed = report.processed.len(),
                        failed = report.failed.len(),
                        "health sweep completed with failures"
                    );
                }
                Err(err) => warn!(?err, "health sweep tick failed"),
            }
        }
    });
}
