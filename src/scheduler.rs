use crate::directory::Directory;
use crate::services::SettlementService;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

/// Background task that runs the weekly commission settlement for every
/// tenant on a fixed tick.
///
/// Each tick settles the previous Monday-to-Monday week. Completed periods
/// are skipped by the settlement service, so ticking more often than weekly
/// only resumes an interrupted run.
pub struct SettlementScheduler {
    settlement: Arc<SettlementService>,
    directory: Arc<dyn Directory>,
    check_interval: Duration,
}

impl SettlementScheduler {
    pub fn new(settlement: Arc<SettlementService>, directory: Arc<dyn Directory>) -> Self {
        Self {
            settlement,
            directory,
            check_interval: Duration::from_secs(3600),
        }
    }

    /// Set check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Start the scheduler loop
    pub async fn start(self) {
        let mut interval = time::interval(self.check_interval);
        info!("Settlement scheduler started, checking every {:?}", self.check_interval);

        loop {
            interval.tick().await;
            self.run_once().await;
        }
    }

    /// One pass over all tenants
    pub async fn run_once(&self) {
        let tenants = match self.directory.tenant_ids().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!("Could not list tenants for settlement: {}", e);
                return;
            }
        };
        if tenants.is_empty() {
            warn!("Directory has no tenants, nothing to settle");
            return;
        }

        for tenant_id in tenants {
            match self.settlement.run_weekly_settlement(tenant_id).await {
                Ok(report) if report.failed > 0 => {
                    warn!(
                        %tenant_id,
                        failed = report.failed,
                        "Weekly settlement finished with failures; next tick retries them"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(%tenant_id, "Weekly settlement run failed: {}", e),
            }
        }
    }
}
