use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::model::RequestStatus;
use crate::service::MixerService;
use crate::store::Store;

#[derive(Debug, Default)]
pub struct MonitorReport {
    pub warned: Vec<String>,
    /// Requests that became withdrawable in this scan.
    pub refund_eligible: Vec<String>,
}

/// Watches in-flight requests against their deadlines.
pub struct DisputeMonitor {
    store: Arc<dyn Store>,
    service: Arc<MixerService>,
    clock: Arc<dyn Clock>,
    early_warning: chrono::Duration,
    poll: Duration,
}

impl DisputeMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        service: Arc<MixerService>,
        clock: Arc<dyn Clock>,
        early_warning: chrono::Duration,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            service,
            clock,
            early_warning,
            poll,
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll);
        info!("Deadline monitor started (poll {:?})", self.poll);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.scan().await {
                        Ok(report) if !report.refund_eligible.is_empty() => {
                            warn!("{} request(s) now withdrawable", report.refund_eligible.len())
                        }
                        Ok(_) => {}
                        Err(e) => error!("Deadline scan failed: {}", e),
                    }
                }
                _ = token.cancelled() => {
                    warn!("Deadline monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Each overdue request is reported exactly once: flagging it moves it
    /// out of the scanned statuses.
    pub async fn scan(&self) -> Result<MonitorReport> {
        let now = self.clock.now();
        let mut report = MonitorReport::default();

        let in_flight = self
            .store
            .list_requests_by_status(&[RequestStatus::Deposited, RequestStatus::Mixing])
            .await?;

        for request in in_flight {
            if request.is_past_deadline(now) {
                if self.service.mark_refund_eligible(&request.id).await? {
                    report.refund_eligible.push(request.id);
                }
                continue;
            }

            if request.deadline - now <= self.early_warning && !request.early_warning_logged {
                warn!(
                    "Request {} ({}) is {} minutes from its deadline with {} target(s) undelivered",
                    request.id,
                    request.status,
                    (request.deadline - now).num_minutes(),
                    request.undelivered_count()
                );
                self.service.note_early_warning(&request.id).await?;
                report.warned.push(request.id);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[tokio::test]
    async fn test_overdue_request_reported_once() {
        let h = Harness::new().await;
        let request = h.mixing_request("1000", &[("target-a", "995")]).await;

        let report = h.monitor.scan().await.unwrap();
        assert!(report.refund_eligible.is_empty());
        assert!(report.warned.is_empty());

        // inside the warning window
        h.clock.set(request.deadline - chrono::Duration::hours(2));
        let report = h.monitor.scan().await.unwrap();
        assert_eq!(report.warned, vec![request.id.clone()]);
        assert!(h.monitor.scan().await.unwrap().warned.is_empty());

        h.clock.set(request.deadline);
        let report = h.monitor.scan().await.unwrap();
        assert_eq!(report.refund_eligible, vec![request.id.clone()]);
        assert!(h.monitor.scan().await.unwrap().refund_eligible.is_empty());

        let stored = h.store.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Withdrawable);
    }

    #[tokio::test]
    async fn test_pending_requests_are_ignored() {
        let h = Harness::new().await;
        let request = h
            .service
            .create_mix_request(crate::testing::ACCOUNT, crate::testing::create_body("1000", &[("a", "995")]))
            .await
            .unwrap();
        h.clock.set(request.deadline + chrono::Duration::days(1));
        assert!(h.monitor.scan().await.unwrap().refund_eligible.is_empty());
    }
}
