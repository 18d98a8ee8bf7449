use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use super::jobs::ReconciliationJobs;
use crate::config::JobIntervals;
use crate::error::AppResult;

/// Outcome counters for one job
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatus {
    pub runs: u64,
    pub failures: u64,
    pub last_result: Option<usize>,
    pub last_error: Option<String>,
    pub last_finished: Option<DateTime<Utc>>,
}

/// Shared run statistics, read by the HTTP surface
#[derive(Debug, Default)]
pub struct JobStats {
    jobs: Mutex<BTreeMap<&'static str, JobStatus>>,
}

impl JobStats {
    pub fn record(&self, job: &'static str, result: &AppResult<usize>) {
        let mut jobs = self.jobs.lock();
        let status = jobs.entry(job).or_default();
        status.runs += 1;
        status.last_finished = Some(Utc::now());
        match result {
            Ok(n) => status.last_result = Some(*n),
            Err(e) => {
                status.failures += 1;
                status.last_error = Some(e.to_string());
            }
        }
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, JobStatus> {
        self.jobs.lock().clone()
    }
}

/// Runs every reconciliation job on its own interval. Each tick spawns a
/// fresh run, so a slow run never delays the next one.
pub struct ReconciliationScheduler {
    jobs: Arc<ReconciliationJobs>,
    intervals: JobIntervals,
    stats: Arc<JobStats>,
}

impl ReconciliationScheduler {
    pub fn new(jobs: Arc<ReconciliationJobs>, intervals: JobIntervals, stats: Arc<JobStats>) -> Self {
        Self {
            jobs,
            intervals,
            stats,
        }
    }

    /// Start all jobs in the background
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let i = &self.intervals;
        let handles = vec![
            self.schedule("index_blockchain_events", i.index_blockchain_events_secs, |jobs| async move {
                jobs.index_blockchain_events().await
            }),
            self.schedule("retry_stale_user_operations", i.retry_stale_user_operations_secs, |jobs| async move {
                jobs.retry_stale_user_operations().await
            }),
            self.schedule("receive_address_validity", i.receive_address_validity_secs, |jobs| async move {
                jobs.handle_receive_address_validity().await
            }),
            self.schedule("compute_market_rate", i.compute_market_rate_secs, |jobs| async move {
                jobs.compute_market_rate().await
            }),
            self.schedule("process_bucket_queues", i.process_bucket_queues_secs, |jobs| async move {
                jobs.process_bucket_queues().await
            }),
            self.schedule("retry_failed_webhooks", i.retry_failed_webhooks_secs, |jobs| async move {
                jobs.retry_failed_webhooks().await
            }),
            self.schedule("reassign_pending_orders", i.reassign_pending_orders_secs, |jobs| async move {
                jobs.reassign_pending_orders().await
            }),
        ];
        info!("⏰ Reconciliation scheduler started with {} jobs", handles.len());
        handles
    }

    fn schedule<F, Fut>(&self, name: &'static str, every_secs: u64, job: F) -> JoinHandle<()>
    where
        F: Fn(Arc<ReconciliationJobs>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<usize>> + Send + 'static,
    {
        let jobs = self.jobs.clone();
        let stats = self.stats.clone();
        let job = Arc::new(job);

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(every_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                let run = job(jobs.clone());
                let stats = stats.clone();
                tokio::spawn(async move {
                    let result = run.await;
                    match &result {
                        Ok(n) => debug!("Job {} finished ({})", name, n),
                        Err(e) => error!("❌ Job {} failed: {}", name, e),
                    }
                    stats.record(name, &result);
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::reconciliation::jobs::tests::setup;

    #[test]
    fn test_stats_track_failures() {
        let stats = JobStats::default();
        stats.record("compute_market_rate", &Ok(2));
        stats.record("compute_market_rate", &Err(AppError::ExternalError("ticker down".into())));

        let snapshot = stats.snapshot();
        let status = &snapshot["compute_market_rate"];
        assert_eq!(status.runs, 2);
        assert_eq!(status.failures, 1);
        assert_eq!(status.last_result, Some(2));
        assert!(status.last_error.as_deref().unwrap().contains("ticker down"));
    }

    #[tokio::test]
    async fn test_scheduler_runs_every_job_on_start() {
        let s = setup();
        let stats = Arc::new(JobStats::default());
        let scheduler = ReconciliationScheduler::new(Arc::new(s.jobs), JobIntervals::default(), stats.clone());

        let handles = scheduler.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        for handle in &handles {
            handle.abort();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), 7);
        for (name, status) in snapshot {
            assert_eq!(status.runs, 1, "{} should have run once", name);
            assert_eq!(status.failures, 0, "{} failed: {:?}", name, status.last_error);
        }
    }
}
