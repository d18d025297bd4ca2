//! Cron-driven trigger source.
//!
//! The scheduler owns one timer task per enabled job. `refresh()` is the
//! sole mutation entry point: it atomically rebuilds the full timer set
//! from current job state, so stale schedules never fire and edits take
//! effect without a restart. Fired triggers are sent over a channel; the
//! service consumes them and submits pipelines to the queue.

use crate::jobs::JobStore;
use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cron timer owner. Rebuilt wholesale on every job mutation.
pub struct Scheduler {
    jobs: Arc<JobStore>,
    trigger_tx: mpsc::UnboundedSender<Uuid>,
    timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler over the job store. Returns the receiver side
    /// of the trigger channel; each fired job id appears there once per
    /// occurrence.
    pub fn new(jobs: Arc<JobStore>) -> (Arc<Self>, mpsc::UnboundedReceiver<Uuid>) {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            jobs,
            trigger_tx,
            timers: Mutex::new(HashMap::new()),
        });
        (scheduler, trigger_rx)
    }

    /// Atomically rebuild every timer from current job state. Called
    /// after each job create/update/delete. An invalid cron expression on
    /// one job is logged and skips only that job.
    pub fn refresh(&self) {
        let mut timers = self.timers.lock();
        for (_, handle) in timers.drain() {
            handle.abort();
        }

        let mut scheduled = 0usize;
        for job in self.jobs.list() {
            if !job.enabled {
                continue;
            }
            let schedule = match Schedule::from_str(&normalize_cron(&job.cron)) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(job = %job.name, cron = %job.cron, "invalid cron expression: {}", e);
                    continue;
                }
            };
            let handle = self.spawn_timer(job.id, job.name.clone(), schedule);
            timers.insert(job.id, handle);
            scheduled += 1;
        }
        info!(scheduled, "scheduler refreshed");
    }

    /// Drop every timer (engine shutdown)
    pub fn clear(&self) {
        let mut timers = self.timers.lock();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Number of active timers
    pub fn active_timers(&self) -> usize {
        self.timers.lock().len()
    }

    fn spawn_timer(&self, job_id: Uuid, job_name: String, schedule: Schedule) -> JoinHandle<()> {
        let trigger_tx = self.trigger_tx.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    debug!(job = %job_name, "schedule has no future occurrences");
                    break;
                };
                let delay = next - Utc::now();
                if let Ok(delay) = delay.to_std() {
                    tokio::time::sleep(delay).await;
                }
                debug!(job = %job_name, "cron fired");
                if trigger_tx.send(job_id).is_err() {
                    break;
                }
            }
        })
    }
}

/// Accept classic 5-field crontab expressions by pinning seconds to 0
pub(crate) fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CompressionMode;
    use crate::jobs::JobSpec;
    use crate::retention::RetentionPolicy;
    use std::time::Duration;

    fn spec(name: &str, cron: &str, enabled: bool) -> JobSpec {
        JobSpec {
            name: name.into(),
            cron: cron.into(),
            source_id: Uuid::new_v4(),
            destination_id: Uuid::new_v4(),
            encryption_profile_id: None,
            compression: CompressionMode::None,
            retention: RetentionPolicy::None,
            notification_ids: vec![],
            enabled,
        }
    }

    #[test]
    fn test_normalize_accepts_classic_crontab() {
        assert_eq!(normalize_cron("0 3 * * *"), "0 0 3 * * *");
        assert_eq!(normalize_cron("*/5 * * * * *"), "*/5 * * * * *");
    }

    #[tokio::test]
    async fn test_invalid_cron_skips_only_that_job() {
        let jobs = Arc::new(JobStore::new());
        jobs.insert(spec("broken", "not a cron", true));
        jobs.insert(spec("valid", "0 0 3 * * *", true));
        jobs.insert(spec("disabled", "0 0 3 * * *", false));

        let (scheduler, _trigger_rx) = Scheduler::new(Arc::clone(&jobs));
        scheduler.refresh();
        assert_eq!(scheduler.active_timers(), 1);
        scheduler.clear();
    }

    #[tokio::test]
    async fn test_refresh_drops_stale_timers_and_fires_new_ones() {
        let jobs = Arc::new(JobStore::new());
        let every_second = jobs.insert(spec("fast", "* * * * * *", true));

        let (scheduler, mut trigger_rx) = Scheduler::new(Arc::clone(&jobs));
        scheduler.refresh();

        let fired = tokio::time::timeout(Duration::from_secs(3), trigger_rx.recv())
            .await
            .expect("timer should fire within the window")
            .unwrap();
        assert_eq!(fired, every_second.id);

        // removing the job and refreshing must stop the timer
        jobs.remove(every_second.id);
        scheduler.refresh();
        assert_eq!(scheduler.active_timers(), 0);
    }
}
