//! Periodic check trigger: a cron job plus a random delay before each run.
//!
//! The cron expression can be replaced at runtime; the old job is removed
//! only after the new one has been accepted.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::providers::SharedRng;
use crate::watcher::{LinkWatcher, Trigger};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {0:?}")]
    InvalidCron(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

pub fn jitter_delay(rng: &SharedRng, max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::ZERO;
    }
    match rng.lock() {
        Ok(mut rng) => Duration::from_millis(rng.gen_range(0..max_secs * 1000)),
        Err(_) => Duration::ZERO,
    }
}

struct ActiveJob {
    id: Uuid,
    cron: String,
}

pub struct CheckScheduler {
    sched: JobScheduler,
    watcher: Arc<LinkWatcher>,
    jitter_secs: u64,
    rng: SharedRng,
    cancel: CancellationToken,
    active: Mutex<ActiveJob>,
}

impl CheckScheduler {
    pub async fn start(
        watcher: Arc<LinkWatcher>,
        cron: &str,
        jitter_secs: u64,
        rng: SharedRng,
        cancel: CancellationToken,
    ) -> Result<Self, ScheduleError> {
        let sched = JobScheduler::new()
            .await
            .map_err(|e| ScheduleError::Scheduler(format!("{:?}", e)))?;

        let job = build_job(cron, watcher.clone(), jitter_secs, rng.clone(), cancel.clone())?;
        let id = sched
            .add(job)
            .await
            .map_err(|e| ScheduleError::Scheduler(format!("{:?}", e)))?;
        sched
            .start()
            .await
            .map_err(|e| ScheduleError::Scheduler(format!("{:?}", e)))?;

        info!("⏰ Periodic checks scheduled: '{}' (+0..{}s jitter)", cron, jitter_secs);
        Ok(Self {
            sched,
            watcher,
            jitter_secs,
            rng,
            cancel,
            active: Mutex::new(ActiveJob {
                id,
                cron: cron.to_string(),
            }),
        })
    }

    pub async fn cron(&self) -> String {
        self.active.lock().await.cron.clone()
    }

    pub fn jitter_secs(&self) -> u64 {
        self.jitter_secs
    }

    /// Swap in a new cron expression. An invalid one leaves the current
    /// schedule untouched.
    pub async fn reschedule(&self, cron: &str) -> Result<(), ScheduleError> {
        let cron = cron.trim();
        let job = build_job(
            cron,
            self.watcher.clone(),
            self.jitter_secs,
            self.rng.clone(),
            self.cancel.clone(),
        )?;

        let mut active = self.active.lock().await;
        let id = self
            .sched
            .add(job)
            .await
            .map_err(|e| ScheduleError::Scheduler(format!("{:?}", e)))?;
        if let Err(e) = self.sched.remove(&active.id).await {
            warn!("Failed to remove previous check job: {:?}", e);
        }
        info!("⏰ Check schedule changed: '{}' -> '{}'", active.cron, cron);
        *active = ActiveJob {
            id,
            cron: cron.to_string(),
        };
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut sched = self.sched.clone();
        if let Err(e) = sched.shutdown().await {
            warn!("Scheduler shutdown failed: {:?}", e);
        }
    }
}

fn build_job(
    cron: &str,
    watcher: Arc<LinkWatcher>,
    jitter_secs: u64,
    rng: SharedRng,
    cancel: CancellationToken,
) -> Result<Job, ScheduleError> {
    Job::new_async(cron, move |_id, _sched| {
        let watcher = watcher.clone();
        let rng = rng.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            let delay = jitter_delay(&rng, jitter_secs);
            debug!("Scheduled check starts in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            watcher.check(Trigger::Scheduled).await;
        })
    })
    .map_err(|_| ScheduleError::InvalidCron(cron.to_string()))
}
