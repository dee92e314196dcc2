//! Durable job queue
//!
//! Jobs live in the `jobs` table until their body finishes. A runner leases
//! due jobs, so a runner that dies mid-batch leaves them to be claimed again
//! once the lease lapses. A job may carry a lock key: while a job with that
//! key is pending, enqueueing another one under the same key is a no-op.
//! Claiming releases the key before the job body runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::AppState;
use crate::data::{Database, JobRow, now_ms};
use crate::error::AppError;
use crate::metrics::JOBS_RUN;

/// Retries for a job whose body returned an error
const MAX_JOB_ATTEMPTS: i64 = 5;

/// How long a claimed job stays leased to one runner
const LEASE_MS: i64 = 5 * 60 * 1000;

/// Work scheduled for a background runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Apply an inbound activity whose HTTP layer was already verified
    ProcessInbound { activity: Value, signer_id: String },
    /// Fan a local status out to its audience
    Distribute { status_id: String },
    /// Fan the final state of a local poll out to followers and voters
    DistributePollUpdate { status_id: String },
    /// Run the expiry notifier for a poll
    PollExpirationNotify { poll_id: String },
    /// Re-fetch a remote actor document
    RemoteAccountRefresh { account_id: String },
    /// Fetch a remote followers partial collection and reconcile it
    FollowersSynchronization { account_id: String, url: String },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::ProcessInbound { .. } => "process_inbound",
            Job::Distribute { .. } => "distribute",
            Job::DistributePollUpdate { .. } => "distribute_poll_update",
            Job::PollExpirationNotify { .. } => "poll_expiration_notify",
            Job::RemoteAccountRefresh { .. } => "remote_account_refresh",
            Job::FollowersSynchronization { .. } => "followers_synchronization",
        }
    }
}

/// Lock key collapsing concurrent expiry schedules of one poll.
pub fn poll_expiration_lock(poll_id: &str) -> String {
    format!("poll_expiration_notify:{}", poll_id)
}

/// Producer side of the job table
pub struct JobQueue {
    db: Arc<Database>,
    wake: Notify,
}

impl JobQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            wake: Notify::new(),
        }
    }

    /// Enqueue a job to run as soon as a runner is free.
    pub async fn enqueue(&self, job: Job) -> Result<(), AppError> {
        self.insert(&job, now_ms(), None, 0).await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Enqueue a job for `run_at`. With a lock key the call is a no-op while
    /// another job under that key is pending; returns whether it was queued.
    pub async fn schedule(
        &self,
        job: Job,
        run_at: DateTime<Utc>,
        lock_key: Option<&str>,
    ) -> Result<bool, AppError> {
        let queued = self
            .insert(&job, run_at.timestamp_millis(), lock_key, 0)
            .await?;
        if queued {
            tracing::debug!(kind = job.kind(), %run_at, lock_key, "Job scheduled");
        } else {
            tracing::debug!(kind = job.kind(), lock_key, "Job already pending under lock");
        }
        Ok(queued)
    }

    async fn insert(
        &self,
        job: &Job,
        run_at_ms: i64,
        lock_key: Option<&str>,
        attempts: i64,
    ) -> Result<bool, AppError> {
        let payload = serde_json::to_string(job)?;
        self.db
            .enqueue_job(job.kind(), &payload, run_at_ms, lock_key, attempts)
            .await
    }

    /// Pending jobs of one kind, decoded.
    pub async fn pending(&self, kind: &str) -> Result<Vec<Job>, AppError> {
        let rows = self.db.get_pending_jobs(kind).await?;
        Ok(rows
            .iter()
            .filter_map(|row| serde_json::from_str(&row.payload).ok())
            .collect())
    }

    async fn claim(&self, limit: u32) -> Result<Vec<JobRow>, AppError> {
        let now = now_ms();
        self.db.claim_due_jobs(now, now + LEASE_MS, limit).await
    }

    async fn complete(&self, row: &JobRow) -> Result<(), AppError> {
        self.db.complete_job(&row.id).await
    }

    async fn retry(&self, row: &JobRow) -> Result<(), AppError> {
        let attempts = row.attempts + 1;
        if attempts >= MAX_JOB_ATTEMPTS {
            tracing::warn!(kind = %row.kind, id = %row.id, "Job exhausted its retries");
            return self.db.complete_job(&row.id).await;
        }
        let delay_ms = 1000 * (1_i64 << attempts.min(10));
        self.db.retry_job(&row.id, attempts, now_ms() + delay_ms).await
    }
}

/// Consumer side: claims due jobs and runs them against the application state
pub struct JobRunner {
    state: AppState,
}

impl JobRunner {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Claim and run one batch of due jobs. Returns how many were claimed.
    ///
    /// A job that cannot be completed or released stays leased and runs
    /// again after the lease lapses; the rest of the batch still runs.
    pub async fn run_once(&self) -> Result<usize, AppError> {
        let jobs = &self.state.jobs;
        let rows = jobs.claim(self.state.config.jobs.batch_size).await?;
        let claimed = rows.len();

        for row in rows {
            let job: Job = match serde_json::from_str(&row.payload) {
                Ok(job) => job,
                Err(error) => {
                    tracing::error!(kind = %row.kind, id = %row.id, %error, "Dropping undecodable job");
                    JOBS_RUN
                        .with_label_values(&[row.kind.as_str(), "invalid"])
                        .inc();
                    if let Err(error) = jobs.complete(&row).await {
                        tracing::error!(id = %row.id, %error, "Failed to drop job");
                    }
                    continue;
                }
            };

            let kind = job.kind();
            let settled = match perform(&self.state, job).await {
                Ok(()) => {
                    JOBS_RUN.with_label_values(&[kind, "success"]).inc();
                    jobs.complete(&row).await
                }
                Err(error) => {
                    tracing::warn!(kind, id = %row.id, %error, "Job failed");
                    JOBS_RUN.with_label_values(&[kind, "failure"]).inc();
                    jobs.retry(&row).await
                }
            };
            if let Err(error) = settled {
                tracing::error!(kind, id = %row.id, %error, "Job left leased");
            }
        }

        Ok(claimed)
    }

    /// Poll the queue until the task is aborted.
    pub async fn run(self) {
        let interval = Duration::from_millis(self.state.config.jobs.poll_interval_ms);
        loop {
            match self.run_once().await {
                Ok(claimed) if claimed > 0 => continue,
                Ok(_) => {}
                Err(error) => tracing::error!(%error, "Job runner iteration failed"),
            }
            tokio::select! {
                _ = self.state.jobs.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// Run one job body.
pub async fn perform(state: &AppState, job: Job) -> Result<(), AppError> {
    match job {
        Job::ProcessInbound {
            activity,
            signer_id,
        } => {
            let Some(signer) = state.db.get_actor(&signer_id).await? else {
                tracing::debug!(signer = %signer_id, "Signer vanished before processing");
                return Ok(());
            };
            state.processor.process_verified(activity, &signer).await
        }
        Job::Distribute { status_id } => state.distributor.distribute_status(&status_id).await,
        Job::DistributePollUpdate { status_id } => {
            state.distributor.distribute_poll_update(&status_id).await
        }
        Job::PollExpirationNotify { poll_id } => state.poll_notifier.perform(&poll_id).await,
        Job::RemoteAccountRefresh { account_id } => {
            let Some(actor) = state.db.get_actor(&account_id).await? else {
                return Ok(());
            };
            state.resolver.refresh(&actor).await.map(|_| ())
        }
        Job::FollowersSynchronization { account_id, url } => {
            state.collection_sync.synchronize(&account_id, &url).await
        }
    }
}
