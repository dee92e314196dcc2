//! Poll expiry notifications
//!
//! A poll's notifier job is scheduled for its end time plus a grace period.
//! When it runs early (the poll was extended) it re-schedules itself under
//! the poll's lock key; once the poll has ended it fans out exactly once.

use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::data::{Database, Poll};
use crate::error::AppError;
use crate::metrics::POLL_NOTIFICATIONS;
use crate::service::{Job, JobQueue, poll_expiration_lock};

pub struct PollExpirationNotifier {
    db: Arc<Database>,
    jobs: Arc<JobQueue>,
    grace: Duration,
}

impl PollExpirationNotifier {
    pub fn new(db: Arc<Database>, jobs: Arc<JobQueue>, grace: Duration) -> Self {
        Self { db, jobs, grace }
    }

    /// Schedule the notifier for the end of `poll`. Returns false when a run
    /// is already pending for this poll.
    pub async fn schedule(&self, poll: &Poll) -> Result<bool, AppError> {
        self.jobs
            .schedule(
                Job::PollExpirationNotify {
                    poll_id: poll.id.clone(),
                },
                poll.expires_at + self.grace,
                Some(&poll_expiration_lock(&poll.id)),
            )
            .await
    }

    pub async fn perform(&self, poll_id: &str) -> Result<(), AppError> {
        let Some(poll) = self.db.get_poll(poll_id).await? else {
            tracing::debug!(poll = poll_id, "Poll is gone, nothing to notify");
            return Ok(());
        };

        if !poll.is_expired_at(Utc::now()) {
            self.schedule(&poll).await?;
            return Ok(());
        }

        if !self.db.mark_poll_notified(&poll.id).await? {
            tracing::debug!(poll = poll_id, "Poll expiry already notified");
            return Ok(());
        }

        let Some(status) = self.db.get_status(&poll.status_id).await? else {
            return Ok(());
        };

        if status.local {
            self.jobs
                .enqueue(Job::DistributePollUpdate {
                    status_id: status.id.clone(),
                })
                .await?;
            if self
                .db
                .insert_notification(&poll.account_id, "Poll", &poll.id, "poll", None)
                .await?
            {
                POLL_NOTIFICATIONS.with_label_values(&["owner"]).inc();
            }
        }

        let mut notified = 0usize;
        for voter in self.db.get_poll_voters(&poll.id).await? {
            if !voter.is_local() || voter.id == poll.account_id {
                continue;
            }
            if self
                .db
                .insert_notification(&voter.id, "Poll", &poll.id, "poll", None)
                .await?
            {
                POLL_NOTIFICATIONS.with_label_values(&["voter"]).inc();
                notified += 1;
            }
        }

        tracing::info!(poll = poll_id, local = status.local, voters = notified, "Poll ended");
        Ok(())
    }
}
