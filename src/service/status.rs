//! Status service
//!
//! Local status operations: publish (with mentions and an optional poll),
//! reblog, delete and voting. Fan-out runs later on the job queue.

use chrono::{Duration, Utc};
use std::sync::Arc;

use super::jobs::{Job, JobQueue};
use crate::data::{Actor, Database, EntityId, Poll, Status, Visibility};
use crate::error::AppError;
use crate::federation::tag_manager::PUBLIC_COLLECTION;
use crate::federation::{Distributor, KeyResolver, PollExpirationNotifier, TagManager, builder};

const MAX_POLL_OPTIONS: usize = 4;
const MIN_POLL_DURATION_SECS: i64 = 300;

/// Poll attached to a new status
#[derive(Debug, Clone)]
pub struct NewPoll {
    pub options: Vec<String>,
    pub expires_in_secs: i64,
}

/// Input for [`StatusService::publish`]
#[derive(Debug, Clone)]
pub struct NewStatus {
    pub content: String,
    pub visibility: Visibility,
    pub in_reply_to_uri: Option<String>,
    /// Actor URIs to mention
    pub mentions: Vec<String>,
    pub poll: Option<NewPoll>,
}

/// Status service
pub struct StatusService {
    db: Arc<Database>,
    tags: Arc<TagManager>,
    resolver: Arc<KeyResolver>,
    jobs: Arc<JobQueue>,
    distributor: Arc<Distributor>,
    poll_notifier: Arc<PollExpirationNotifier>,
}

impl StatusService {
    pub fn new(
        db: Arc<Database>,
        tags: Arc<TagManager>,
        resolver: Arc<KeyResolver>,
        jobs: Arc<JobQueue>,
        distributor: Arc<Distributor>,
        poll_notifier: Arc<PollExpirationNotifier>,
    ) -> Self {
        Self {
            db,
            tags,
            resolver,
            jobs,
            distributor,
            poll_notifier,
        }
    }

    /// Publish a status as `author_id`.
    ///
    /// # Side Effects
    /// - Inserts the status, its mentions and poll
    /// - Schedules the poll expiry notifier
    /// - Enqueues distribution to the audience
    pub async fn publish(&self, author_id: &str, input: NewStatus) -> Result<Status, AppError> {
        let author = self.local_account(author_id).await?;

        let content = input.content.trim().to_string();
        if content.is_empty() {
            return Err(AppError::Validation("status content is required".to_string()));
        }
        if let Some(poll) = &input.poll {
            validate_poll(poll)?;
        }

        let mut mentioned: Vec<Actor> = Vec::new();
        for uri in &input.mentions {
            let actor = self.resolver.resolve(uri).await?;
            if !mentioned.iter().any(|m| m.id == actor.id) {
                mentioned.push(actor);
            }
        }

        let id = EntityId::new().0;
        let now = Utc::now();
        let status = Status {
            uri: self.tags.status_uri(&author.username, &id),
            id,
            account_id: author.id.clone(),
            visibility: input.visibility.as_str().to_string(),
            content,
            reblog_of_id: None,
            in_reply_to_uri: input.in_reply_to_uri,
            local: true,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_status(&status).await?;
        let mention_ids: Vec<String> = mentioned.iter().map(|m| m.id.clone()).collect();
        self.db.insert_mentions(&status.id, &mention_ids).await?;

        if let Some(new_poll) = input.poll {
            let poll = Poll {
                id: EntityId::new().0,
                status_id: status.id.clone(),
                account_id: author.id.clone(),
                options: serde_json::to_string(&new_poll.options)?,
                expires_at: now + Duration::seconds(new_poll.expires_in_secs),
                notified_at: None,
                created_at: now,
                updated_at: now,
            };
            self.db.insert_poll(&poll).await?;
            self.poll_notifier.schedule(&poll).await?;
        }

        self.jobs
            .enqueue(Job::Distribute {
                status_id: status.id.clone(),
            })
            .await?;
        tracing::info!(status = %status.uri, visibility = %status.visibility, "Status published");
        Ok(status)
    }

    /// Reblog a status. Reblogging a reblog reblogs its original; reblogging
    /// twice returns the existing reblog.
    pub async fn reblog(&self, account_id: &str, status_id: &str) -> Result<Status, AppError> {
        let account = self.local_account(account_id).await?;
        let mut original = self.db.get_status(status_id).await?.ok_or(AppError::NotFound)?;
        if let Some(root_id) = original.reblog_of_id.clone() {
            original = self.db.get_status(&root_id).await?.ok_or(AppError::NotFound)?;
        }
        if !matches!(original.visibility(), Visibility::Public | Visibility::Unlisted) {
            return Err(AppError::Validation(
                "only public or unlisted statuses can be reblogged".to_string(),
            ));
        }
        if let Some(existing) = self.db.get_reblog(&account.id, &original.id).await? {
            return Ok(existing);
        }

        let id = EntityId::new().0;
        let now = Utc::now();
        let reblog = Status {
            uri: self.tags.status_uri(&account.username, &id),
            id,
            account_id: account.id.clone(),
            visibility: Visibility::Public.as_str().to_string(),
            content: String::new(),
            reblog_of_id: Some(original.id.clone()),
            in_reply_to_uri: None,
            local: true,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_status(&reblog).await?;
        self.jobs
            .enqueue(Job::Distribute {
                status_id: reblog.id.clone(),
            })
            .await?;
        tracing::info!(status = %original.uri, by = %account.uri, "Status reblogged");
        Ok(reblog)
    }

    /// Delete a local status and send a Delete to the author's followers.
    pub async fn delete(&self, account_id: &str, status_id: &str) -> Result<(), AppError> {
        let account = self.local_account(account_id).await?;
        let status = self.db.get_status(status_id).await?.ok_or(AppError::NotFound)?;
        if status.account_id != account.id {
            return Err(AppError::Forbidden);
        }

        self.db.delete_status(&status.id).await?;
        let activity = builder::delete(
            &format!("{}#delete", status.uri),
            &account.uri,
            &status.uri,
            &[PUBLIC_COLLECTION.to_string()],
        );
        let queued = self.distributor.deliver_to_followers(&account, &activity).await?;
        tracing::info!(status = %status.uri, inboxes = queued, "Status deleted");
        Ok(())
    }

    /// Vote on a poll. Votes on remote polls are sent to the poll's author.
    pub async fn vote(&self, account_id: &str, poll_id: &str, choice: usize) -> Result<(), AppError> {
        let account = self.local_account(account_id).await?;
        let poll = self.db.get_poll(poll_id).await?.ok_or(AppError::NotFound)?;
        if poll.is_expired_at(Utc::now()) {
            return Err(AppError::Validation("poll has ended".to_string()));
        }
        if poll.account_id == account.id {
            return Err(AppError::Validation("cannot vote on own poll".to_string()));
        }
        let titles = poll.option_titles();
        let title = titles
            .get(choice)
            .ok_or_else(|| AppError::Validation(format!("no poll option {}", choice)))?;

        let vote_uri = format!("{}#votes/{}", account.uri, EntityId::new().0);
        if !self
            .db
            .insert_poll_vote(&poll.id, &account.id, choice as i64, Some(&vote_uri))
            .await?
        {
            return Ok(());
        }

        let owner = self.db.get_actor(&poll.account_id).await?.ok_or(AppError::NotFound)?;
        if !owner.is_local() {
            let question = self.db.get_status(&poll.status_id).await?.ok_or(AppError::NotFound)?;
            let activity = builder::vote(&vote_uri, &account, &question.uri, &owner.uri, title);
            self.distributor
                .deliver_to_inbox(&account, &activity, &owner.inbox_url)
                .await?;
        }
        Ok(())
    }

    async fn local_account(&self, account_id: &str) -> Result<Actor, AppError> {
        match self.db.get_actor(account_id).await? {
            Some(actor) if actor.can_sign() => Ok(actor),
            _ => Err(AppError::NotFound),
        }
    }
}

fn validate_poll(poll: &NewPoll) -> Result<(), AppError> {
    if poll.options.len() < 2 || poll.options.len() > MAX_POLL_OPTIONS {
        return Err(AppError::Validation(format!(
            "a poll needs between 2 and {} options",
            MAX_POLL_OPTIONS
        )));
    }
    if poll.options.iter().any(|option| option.trim().is_empty()) {
        return Err(AppError::Validation("poll options cannot be empty".to_string()));
    }
    if poll.expires_in_secs < MIN_POLL_DURATION_SECS {
        return Err(AppError::Validation(format!(
            "polls must run for at least {} seconds",
            MIN_POLL_DURATION_SECS
        )));
    }
    Ok(())
}
