//! Outbound distribution
//!
//! Turns a local status or activity into delivery tasks, one per unique
//! destination inbox. Planning is pure ([`plan_status_delivery`]); the
//! [`Distributor`] loads the inputs, builds the activity JSON and enqueues
//! the tasks. Nothing here talks to the network.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;

use super::builder;
use super::ld_signature;
use super::tag_manager::{StatusAudience, TagManager};
use crate::data::{Actor, Database, DeliveryTask, EntityId, Status, Visibility, now_ms};
use crate::error::AppError;
use crate::metrics::DELIVERIES_PLANNED;

/// One destination chosen by planning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxTarget {
    pub inbox_url: String,
    /// Attach a Collection-Synchronization header for the sender's followers
    pub synchronize_followers: bool,
}

/// Everything planning needs to know about a status's recipients
#[derive(Debug, Clone, Copy)]
pub struct DeliveryInputs<'a> {
    pub audience: StatusAudience<'a>,
    /// Followers of the author, local ones included
    pub followers: &'a [Actor],
    /// Followers of mentioned Group actors
    pub group_followers: &'a [Actor],
    pub unreachable: &'a HashSet<String>,
}

/// Accumulates inbox targets, one per URL in first-seen order
struct InboxSet<'a> {
    unreachable: &'a HashSet<String>,
    seen: HashSet<String>,
    targets: Vec<InboxTarget>,
}

impl<'a> InboxSet<'a> {
    fn new(unreachable: &'a HashSet<String>) -> Self {
        Self {
            unreachable,
            seen: HashSet::new(),
            targets: Vec::new(),
        }
    }

    fn add(&mut self, actor: &Actor, synchronize_followers: bool) {
        if actor.is_local() || actor.suspended_at.is_some() {
            return;
        }
        self.add_url(actor.preferred_inbox_url(), synchronize_followers);
    }

    fn add_url(&mut self, inbox_url: &str, synchronize_followers: bool) {
        if inbox_url.is_empty() || self.unreachable.contains(inbox_url) {
            return;
        }
        if self.seen.insert(inbox_url.to_string()) {
            self.targets.push(InboxTarget {
                inbox_url: inbox_url.to_string(),
                synchronize_followers,
            });
        } else if synchronize_followers {
            if let Some(existing) = self
                .targets
                .iter_mut()
                .find(|target| target.inbox_url == inbox_url)
            {
                existing.synchronize_followers = true;
            }
        }
    }

    fn into_targets(self) -> Vec<InboxTarget> {
        self.targets
    }
}

/// Compute the unique destination inboxes of a status.
///
/// - public: followers plus mentioned accounts
/// - unlisted, private: followers
/// - direct: mentioned accounts, plus the followers of mentioned groups
///
/// A silenced author's non-direct status shrinks to the mentioned accounts
/// that follow them or asked to. The author of a reblogged status is always
/// included. Local, suspended and unreachable recipients are skipped.
pub fn plan_status_delivery(inputs: &DeliveryInputs<'_>) -> Vec<InboxTarget> {
    let audience = &inputs.audience;
    let visibility = audience.status.visibility();
    let synchronize = visibility == Visibility::Private;
    let mut inboxes = InboxSet::new(inputs.unreachable);

    match visibility {
        Visibility::Direct => {
            for mentioned in audience.reachable_mentions() {
                inboxes.add(mentioned, false);
            }
            for follower in inputs.group_followers {
                inboxes.add(follower, false);
            }
        }
        _ if audience.author.silenced => {
            for mentioned in audience.reachable_mentions() {
                inboxes.add(mentioned, synchronize);
            }
        }
        Visibility::Public => {
            for follower in inputs.followers {
                inboxes.add(follower, false);
            }
            for mentioned in audience.reachable_mentions() {
                inboxes.add(mentioned, false);
            }
        }
        Visibility::Unlisted | Visibility::Private => {
            for follower in inputs.followers {
                inboxes.add(follower, synchronize && follower.shared_inbox_url.is_some());
            }
        }
    }

    if let Some(original_author) = audience.reblogged_author {
        inboxes.add(original_author, false);
    }

    inboxes.into_targets()
}

/// Unique inboxes of a list of recipients.
pub fn plan_recipients(recipients: &[Actor], unreachable: &HashSet<String>) -> Vec<InboxTarget> {
    let mut inboxes = InboxSet::new(unreachable);
    for recipient in recipients {
        inboxes.add(recipient, false);
    }
    inboxes.into_targets()
}

pub struct Distributor {
    db: Arc<Database>,
    tags: Arc<TagManager>,
    delivery_wake: Arc<Notify>,
    unreachable_retry: chrono::Duration,
}

impl Distributor {
    pub fn new(db: Arc<Database>, tags: Arc<TagManager>, delivery_wake: Arc<Notify>) -> Self {
        Self {
            db,
            tags,
            delivery_wake,
            unreachable_retry: chrono::Duration::days(7),
        }
    }

    /// How long an unreachable inbox is skipped before it is tried again.
    pub fn with_unreachable_retry(mut self, window: chrono::Duration) -> Self {
        self.unreachable_retry = window;
        self
    }

    async fn unreachable_inboxes(&self) -> Result<HashSet<String>, AppError> {
        self.db
            .get_unreachable_inboxes(Utc::now() - self.unreachable_retry)
            .await
    }

    /// Fan a local status out to its audience. Remote statuses are ignored.
    pub async fn distribute_status(&self, status_id: &str) -> Result<(), AppError> {
        let Some(status) = self.db.get_status(status_id).await? else {
            tracing::debug!(status_id, "Status vanished before distribution");
            return Ok(());
        };
        let Some(author) = self.db.get_actor(&status.account_id).await? else {
            return Ok(());
        };
        if !status.local || !author.can_sign() {
            tracing::debug!(status = %status.uri, "Not distributing a remote status");
            return Ok(());
        }

        let reblogged = match &status.reblog_of_id {
            Some(id) => self.db.get_status(id).await?,
            None => None,
        };
        let reblogged_author = match &reblogged {
            Some(original) => self.db.get_actor(&original.account_id).await?,
            None => None,
        };

        let mentions = self.db.get_mentioned_actors(&status.id).await?;
        let followers = self.db.get_followers(&author.id).await?;
        let author_reach = self.author_reach(&author).await?;

        let mut group_followers = Vec::new();
        if status.visibility() == Visibility::Direct {
            for group in mentions.iter().filter(|m| m.is_group()) {
                group_followers.extend(self.db.get_followers(&group.id).await?);
            }
        }

        let unreachable = self.unreachable_inboxes().await?;
        let audience = StatusAudience {
            status: &status,
            author: &author,
            mentions: &mentions,
            reblogged_author: reblogged_author.as_ref(),
            author_reach: &author_reach,
        };
        let mut targets = plan_status_delivery(&DeliveryInputs {
            audience,
            followers: &followers,
            group_followers: &group_followers,
            unreachable: &unreachable,
        });

        let to = self.tags.to(&audience);
        let cc = self.tags.cc(&audience);
        let mut activity = match (&reblogged, &status.reblog_of_id) {
            (Some(original), Some(_)) => builder::announce(
                &self.tags.activity_uri_for(&status.uri),
                &author.uri,
                &original.uri,
                status.created_at,
                &to,
                &cc,
            ),
            (None, Some(_)) => {
                tracing::debug!(status = %status.uri, "Reblogged status is gone");
                return Ok(());
            }
            _ => {
                let poll = self.db.get_poll_by_status(&status.id).await?;
                let votes = match &poll {
                    Some(poll) => self.db.count_poll_votes(poll).await?,
                    None => Vec::new(),
                };
                let object = builder::status_object(
                    &status,
                    &author,
                    &mentions,
                    poll.as_ref().map(|p| (p, votes.as_slice())),
                    &to,
                    &cc,
                );
                builder::create(
                    &self.tags.activity_uri_for(&status.uri),
                    &author.uri,
                    object,
                    &to,
                    &cc,
                )
            }
        };

        if relays_apply(&status) {
            let relays = self
                .db
                .get_relays_in_state(crate::data::RelayState::Accepted)
                .await?;
            if !relays.is_empty() {
                activity = ld_signature::sign(&activity, &author)?;
                let mut inboxes = InboxSet::new(&unreachable);
                for target in targets.drain(..) {
                    inboxes.add_url(&target.inbox_url, target.synchronize_followers);
                }
                for relay in &relays {
                    inboxes.add_url(&relay.inbox_url, false);
                }
                targets = inboxes.into_targets();
            }
        }

        let queued = self.enqueue(&author, &activity, &targets).await?;
        tracing::info!(
            status = %status.uri,
            visibility = status.visibility().as_str(),
            inboxes = queued,
            "Status distributed"
        );
        Ok(())
    }

    /// Fan the current state of a local poll out to followers and remote voters.
    pub async fn distribute_poll_update(&self, status_id: &str) -> Result<(), AppError> {
        let Some(status) = self.db.get_status(status_id).await? else {
            return Ok(());
        };
        let Some(poll) = self.db.get_poll_by_status(&status.id).await? else {
            return Ok(());
        };
        let Some(author) = self.db.get_actor(&status.account_id).await? else {
            return Ok(());
        };
        if !author.can_sign() {
            return Ok(());
        }

        let mentions = self.db.get_mentioned_actors(&status.id).await?;
        let author_reach = self.author_reach(&author).await?;
        let audience = StatusAudience {
            status: &status,
            author: &author,
            mentions: &mentions,
            reblogged_author: None,
            author_reach: &author_reach,
        };
        let to = self.tags.to(&audience);
        let cc = self.tags.cc(&audience);
        let votes = self.db.count_poll_votes(&poll).await?;
        let object = builder::status_object(
            &status,
            &author,
            &mentions,
            Some((&poll, votes.as_slice())),
            &to,
            &cc,
        );
        let activity = builder::update(
            &format!("{}#updates/{}", status.uri, Utc::now().timestamp()),
            &author.uri,
            object,
            &to,
            &cc,
        );

        let mut recipients = self.db.get_followers(&author.id).await?;
        recipients.extend(self.db.get_poll_voters(&poll.id).await?);
        let unreachable = self.unreachable_inboxes().await?;
        let targets = plan_recipients(&recipients, &unreachable);

        let queued = self.enqueue(&author, &activity, &targets).await?;
        tracing::info!(status = %status.uri, inboxes = queued, "Poll update distributed");
        Ok(())
    }

    /// Queue an activity for one inbox.
    pub async fn deliver_to_inbox(
        &self,
        sender: &Actor,
        activity: &Value,
        inbox_url: &str,
    ) -> Result<bool, AppError> {
        let target = InboxTarget {
            inbox_url: inbox_url.to_string(),
            synchronize_followers: false,
        };
        Ok(self.enqueue(sender, activity, &[target]).await? > 0)
    }

    /// Queue an activity for every remote follower of `sender`.
    pub async fn deliver_to_followers(&self, sender: &Actor, activity: &Value) -> Result<usize, AppError> {
        let followers = self.db.get_followers(&sender.id).await?;
        let unreachable = self.unreachable_inboxes().await?;
        self.enqueue(sender, activity, &plan_recipients(&followers, &unreachable))
            .await
    }

    async fn author_reach(&self, author: &Actor) -> Result<HashSet<String>, AppError> {
        if !author.silenced {
            return Ok(HashSet::new());
        }
        let mut reach = self.db.get_follower_ids(&author.id).await?;
        reach.extend(self.db.get_follow_requester_ids(&author.id).await?);
        Ok(reach)
    }

    async fn enqueue(
        &self,
        sender: &Actor,
        activity: &Value,
        targets: &[InboxTarget],
    ) -> Result<usize, AppError> {
        if !sender.can_sign() {
            return Err(AppError::Validation(format!(
                "{} cannot sign outbound activities",
                sender.uri
            )));
        }

        let activity_id = activity
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Outbound activity has no id".to_string()))?;
        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let payload = serde_json::to_string(activity)?;
        let now = Utc::now();

        let mut queued = 0;
        for target in targets {
            let task = DeliveryTask {
                id: EntityId::new().0,
                activity_id: activity_id.to_string(),
                activity_type: activity_type.to_string(),
                sender_actor_id: sender.id.clone(),
                inbox_url: target.inbox_url.clone(),
                payload: payload.clone(),
                synchronize_followers: target.synchronize_followers,
                attempts: 0,
                next_attempt_at_ms: now_ms(),
                claimed_until_ms: None,
                last_attempt_at: None,
                last_error: None,
                created_at: now,
            };
            if self.db.insert_delivery_task(&task).await? {
                queued += 1;
            }
        }

        if queued > 0 {
            DELIVERIES_PLANNED
                .with_label_values(&[activity_type])
                .inc_by(queued as u64);
            self.delivery_wake.notify_one();
        }
        Ok(queued)
    }
}

/// Public, original, non-reply statuses are also sent to accepted relays.
fn relays_apply(status: &Status) -> bool {
    status.visibility() == Visibility::Public
        && status.reblog_of_id.is_none()
        && status.in_reply_to_uri.is_none()
}
