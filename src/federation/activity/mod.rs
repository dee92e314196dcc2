//! Activity processing
//!
//! Applies verified inbound activities to local state. Each activity type has
//! its own handler in a submodule; this module does the dispatch, the
//! forwarded-activity check and the helpers the handlers share.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::distribution::Distributor;
use super::key_resolver::KeyResolver;
use super::tag_manager::{PUBLIC_COLLECTION, TagManager};
use super::verifier::SignatureVerifier;
use crate::data::{Actor, Database, Visibility};
use crate::error::AppError;
use crate::metrics::ACTIVITIES_RECEIVED;
use crate::service::JobQueue;

mod accept;
mod block;
mod create;
mod delete;
mod featured;
mod follow;
mod move_account;
mod undo;
mod update;

/// Activity types this server understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityType {
    Follow,
    Accept,
    Reject,
    Block,
    Undo,
    Create,
    Delete,
    Update,
    Add,
    Remove,
    Move,
    Announce,
    /// Anything else; dropped and logged
    Unknown(String),
}

impl ActivityType {
    pub fn parse(s: &str) -> Self {
        match s {
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Block" => Self::Block,
            "Undo" => Self::Undo,
            "Create" => Self::Create,
            "Delete" => Self::Delete,
            "Update" => Self::Update,
            "Add" => Self::Add,
            "Remove" => Self::Remove,
            "Move" => Self::Move,
            "Announce" => Self::Announce,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Block => "Block",
            Self::Undo => "Undo",
            Self::Create => "Create",
            Self::Delete => "Delete",
            Self::Update => "Update",
            Self::Add => "Add",
            Self::Remove => "Remove",
            Self::Move => "Move",
            Self::Announce => "Announce",
            Self::Unknown(other) => other,
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            Self::Unknown(_) => "Unknown",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Block => "Block",
            Self::Undo => "Undo",
            Self::Create => "Create",
            Self::Delete => "Delete",
            Self::Update => "Update",
            Self::Add => "Add",
            Self::Remove => "Remove",
            Self::Move => "Move",
            Self::Announce => "Announce",
        }
    }
}

/// Id of a property that may be a bare URI or an embedded object.
pub(crate) fn object_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(uri) => Some(uri.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// `type` of an embedded object, if the property is one.
fn embedded_type(value: Option<&Value>) -> Option<&str> {
    value?.get("type").and_then(Value::as_str)
}

fn activity_id(activity: &Value) -> Option<&str> {
    activity.get("id").and_then(Value::as_str)
}

/// When the activity happened: `published` when present and parseable,
/// arrival time otherwise.
pub(crate) fn published_at(activity: &Value) -> DateTime<Utc> {
    activity
        .get("published")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn is_public(uri: &str) -> bool {
    uri == PUBLIC_COLLECTION || uri == "as:Public" || uri == "Public"
}

/// Visibility of a remote object from its addressing.
pub(crate) fn visibility_from_addressing(object: &Value, followers_url: &str) -> Visibility {
    let to = super::key_resolver::string_list(object.get("to"));
    let cc = super::key_resolver::string_list(object.get("cc"));

    if to.iter().any(|uri| is_public(uri)) {
        Visibility::Public
    } else if cc.iter().any(|uri| is_public(uri)) {
        Visibility::Unlisted
    } else if !followers_url.is_empty()
        && to.iter().chain(cc.iter()).any(|uri| uri == followers_url)
    {
        Visibility::Private
    } else {
        Visibility::Direct
    }
}

/// Processes inbound activities
pub struct ActivityProcessor {
    db: Arc<Database>,
    tags: Arc<TagManager>,
    resolver: Arc<KeyResolver>,
    verifier: Arc<SignatureVerifier>,
    distributor: Arc<Distributor>,
    jobs: Arc<JobQueue>,
    /// Delay after a poll's end before its expiry notifier runs
    poll_grace: Duration,
}

impl ActivityProcessor {
    pub fn new(
        db: Arc<Database>,
        tags: Arc<TagManager>,
        resolver: Arc<KeyResolver>,
        verifier: Arc<SignatureVerifier>,
        distributor: Arc<Distributor>,
        jobs: Arc<JobQueue>,
        poll_grace: Duration,
    ) -> Self {
        Self {
            db,
            tags,
            resolver,
            verifier,
            distributor,
            jobs,
            poll_grace,
        }
    }

    /// Process an activity whose transport was signed by `signer`.
    ///
    /// When the activity's `actor` is someone else (a forwarded or relayed
    /// activity), the embedded linked-data signature must be valid and made
    /// by that actor; otherwise the activity is dropped.
    pub async fn process_verified(&self, activity: Value, signer: &Actor) -> Result<(), AppError> {
        let Some(actor_uri) = object_id(activity.get("actor")) else {
            tracing::debug!(id = ?activity_id(&activity), "Dropping activity without actor");
            self.record("Unknown", "dropped");
            return Ok(());
        };

        if actor_uri == signer.uri {
            return self.process(&activity, signer).await;
        }

        match self.verifier.verify_document(&activity).await {
            Ok(actor) if actor.uri == actor_uri => self.process(&activity, &actor).await,
            Ok(actor) => {
                tracing::warn!(
                    id = ?activity_id(&activity),
                    actor = %actor_uri,
                    ld_signer = %actor.uri,
                    "Linked-data signature made by another actor, dropping"
                );
                self.record("Unknown", "dropped");
                Ok(())
            }
            Err(error) => {
                tracing::debug!(
                    id = ?activity_id(&activity),
                    actor = %actor_uri,
                    http_signer = %signer.uri,
                    %error,
                    "Forwarded activity not verifiable, dropping"
                );
                self.record("Unknown", "dropped");
                Ok(())
            }
        }
    }

    /// Apply an activity sent by `sender`, whose identity is already verified.
    pub async fn process(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        let activity_type = ActivityType::parse(
            activity
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );
        let label = activity_type.metric_label();

        if sender.is_local() {
            tracing::debug!(actor = %sender.uri, "Ignoring inbound activity from a local actor");
            self.record(label, "dropped");
            return Ok(());
        }
        if sender.suspended_at.is_some() {
            tracing::debug!(actor = %sender.uri, "Ignoring activity from a suspended actor");
            self.record(label, "dropped");
            return Ok(());
        }

        tracing::debug!(
            activity_type = activity_type.as_str(),
            id = ?activity_id(activity),
            actor = %sender.uri,
            "Processing activity"
        );

        let result = match &activity_type {
            ActivityType::Follow => self.handle_follow(activity, sender).await,
            ActivityType::Accept => self.handle_accept(activity, sender).await,
            ActivityType::Reject => self.handle_reject(activity, sender).await,
            ActivityType::Block => self.handle_block(activity, sender).await,
            ActivityType::Undo => self.handle_undo(activity, sender).await,
            ActivityType::Create => self.handle_create(activity, sender).await,
            ActivityType::Delete => self.handle_delete(activity, sender).await,
            ActivityType::Update => self.handle_update(activity, sender).await,
            ActivityType::Add => self.handle_add(activity, sender).await,
            ActivityType::Remove => self.handle_remove(activity, sender).await,
            ActivityType::Move => self.handle_move(activity, sender).await,
            ActivityType::Announce => self.handle_announce(activity, sender).await,
            ActivityType::Unknown(other) => {
                tracing::debug!(activity_type = %other, id = ?activity_id(activity), "Unsupported activity type");
                self.record(label, "unsupported");
                return Ok(());
            }
        };

        match &result {
            Ok(()) => self.record(label, "processed"),
            Err(error) => {
                tracing::warn!(
                    activity_type = activity_type.as_str(),
                    id = ?activity_id(activity),
                    %error,
                    "Activity processing failed"
                );
                self.record(label, "failed");
            }
        }
        result
    }

    fn record(&self, activity_type: &str, outcome: &str) {
        ACTIVITIES_RECEIVED
            .with_label_values(&[activity_type, outcome])
            .inc();
    }

    /// Local actor a URI refers to, if any.
    async fn local_actor_for(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let Some(username) = self.tags.local_username(uri) else {
            return Ok(None);
        };
        self.db.get_local_actor(&username).await
    }
}
