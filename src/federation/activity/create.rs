use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{ActivityProcessor, activity_id, object_id, published_at, visibility_from_addressing};
use crate::data::{Actor, EntityId, Poll, Status, TombstoneKind};
use crate::error::AppError;
use crate::federation::key_resolver::string_list;
use crate::service::{Job, poll_expiration_lock};

const STATUS_TYPES: &[&str] = &["Note", "Question", "Article", "Page"];

/// Poll option titles of a Question (`oneOf` or `anyOf`).
pub(crate) fn question_options(object: &Value) -> Vec<String> {
    object
        .get("oneOf")
        .or_else(|| object.get("anyOf"))
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|option| option.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// End of a Question: `endTime`, else `closed`.
pub(crate) fn question_end(object: &Value) -> Option<DateTime<Utc>> {
    object
        .get("endTime")
        .or_else(|| object.get("closed"))
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
}

impl ActivityProcessor {
    /// Store a remote status, its mentions and its poll.
    pub(super) async fn handle_create(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        let Some(object) = activity.get("object").filter(|o| o.is_object()) else {
            tracing::debug!(id = ?activity_id(activity), "Create without embedded object, ignoring");
            return Ok(());
        };
        let object_type = object.get("type").and_then(Value::as_str).unwrap_or_default();
        if !STATUS_TYPES.contains(&object_type) {
            tracing::debug!(object_type, "Create of unsupported object type");
            return Ok(());
        }
        let Some(uri) = object_id(Some(object)) else {
            return Ok(());
        };

        let attributed_to = string_list(object.get("attributedTo"));
        if attributed_to.first() != Some(&sender.uri) {
            tracing::warn!(id = %uri, actor = %sender.uri, "Create of an object attributed to someone else");
            return Ok(());
        }

        if object_type == "Note" && object.get("name").is_some() {
            if self.record_vote(&uri, object, sender).await? {
                return Ok(());
            }
        }

        if self
            .db
            .has_tombstone(&sender.id, TombstoneKind::Status, &uri)
            .await?
        {
            tracing::debug!(id = %uri, "Status was deleted before it arrived");
            return Ok(());
        }
        if self.db.get_status_by_uri(&uri).await?.is_some() {
            tracing::debug!(id = %uri, "Status already known");
            return Ok(());
        }

        let created_at = object
            .get("published")
            .map(|_| published_at(object))
            .unwrap_or_else(|| published_at(activity));
        let status = Status {
            id: EntityId::new().0,
            uri: uri.clone(),
            account_id: sender.id.clone(),
            visibility: visibility_from_addressing(object, &sender.followers_url)
                .as_str()
                .to_string(),
            content: object
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            reblog_of_id: None,
            in_reply_to_uri: object_id(object.get("inReplyTo")),
            local: false,
            created_at,
            updated_at: Utc::now(),
        };
        if !self.db.insert_status(&status).await? {
            return Ok(());
        }

        self.store_mentions(&status, object, sender).await?;

        if object_type == "Question" {
            self.store_poll(&status, object, sender).await?;
        }

        tracing::info!(id = %uri, actor = %sender.uri, visibility = %status.visibility, "Stored remote status");
        Ok(())
    }

    /// A Note with a `name` replying to a local Question is a vote. Returns
    /// false when the object is not a vote on a local poll.
    async fn record_vote(&self, uri: &str, object: &Value, sender: &Actor) -> Result<bool, AppError> {
        let Some(question_uri) = object_id(object.get("inReplyTo")) else {
            return Ok(false);
        };
        let Some(question) = self.db.get_status_by_uri(&question_uri).await? else {
            return Ok(false);
        };
        if !question.local {
            return Ok(false);
        }
        let Some(poll) = self.db.get_poll_by_status(&question.id).await? else {
            return Ok(false);
        };

        if poll.is_expired_at(Utc::now()) {
            tracing::debug!(id = uri, "Vote on a closed poll");
            return Ok(true);
        }
        let name = object.get("name").and_then(Value::as_str).unwrap_or_default();
        let Some(choice) = poll.option_titles().iter().position(|title| title == name) else {
            tracing::debug!(id = uri, "Vote names no option of the poll");
            return Ok(true);
        };

        if self
            .db
            .insert_poll_vote(&poll.id, &sender.id, choice as i64, Some(uri))
            .await?
        {
            tracing::debug!(poll = %poll.id, voter = %sender.uri, "Remote vote recorded");
        }
        Ok(true)
    }

    async fn store_mentions(&self, status: &Status, object: &Value, sender: &Actor) -> Result<(), AppError> {
        let hrefs: Vec<String> = object
            .get("tag")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter(|tag| tag.get("type").and_then(Value::as_str) == Some("Mention"))
                    .filter_map(|tag| tag.get("href").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut mentioned = Vec::new();
        let mut local_mentioned = Vec::new();
        for href in hrefs {
            let actor = match self.local_actor_for(&href).await? {
                Some(local) => Some(local),
                None => self.resolver.find_stored(&href).await?,
            };
            if let Some(actor) = actor {
                if actor.is_local() {
                    local_mentioned.push(actor.id.clone());
                }
                mentioned.push(actor.id);
            }
        }

        if mentioned.is_empty() {
            return Ok(());
        }
        self.db.insert_mentions(&status.id, &mentioned).await?;

        for account_id in local_mentioned {
            if self.db.is_blocking(&account_id, &sender.id).await? {
                continue;
            }
            self.db
                .insert_notification(&account_id, "Status", &status.id, "mention", Some(&sender.id))
                .await?;
        }
        Ok(())
    }

    async fn store_poll(&self, status: &Status, object: &Value, sender: &Actor) -> Result<(), AppError> {
        let options = question_options(object);
        let Some(expires_at) = question_end(object) else {
            tracing::debug!(id = %status.uri, "Question without end time, storing as plain status");
            return Ok(());
        };
        if options.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let poll = Poll {
            id: EntityId::new().0,
            status_id: status.id.clone(),
            account_id: sender.id.clone(),
            options: serde_json::to_string(&options)?,
            expires_at,
            notified_at: None,
            created_at: now,
            updated_at: now,
        };
        if self.db.insert_poll(&poll).await? {
            self.schedule_poll_expiry(&poll).await?;
        }
        Ok(())
    }

    /// Queue the expiry notifier for the end of `poll`.
    pub(super) async fn schedule_poll_expiry(&self, poll: &Poll) -> Result<(), AppError> {
        self.jobs
            .schedule(
                Job::PollExpirationNotify {
                    poll_id: poll.id.clone(),
                },
                poll.expires_at + self.poll_grace,
                Some(&poll_expiration_lock(&poll.id)),
            )
            .await?;
        Ok(())
    }

    /// Record a reblog of a known status.
    pub(super) async fn handle_announce(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        let Some(announce_id) = activity_id(activity) else {
            return Ok(());
        };
        if self
            .db
            .has_tombstone(&sender.id, TombstoneKind::Announce, announce_id)
            .await?
        {
            tracing::debug!(id = announce_id, "Announce was already undone");
            return Ok(());
        }
        if self.db.get_status_by_uri(announce_id).await?.is_some() {
            return Ok(());
        }

        let Some(object_uri) = object_id(activity.get("object")) else {
            return Ok(());
        };
        let Some(mut original) = self.db.get_status_by_uri(&object_uri).await? else {
            tracing::debug!(id = announce_id, object = %object_uri, "Announce of an unknown status, ignoring");
            return Ok(());
        };
        if let Some(reblog_of_id) = original.reblog_of_id.clone() {
            match self.db.get_status(&reblog_of_id).await? {
                Some(root) => original = root,
                None => return Ok(()),
            }
        }

        let reblog = Status {
            id: EntityId::new().0,
            uri: announce_id.to_string(),
            account_id: sender.id.clone(),
            visibility: visibility_from_addressing(activity, &sender.followers_url)
                .as_str()
                .to_string(),
            content: String::new(),
            reblog_of_id: Some(original.id.clone()),
            in_reply_to_uri: None,
            local: false,
            created_at: published_at(activity),
            updated_at: Utc::now(),
        };
        if !self.db.insert_status(&reblog).await? {
            return Ok(());
        }

        if original.local {
            self.db
                .insert_notification(
                    &original.account_id,
                    "Status",
                    &reblog.id,
                    "reblog",
                    Some(&sender.id),
                )
                .await?;
        }
        tracing::info!(id = announce_id, original = %original.uri, "Stored reblog");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::*;
    use serde_json::json;

    fn note(uri: &str, author: &str, mention: Option<&str>) -> Value {
        let tag: Vec<Value> = mention
            .map(|href| vec![json!({"type": "Mention", "href": href})])
            .unwrap_or_default();
        json!({
            "id": uri,
            "type": "Note",
            "attributedTo": author,
            "content": "<p>hello</p>",
            "to": ["https://www.w3.org/ns/activitystreams#Public"],
            "tag": tag
        })
    }

    fn create(actor: &str, object: Value) -> Value {
        json!({
            "type": "Create",
            "id": format!("{}/activity", object["id"].as_str().unwrap()),
            "actor": actor,
            "object": object
        })
    }

    #[test]
    fn reads_question_options_and_end() {
        let question = json!({
            "type": "Question",
            "anyOf": [{"type": "Note", "name": "a"}, {"type": "Note", "name": "b"}],
            "endTime": "2030-01-01T00:00:00Z"
        });
        assert_eq!(question_options(&question), vec!["a", "b"]);
        assert_eq!(
            question_end(&question).unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn create_stores_status_and_notifies_mentioned_local() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;
        let uri = "https://remote.example/notes/1";

        let activity = create(&bob.uri, note(uri, &bob.uri, Some(&alice.uri)));
        h.processor.process(&activity, &bob).await.unwrap();
        h.processor.process(&activity, &bob).await.unwrap();

        let status = h.db.get_status_by_uri(uri).await.unwrap().unwrap();
        assert_eq!(status.visibility, "public");
        assert!(!status.local);
        assert_eq!(h.db.get_mentioned_actors(&status.id).await.unwrap().len(), 1);

        let notifications = h.db.get_notifications(&alice.id).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, "mention");
    }

    #[tokio::test]
    async fn create_attributed_to_another_actor_is_ignored() {
        let h = harness().await;
        let bob = h.remote("bob", "remote.example").await;
        let uri = "https://remote.example/notes/1";

        h.processor
            .process(
                &create(&bob.uri, note(uri, "https://remote.example/users/carol", None)),
                &bob,
            )
            .await
            .unwrap();

        assert!(h.db.get_status_by_uri(uri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_before_create_wins() {
        let h = harness().await;
        let bob = h.remote("bob", "remote.example").await;
        let uri = "https://remote.example/notes/1";

        h.processor
            .process(
                &json!({
                    "type": "Delete",
                    "id": "https://remote.example/d/1",
                    "actor": bob.uri,
                    "object": {"type": "Tombstone", "id": uri}
                }),
                &bob,
            )
            .await
            .unwrap();
        h.processor
            .process(&create(&bob.uri, note(uri, &bob.uri, None)), &bob)
            .await
            .unwrap();

        assert!(h.db.get_status_by_uri(uri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn question_creates_poll_and_schedules_expiry_once() {
        let h = harness().await;
        let bob = h.remote("bob", "remote.example").await;
        let uri = "https://remote.example/questions/1";

        let question = json!({
            "id": uri,
            "type": "Question",
            "attributedTo": bob.uri,
            "content": "pick",
            "to": ["https://www.w3.org/ns/activitystreams#Public"],
            "oneOf": [{"type": "Note", "name": "yes"}, {"type": "Note", "name": "no"}],
            "endTime": "2030-01-01T00:00:00Z"
        });
        h.processor
            .process(&create(&bob.uri, question), &bob)
            .await
            .unwrap();

        let status = h.db.get_status_by_uri(uri).await.unwrap().unwrap();
        let poll = h.db.get_poll_by_status(&status.id).await.unwrap().unwrap();
        assert_eq!(poll.option_titles(), vec!["yes", "no"]);
        assert_eq!(
            h.jobs.pending("poll_expiration_notify").await.unwrap(),
            vec![Job::PollExpirationNotify { poll_id: poll.id }]
        );
    }

    #[tokio::test]
    async fn announce_of_reblog_points_at_original() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;
        let carol = h.remote("carol", "other.example").await;

        let original = Status {
            id: EntityId::new().0,
            uri: h.tags.status_uri("alice", "1"),
            account_id: alice.id.clone(),
            visibility: "public".to_string(),
            content: "hi".to_string(),
            reblog_of_id: None,
            in_reply_to_uri: None,
            local: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        h.db.insert_status(&original).await.unwrap();

        h.processor
            .process(
                &json!({"type": "Announce", "id": "https://remote.example/a/1", "actor": bob.uri, "object": original.uri}),
                &bob,
            )
            .await
            .unwrap();
        h.processor
            .process(
                &json!({"type": "Announce", "id": "https://other.example/a/1", "actor": carol.uri, "object": "https://remote.example/a/1"}),
                &carol,
            )
            .await
            .unwrap();

        let reblog = h.db.get_reblog(&carol.id, &original.id).await.unwrap().unwrap();
        assert_eq!(reblog.reblog_of_id.as_deref(), Some(original.id.as_str()));
        let kinds: Vec<String> = h
            .db
            .get_notifications(&alice.id)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.kind)
            .collect();
        assert_eq!(kinds, vec!["reblog", "reblog"]);
    }

    #[tokio::test]
    async fn announce_of_unknown_status_is_ignored() {
        let h = harness().await;
        let bob = h.remote("bob", "remote.example").await;

        h.processor
            .process(
                &json!({"type": "Announce", "id": "https://remote.example/a/1", "actor": bob.uri, "object": "https://elsewhere.example/notes/9"}),
                &bob,
            )
            .await
            .unwrap();

        assert!(h.db.get_status_by_uri("https://remote.example/a/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vote_on_local_poll_is_counted_not_stored() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;
        let question = Status {
            id: EntityId::new().0,
            uri: h.tags.status_uri("alice", "q1"),
            account_id: alice.id.clone(),
            visibility: "public".to_string(),
            content: "pick".to_string(),
            reblog_of_id: None,
            in_reply_to_uri: None,
            local: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        h.db.insert_status(&question).await.unwrap();
        let poll = Poll {
            id: EntityId::new().0,
            status_id: question.id.clone(),
            account_id: alice.id.clone(),
            options: r#"["yes","no"]"#.to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            notified_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        h.db.insert_poll(&poll).await.unwrap();

        let vote_uri = "https://remote.example/users/bob#votes/1";
        let vote = json!({
            "id": vote_uri,
            "type": "Note",
            "attributedTo": bob.uri,
            "name": "no",
            "inReplyTo": question.uri,
            "to": [alice.uri]
        });
        h.processor.process(&create(&bob.uri, vote), &bob).await.unwrap();

        assert_eq!(h.db.count_poll_votes(&poll).await.unwrap(), vec![0, 1]);
        assert!(h.db.get_status_by_uri(vote_uri).await.unwrap().is_none());
    }
}
