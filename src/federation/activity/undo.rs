use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{ActivityProcessor, embedded_type, object_id, published_at};
use crate::data::{Actor, TombstoneKind, UndoOutcome};
use crate::error::AppError;

impl ActivityProcessor {
    /// Undo of a Follow, Block or Announce by `sender`.
    ///
    /// An Undo whose target is not known yet leaves an ordering record, so
    /// the target is not applied when it arrives later with an earlier or
    /// equal timestamp.
    pub(super) async fn handle_undo(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        let object = activity.get("object");
        let Some(object_uri) = object_id(object) else {
            tracing::debug!(actor = %sender.uri, "Undo without object, ignoring");
            return Ok(());
        };
        let at = published_at(activity);

        match embedded_type(object) {
            Some("Follow") => {
                let embedded = object.and_then(|follow| object_id(follow.get("object")));
                self.undo_follow(sender, embedded.as_deref(), Some(&object_uri), at)
                    .await
            }
            Some("Block") => {
                let embedded = object.and_then(|block| object_id(block.get("object")));
                self.undo_block(sender, embedded.as_deref(), &object_uri, at).await
            }
            Some("Announce") => self.undo_announce(sender, &object_uri, at).await,
            Some(other) => {
                tracing::debug!(object_type = other, "Undo of unsupported activity type");
                Ok(())
            }
            None => self.undo_by_uri(sender, &object_uri, at).await,
        }
    }

    async fn undo_follow(
        &self,
        sender: &Actor,
        target_uri: Option<&str>,
        follow_uri: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let Some(target) = (match target_uri {
            Some(uri) => self.local_actor_for(uri).await?,
            None => None,
        }) else {
            tracing::debug!(actor = %sender.uri, "Undo Follow target is not a local actor");
            return Ok(());
        };

        match self
            .db
            .undo_follow(&sender.id, &target.id, follow_uri, at)
            .await?
        {
            UndoOutcome::Removed => {
                tracing::info!(follower = %sender.uri, target = %target.uri, "Unfollowed");
            }
            UndoOutcome::Recorded => {
                tracing::debug!(follower = %sender.uri, target = %target.uri, "Undo Follow arrived before the Follow");
            }
            UndoOutcome::Stale => {}
        }
        Ok(())
    }

    async fn undo_block(
        &self,
        sender: &Actor,
        target_uri: Option<&str>,
        block_uri: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let Some(target) = (match target_uri {
            Some(uri) => self.local_actor_for(uri).await?,
            None => None,
        }) else {
            tracing::debug!(actor = %sender.uri, "Undo Block target is not a local actor");
            return Ok(());
        };

        match self
            .db
            .undo_block(&sender.id, &target.id, Some(block_uri), at)
            .await?
        {
            UndoOutcome::Removed => {
                tracing::info!(blocker = %sender.uri, target = %target.uri, "Unblocked");
            }
            UndoOutcome::Recorded => {
                tracing::debug!(id = block_uri, "Undo Block arrived before the Block");
            }
            UndoOutcome::Stale => {
                tracing::debug!(id = block_uri, "Undo Block is older than the stored block");
            }
        }
        Ok(())
    }

    async fn undo_announce(&self, sender: &Actor, announce_uri: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        match self.db.get_status_by_uri(announce_uri).await? {
            Some(reblog) if reblog.account_id == sender.id && reblog.is_reblog() => {
                self.db.delete_status(&reblog.id).await?;
                tracing::info!(id = announce_uri, "Reblog undone");
            }
            Some(_) => {
                tracing::debug!(id = announce_uri, "Undo Announce does not name a reblog by the sender");
            }
            None => {
                self.db
                    .record_tombstone(&sender.id, TombstoneKind::Announce, announce_uri, at)
                    .await?;
            }
        }
        Ok(())
    }

    /// Undo naming its target by id only.
    async fn undo_by_uri(&self, sender: &Actor, uri: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        if let Some(edge) = self.db.find_follow_edge_by_uri(uri).await? {
            if edge.account_id == sender.id {
                if let Some(target) = self.db.get_actor(&edge.target_account_id).await? {
                    return self
                        .undo_follow(sender, Some(&target.uri), Some(uri), at)
                        .await;
                }
            }
        }

        if let Some(block) = self.db.find_block_by_uri(&sender.id, uri).await? {
            if let Some(target) = self.db.get_actor(&block.target_account_id).await? {
                return self.undo_block(sender, Some(&target.uri), uri, at).await;
            }
        }

        if self.db.get_status_by_uri(uri).await?.is_some() {
            return self.undo_announce(sender, uri, at).await;
        }

        // Nothing known under this id yet; whichever activity it was must not
        // apply when it shows up.
        for kind in [TombstoneKind::Follow, TombstoneKind::Block, TombstoneKind::Announce] {
            self.db.record_tombstone(&sender.id, kind, uri, at).await?;
        }
        tracing::debug!(id = uri, "Undo of an unknown activity recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use serde_json::json;

    #[tokio::test]
    async fn undo_follow_removes_follower() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;
        h.db.insert_follow(&bob.id, &alice.id, Some("https://remote.example/f/1"))
            .await
            .unwrap();

        h.processor
            .process(
                &json!({
                    "type": "Undo",
                    "id": "https://remote.example/u/1",
                    "actor": bob.uri,
                    "object": {
                        "type": "Follow",
                        "id": "https://remote.example/f/1",
                        "actor": bob.uri,
                        "object": alice.uri
                    }
                }),
                &bob,
            )
            .await
            .unwrap();

        assert!(!h.db.is_following(&bob.id, &alice.id).await.unwrap());
    }

    #[tokio::test]
    async fn undo_follow_by_bare_id_removes_follower() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;
        h.db.insert_follow(&bob.id, &alice.id, Some("https://remote.example/f/1"))
            .await
            .unwrap();

        h.processor
            .process(
                &json!({
                    "type": "Undo",
                    "id": "https://remote.example/u/1",
                    "actor": bob.uri,
                    "object": "https://remote.example/f/1"
                }),
                &bob,
            )
            .await
            .unwrap();

        assert!(!h.db.is_following(&bob.id, &alice.id).await.unwrap());
    }

    #[tokio::test]
    async fn undo_before_follow_with_unknown_id_suppresses_follow() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;

        h.processor
            .process(
                &json!({
                    "type": "Undo",
                    "id": "https://remote.example/u/1",
                    "actor": bob.uri,
                    "object": "https://remote.example/f/1"
                }),
                &bob,
            )
            .await
            .unwrap();
        h.processor
            .process(
                &json!({
                    "type": "Follow",
                    "id": "https://remote.example/f/1",
                    "actor": bob.uri,
                    "object": alice.uri
                }),
                &bob,
            )
            .await
            .unwrap();

        assert!(!h.db.is_following(&bob.id, &alice.id).await.unwrap());
        assert!(h.delivered_to(&bob.inbox_url).await.is_empty());
    }

    #[tokio::test]
    async fn undo_block_removes_block() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;
        let block = json!({
            "type": "Block",
            "id": "https://remote.example/b/1",
            "actor": bob.uri,
            "object": alice.uri,
            "published": "2024-05-01T10:00:00Z"
        });
        h.processor.process(&block, &bob).await.unwrap();
        assert!(h.db.is_blocking(&bob.id, &alice.id).await.unwrap());

        h.processor
            .process(
                &json!({
                    "type": "Undo",
                    "id": "https://remote.example/u/1",
                    "actor": bob.uri,
                    "published": "2024-05-01T10:05:00Z",
                    "object": block
                }),
                &bob,
            )
            .await
            .unwrap();

        assert!(!h.db.is_blocking(&bob.id, &alice.id).await.unwrap());
    }

    #[tokio::test]
    async fn undo_announce_before_announce_suppresses_reblog() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;
        let status = crate::data::Status {
            id: "s1".to_string(),
            uri: h.tags.status_uri("alice", "s1"),
            account_id: alice.id.clone(),
            visibility: "public".to_string(),
            content: "hi".to_string(),
            reblog_of_id: None,
            in_reply_to_uri: None,
            local: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        h.db.insert_status(&status).await.unwrap();

        let announce = json!({
            "type": "Announce",
            "id": "https://remote.example/announces/1",
            "actor": bob.uri,
            "object": status.uri,
            "to": ["https://www.w3.org/ns/activitystreams#Public"]
        });
        h.processor
            .process(
                &json!({
                    "type": "Undo",
                    "id": "https://remote.example/u/1",
                    "actor": bob.uri,
                    "object": announce
                }),
                &bob,
            )
            .await
            .unwrap();
        h.processor.process(&announce, &bob).await.unwrap();

        assert!(h.db.get_reblog(&bob.id, &status.id).await.unwrap().is_none());
    }
}
