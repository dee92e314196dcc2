use serde_json::Value;

use super::{ActivityProcessor, activity_id, object_id, published_at};
use crate::data::{Actor, BlockOutcome};
use crate::error::AppError;
use crate::federation::builder;

impl ActivityProcessor {
    /// Block of a local account by `sender`.
    ///
    /// The block and the severing of follows in both directions commit
    /// together. Local follows of the blocker that were severed are undone on
    /// the remote side too.
    pub(super) async fn handle_block(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        let Some(block_id) = activity_id(activity) else {
            tracing::debug!(actor = %sender.uri, "Block without id, ignoring");
            return Ok(());
        };
        let Some(target_uri) = object_id(activity.get("object")) else {
            return Ok(());
        };
        let Some(target) = self.local_actor_for(&target_uri).await? else {
            tracing::debug!(id = block_id, target = %target_uri, "Block target is not a local actor");
            return Ok(());
        };

        let applied = self
            .db
            .apply_block(&sender.id, &target.id, block_id, published_at(activity))
            .await?;

        match applied.outcome {
            BlockOutcome::Created => {
                tracing::info!(blocker = %sender.uri, target = %target.uri, "Blocked");
            }
            BlockOutcome::Updated => {
                tracing::debug!(id = block_id, "Existing block now tracks the newer activity");
            }
            BlockOutcome::Stale => {
                tracing::debug!(id = block_id, "Block is older than the stored one");
            }
            BlockOutcome::Suppressed => {
                tracing::debug!(id = block_id, "Block was already undone");
            }
        }

        let outgoing = applied
            .severed_follows
            .iter()
            .chain(applied.severed_requests.iter())
            .filter(|edge| edge.account_id == target.id);
        for edge in outgoing {
            let follow_id = edge
                .uri
                .clone()
                .unwrap_or_else(|| self.tags.generate_activity_id());
            let undo = builder::undo(
                &self.tags.generate_activity_id(),
                &target.uri,
                builder::follow_object(&follow_id, &target.uri, &sender.uri),
            );
            self.distributor
                .deliver_to_inbox(&target, &undo, &sender.inbox_url)
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use serde_json::json;

    fn block(id: &str, actor: &str, object: &str, published: &str) -> serde_json::Value {
        json!({"type": "Block", "id": id, "actor": actor, "object": object, "published": published})
    }

    #[tokio::test]
    async fn block_severs_follows_in_both_directions() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;
        h.db.insert_follow(&alice.id, &bob.id, Some("https://local.test/01f"))
            .await
            .unwrap();
        h.db.insert_follow(&bob.id, &alice.id, Some("https://remote.example/f/1"))
            .await
            .unwrap();

        h.processor
            .process(
                &block("https://remote.example/b/1", &bob.uri, &alice.uri, "2024-05-01T10:00:00Z"),
                &bob,
            )
            .await
            .unwrap();

        assert!(h.db.is_blocking(&bob.id, &alice.id).await.unwrap());
        assert!(!h.db.is_following(&alice.id, &bob.id).await.unwrap());
        assert!(!h.db.is_following(&bob.id, &alice.id).await.unwrap());

        let sent = h.delivered_to(&bob.inbox_url).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "Undo");
        assert_eq!(sent[0]["object"]["id"], "https://local.test/01f");
    }

    #[tokio::test]
    async fn duplicate_block_updates_origin_uri() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;

        h.processor
            .process(
                &block("https://remote.example/b/1", &bob.uri, &alice.uri, "2024-05-01T10:00:00Z"),
                &bob,
            )
            .await
            .unwrap();
        h.processor
            .process(
                &block("https://remote.example/b/2", &bob.uri, &alice.uri, "2024-05-01T11:00:00Z"),
                &bob,
            )
            .await
            .unwrap();

        let stored = h.db.get_block(&bob.id, &alice.id).await.unwrap().unwrap();
        assert_eq!(stored.uri.as_deref(), Some("https://remote.example/b/2"));
    }

    #[tokio::test]
    async fn undo_received_first_prevents_block() {
        let h = harness().await;
        let alice = h.local("alice").await;
        let bob = h.remote("bob", "remote.example").await;
        h.db.insert_follow(&alice.id, &bob.id, None).await.unwrap();

        let original = block("https://remote.example/b/1", &bob.uri, &alice.uri, "2024-05-01T10:00:00Z");
        h.processor
            .process(
                &json!({
                    "type": "Undo",
                    "id": "https://remote.example/u/1",
                    "actor": bob.uri,
                    "published": "2024-05-01T10:05:00Z",
                    "object": original
                }),
                &bob,
            )
            .await
            .unwrap();
        h.processor.process(&original, &bob).await.unwrap();

        assert!(!h.db.is_blocking(&bob.id, &alice.id).await.unwrap());
        // the follow is still severed
        assert!(!h.db.is_following(&alice.id, &bob.id).await.unwrap());
    }
}
