use serde_json::Value;

use super::{ActivityProcessor, object_id};
use crate::data::{Actor, Status};
use crate::error::AppError;

impl ActivityProcessor {
    /// Status of `sender` named by an Add/Remove on its featured collection.
    async fn featured_status(&self, activity: &Value, sender: &Actor) -> Result<Option<Status>, AppError> {
        let target = object_id(activity.get("target"));
        if target.is_none() || target.as_deref() != sender.featured_url.as_deref() {
            tracing::debug!(actor = %sender.uri, "Add/Remove does not target the featured collection");
            return Ok(None);
        }
        let Some(object_uri) = object_id(activity.get("object")) else {
            return Ok(None);
        };
        let status = self.db.get_status_by_uri(&object_uri).await?;
        Ok(status.filter(|status| status.account_id == sender.id && !status.is_reblog()))
    }

    pub(super) async fn handle_add(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        if let Some(status) = self.featured_status(activity, sender).await? {
            if self.db.insert_pin(&sender.id, &status.id).await? {
                tracing::debug!(id = %status.uri, "Status pinned");
            }
        }
        Ok(())
    }

    pub(super) async fn handle_remove(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        if let Some(status) = self.featured_status(activity, sender).await? {
            if self.db.delete_pin(&sender.id, &status.id).await? {
                tracing::debug!(id = %status.uri, "Status unpinned");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use crate::data::{EntityId, Status};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn add_and_remove_pin_own_status() {
        let h = harness().await;
        let bob = h.remote("bob", "remote.example").await;
        let status = Status {
            id: EntityId::new().0,
            uri: "https://remote.example/notes/1".to_string(),
            account_id: bob.id.clone(),
            visibility: "public".to_string(),
            content: "pinned".to_string(),
            reblog_of_id: None,
            in_reply_to_uri: None,
            local: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        h.db.insert_status(&status).await.unwrap();
        let featured = bob.featured_url.clone().unwrap();

        h.processor
            .process(
                &json!({"type": "Add", "id": "https://remote.example/add/1", "actor": bob.uri, "object": status.uri, "target": featured}),
                &bob,
            )
            .await
            .unwrap();
        assert!(h.db.is_pinned(&bob.id, &status.id).await.unwrap());

        h.processor
            .process(
                &json!({"type": "Remove", "id": "https://remote.example/rm/1", "actor": bob.uri, "object": status.uri, "target": featured}),
                &bob,
            )
            .await
            .unwrap();
        assert!(!h.db.is_pinned(&bob.id, &status.id).await.unwrap());
    }

    #[tokio::test]
    async fn add_to_other_collection_is_ignored() {
        let h = harness().await;
        let bob = h.remote("bob", "remote.example").await;
        let status = Status {
            id: EntityId::new().0,
            uri: "https://remote.example/notes/1".to_string(),
            account_id: bob.id.clone(),
            visibility: "public".to_string(),
            content: "x".to_string(),
            reblog_of_id: None,
            in_reply_to_uri: None,
            local: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        h.db.insert_status(&status).await.unwrap();

        h.processor
            .process(
                &json!({"type": "Add", "id": "https://remote.example/add/1", "actor": bob.uri, "object": status.uri, "target": "https://remote.example/users/bob/collections/other"}),
                &bob,
            )
            .await
            .unwrap();
        assert!(!h.db.is_pinned(&bob.id, &status.id).await.unwrap());
    }
}
