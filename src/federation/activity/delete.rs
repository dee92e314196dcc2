use serde_json::Value;

use super::{ActivityProcessor, object_id, published_at};
use crate::data::{Actor, TombstoneKind};
use crate::error::AppError;

impl ActivityProcessor {
    /// Delete of the sender itself or of one of its statuses.
    pub(super) async fn handle_delete(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        let Some(object_uri) = object_id(activity.get("object")) else {
            tracing::debug!(actor = %sender.uri, "Delete without object, ignoring");
            return Ok(());
        };

        if object_uri == sender.uri {
            self.db.remove_deleted_actor(&sender.id).await?;
            self.resolver.invalidate(&sender.uri).await;
            tracing::info!(actor = %sender.uri, "Remote actor deleted itself");
            return Ok(());
        }

        match self.db.get_status_by_uri(&object_uri).await? {
            Some(status) if status.account_id == sender.id => {
                self.db.delete_status(&status.id).await?;
                tracing::info!(id = %object_uri, "Remote status deleted");
            }
            Some(_) => {
                tracing::warn!(id = %object_uri, actor = %sender.uri, "Delete of a status owned by someone else");
            }
            None => {
                self.db
                    .record_tombstone(
                        &sender.id,
                        TombstoneKind::Status,
                        &object_uri,
                        published_at(activity),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
