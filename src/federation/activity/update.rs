use serde_json::Value;

use super::create::{question_end, question_options};
use super::{ActivityProcessor, object_id};
use crate::data::Actor;
use crate::error::AppError;
use crate::federation::key_resolver::RemoteActorDocument;

const ACTOR_TYPES: &[&str] = &["Person", "Service", "Group", "Application", "Organization"];

impl ActivityProcessor {
    /// Update of the sender's profile or of one of its statuses.
    pub(super) async fn handle_update(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        let Some(object) = activity.get("object").filter(|o| o.is_object()) else {
            tracing::debug!(actor = %sender.uri, "Update without embedded object, ignoring");
            return Ok(());
        };
        let object_type = object.get("type").and_then(Value::as_str).unwrap_or_default();
        let Some(object_uri) = object_id(Some(object)) else {
            return Ok(());
        };

        if ACTOR_TYPES.contains(&object_type) {
            if object_uri != sender.uri {
                tracing::warn!(actor = %sender.uri, object = %object_uri, "Update of another actor's profile");
                return Ok(());
            }
            let document = RemoteActorDocument::from_json(object)?;
            let actor = document.into_actor(Some(sender.clone()));
            self.db.update_remote_actor(&actor).await?;
            self.resolver.invalidate(&sender.uri).await;
            tracing::info!(actor = %sender.uri, "Remote profile updated");
            return Ok(());
        }

        let Some(status) = self.db.get_status_by_uri(&object_uri).await? else {
            tracing::debug!(id = %object_uri, "Update of an unknown status");
            return Ok(());
        };
        if status.account_id != sender.id {
            tracing::warn!(id = %object_uri, actor = %sender.uri, "Update of a status owned by someone else");
            return Ok(());
        }

        if let Some(content) = object.get("content").and_then(Value::as_str) {
            self.db.update_status_content(&status.id, content).await?;
        }

        if object_type == "Question" {
            if let Some(poll) = self.db.get_poll_by_status(&status.id).await? {
                let options = question_options(object);
                let expires_at = question_end(object).unwrap_or(poll.expires_at);
                let options = if options.is_empty() {
                    poll.option_titles()
                } else {
                    options
                };
                self.db
                    .update_poll(&poll.id, &serde_json::to_string(&options)?, expires_at)
                    .await?;
                if let Some(updated) = self.db.get_poll(&poll.id).await? {
                    self.schedule_poll_expiry(&updated).await?;
                }
            }
        }

        tracing::debug!(id = %object_uri, "Remote status updated");
        Ok(())
    }
}
