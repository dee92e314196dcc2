use serde_json::Value;

use super::{ActivityProcessor, embedded_type, object_id};
use crate::data::{AcceptOutcome, Actor, Relay, RelayState};
use crate::error::AppError;
use crate::service::Job;

impl ActivityProcessor {
    /// Relay whose subscription Follow the activity's object refers to.
    async fn relay_for(&self, activity: &Value) -> Result<Option<Relay>, AppError> {
        let Some(follow_id) = object_id(activity.get("object")) else {
            return Ok(None);
        };
        self.db.get_relay_by_follow_activity_id(&follow_id).await
    }

    /// Local account whose Follow of `sender` the Accept/Reject answers.
    ///
    /// An embedded Follow names its actor; a bare id is looked up among the
    /// stored follow edges.
    async fn local_follower_for(&self, activity: &Value, sender: &Actor) -> Result<Option<Actor>, AppError> {
        let object = activity.get("object");

        if embedded_type(object) == Some("Follow") {
            let followed = object.and_then(|follow| object_id(follow.get("object")));
            if followed.as_deref().is_some_and(|uri| uri != sender.uri) {
                return Ok(None);
            }
            if let Some(actor_uri) = object.and_then(|follow| object_id(follow.get("actor"))) {
                return self.local_actor_for(&actor_uri).await;
            }
        }

        let Some(follow_id) = object_id(object) else {
            return Ok(None);
        };
        match self.db.find_follow_edge_by_uri(&follow_id).await? {
            Some(edge) if edge.target_account_id == sender.id => {
                let follower = self.db.get_actor(&edge.account_id).await?;
                Ok(follower.filter(Actor::is_local))
            }
            _ => Ok(None),
        }
    }

    pub(super) async fn handle_accept(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        if let Some(relay) = self.relay_for(activity).await? {
            if relay.relay_state() == RelayState::Pending {
                self.db
                    .update_relay_state(&relay.id, RelayState::Accepted, relay.follow_activity_id.as_deref())
                    .await?;
                tracing::info!(relay = %relay.inbox_url, "Relay accepted subscription");
            }
            return Ok(());
        }

        let Some(follower) = self.local_follower_for(activity, sender).await? else {
            tracing::debug!(actor = %sender.uri, "Accept does not answer a local follow");
            return Ok(());
        };

        match self.db.accept_follow_request(&follower.id, &sender.id).await? {
            AcceptOutcome::Accepted => {
                tracing::info!(follower = %follower.uri, target = %sender.uri, "Follow accepted");
                self.jobs
                    .enqueue(Job::RemoteAccountRefresh {
                        account_id: sender.id.clone(),
                    })
                    .await?;
            }
            AcceptOutcome::AlreadyFollowing => {
                tracing::debug!(follower = %follower.uri, target = %sender.uri, "Follow already accepted");
            }
            AcceptOutcome::NoRequest => {
                tracing::debug!(follower = %follower.uri, target = %sender.uri, "No pending follow request");
            }
        }
        Ok(())
    }

    pub(super) async fn handle_reject(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        if let Some(relay) = self.relay_for(activity).await? {
            self.db
                .update_relay_state(&relay.id, RelayState::Rejected, relay.follow_activity_id.as_deref())
                .await?;
            tracing::info!(relay = %relay.inbox_url, "Relay rejected subscription");
            return Ok(());
        }

        let Some(follower) = self.local_follower_for(activity, sender).await? else {
            tracing::debug!(actor = %sender.uri, "Reject does not answer a local follow");
            return Ok(());
        };

        let unfollowed = self.db.delete_follow(&follower.id, &sender.id).await?;
        let withdrawn = self.db.delete_follow_request(&follower.id, &sender.id).await?;
        if unfollowed || withdrawn {
            tracing::info!(follower = %follower.uri, target = %sender.uri, "Follow rejected");
        }
        Ok(())
    }
}
