use serde_json::Value;

use super::{ActivityProcessor, activity_id, object_id, published_at};
use crate::data::{Actor, FollowOutcome};
use crate::error::AppError;
use crate::federation::builder;

impl ActivityProcessor {
    /// Follow of a local account by `sender`.
    ///
    /// Locked accounts get a follow request, others an accepted follow and an
    /// Accept back. A blocked follower gets a Reject.
    pub(super) async fn handle_follow(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        let Some(follow_id) = activity_id(activity) else {
            tracing::debug!(actor = %sender.uri, "Follow without id, ignoring");
            return Ok(());
        };
        let Some(target_uri) = object_id(activity.get("object")) else {
            tracing::debug!(id = follow_id, "Follow without object, ignoring");
            return Ok(());
        };
        let Some(target) = self.local_actor_for(&target_uri).await? else {
            tracing::debug!(id = follow_id, target = %target_uri, "Follow target is not a local actor");
            return Ok(());
        };

        let follow = builder::follow_object(follow_id, &sender.uri, &target.uri);

        if self.db.is_blocking(&target.id, &sender.id).await? {
            tracing::info!(follower = %sender.uri, target = %target.uri, "Rejecting follow from blocked actor");
            let reject = builder::reject(&self.tags.generate_activity_id(), &target.uri, follow);
            self.distributor
                .deliver_to_inbox(&target, &reject, &sender.inbox_url)
                .await?;
            return Ok(());
        }

        let outcome = self
            .db
            .apply_follow(
                &sender.id,
                &target.id,
                follow_id,
                published_at(activity),
                target.locked,
            )
            .await?;

        match outcome {
            FollowOutcome::Followed => {
                self.db
                    .insert_notification(&target.id, "Follow", follow_id, "follow", Some(&sender.id))
                    .await?;
                self.send_accept(&target, sender, follow).await?;
                tracing::info!(follower = %sender.uri, target = %target.uri, "New follower");
            }
            FollowOutcome::AlreadyFollowing => {
                // The remote may have lost our Accept; send it again.
                self.send_accept(&target, sender, follow).await?;
            }
            FollowOutcome::Requested => {
                self.db
                    .insert_notification(
                        &target.id,
                        "Follow",
                        follow_id,
                        "follow_request",
                        Some(&sender.id),
                    )
                    .await?;
                tracing::info!(follower = %sender.uri, target = %target.uri, "Follow request received");
            }
            FollowOutcome::AlreadyRequested => {
                tracing::debug!(id = follow_id, "Follow request already pending");
            }
            FollowOutcome::Suppressed => {
                tracing::debug!(id = follow_id, "Follow was already undone, ignoring");
            }
        }

        Ok(())
    }

    async fn send_accept(&self, target: &Actor, follower: &Actor, follow: Value) -> Result<(), AppError> {
        let accept = builder::accept(&self.tags.generate_activity_id(), &target.uri, follow);
        self.distributor
            .deliver_to_inbox(target, &accept, &follower.inbox_url)
            .await?;
        Ok(())
    }
}
