use serde_json::Value;

use super::{ActivityProcessor, object_id};
use crate::data::Actor;
use crate::error::AppError;
use crate::federation::builder;

impl ActivityProcessor {
    /// Account migration: local followers of `sender` are moved over to the
    /// new account, and local blocks and mutes are carried along.
    pub(super) async fn handle_move(&self, activity: &Value, sender: &Actor) -> Result<(), AppError> {
        if object_id(activity.get("object")).as_deref() != Some(sender.uri.as_str()) {
            tracing::debug!(actor = %sender.uri, "Move of another account, ignoring");
            return Ok(());
        }
        let Some(target_uri) = object_id(activity.get("target")) else {
            tracing::debug!(actor = %sender.uri, "Move without target, ignoring");
            return Ok(());
        };
        if target_uri == sender.uri {
            return Ok(());
        }

        let Some(target) = self.move_target(sender, &target_uri).await? else {
            tracing::warn!(actor = %sender.uri, target = %target_uri, "Move target does not list the account as an alias");
            return Ok(());
        };

        self.db.set_actor_moved_to(&sender.id, &target.uri).await?;

        for blocker_id in self.db.get_local_blocker_ids(&sender.id).await? {
            self.db.insert_block(&blocker_id, &target.id).await?;
        }
        for muter_id in self.db.get_local_muter_ids(&sender.id).await? {
            self.db.insert_mute(&muter_id, &target.id).await?;
        }

        let followers = self.db.get_local_followers(&sender.id).await?;
        let mut migrated = 0usize;
        for follower in &followers {
            if self.migrate_follower(follower, sender, &target).await? {
                migrated += 1;
            }
        }

        tracing::info!(
            from = %sender.uri,
            to = %target.uri,
            followers = followers.len(),
            migrated,
            "Account moved"
        );
        Ok(())
    }

    /// Resolve the move target and check it names `sender` in `alsoKnownAs`,
    /// refreshing a stale copy once.
    async fn move_target(&self, sender: &Actor, target_uri: &str) -> Result<Option<Actor>, AppError> {
        let target = match self.resolver.resolve(target_uri).await {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(target = target_uri, error = %e, "Could not resolve move target");
                return Ok(None);
            }
        };
        if target.also_known_as_uris().contains(&sender.uri) {
            return Ok(Some(target));
        }

        let refreshed = match self.resolver.refresh(&target).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::warn!(target = target_uri, error = %e, "Could not refresh move target");
                return Ok(None);
            }
        };
        Ok(refreshed
            .also_known_as_uris()
            .contains(&sender.uri)
            .then_some(refreshed))
    }

    /// Returns whether a follow of `target` was started for `follower`.
    async fn migrate_follower(&self, follower: &Actor, old: &Actor, target: &Actor) -> Result<bool, AppError> {
        let previous = self.db.get_follow(&follower.id, &old.id).await?;
        if self.db.delete_follow(&follower.id, &old.id).await? {
            let follow_id = previous
                .and_then(|edge| edge.uri)
                .unwrap_or_else(|| self.tags.generate_activity_id());
            let undo = builder::undo(
                &self.tags.generate_activity_id(),
                &follower.uri,
                builder::follow_object(&follow_id, &follower.uri, &old.uri),
            );
            self.distributor
                .deliver_to_inbox(follower, &undo, &old.inbox_url)
                .await?;
        }

        if self.db.is_following(&follower.id, &target.id).await?
            || self.db.has_requested(&follower.id, &target.id).await?
            || self.db.is_blocking(&follower.id, &target.id).await?
        {
            return Ok(false);
        }

        if target.is_local() {
            return self.db.insert_follow(&follower.id, &target.id, None).await;
        }

        let follow_id = self.tags.generate_activity_id();
        self.db
            .insert_follow_request(&follower.id, &target.id, Some(&follow_id))
            .await?;
        let follow = builder::follow(&follow_id, &follower.uri, &target.uri);
        self.distributor
            .deliver_to_inbox(follower, &follow, &target.inbox_url)
            .await?;
        Ok(true)
    }
}
