//! Relay subscriptions
//!
//! The instance actor follows a relay's inbox with a Follow of the public
//! collection. The relay answers with Accept or Reject, which the inbound
//! handlers apply to the relay row.

use std::sync::Arc;

use crate::data::{Actor, Database, Relay, RelayState};
use crate::error::AppError;
use crate::federation::signature::ensure_remote_destination;
use crate::federation::tag_manager::PUBLIC_COLLECTION;
use crate::federation::{Distributor, TagManager, builder};

pub struct RelayService {
    db: Arc<Database>,
    tags: Arc<TagManager>,
    distributor: Arc<Distributor>,
    instance_actor_username: String,
    allow_private_addresses: bool,
}

impl RelayService {
    pub fn new(
        db: Arc<Database>,
        tags: Arc<TagManager>,
        distributor: Arc<Distributor>,
        instance_actor_username: String,
        allow_private_addresses: bool,
    ) -> Self {
        Self {
            db,
            tags,
            distributor,
            instance_actor_username,
            allow_private_addresses,
        }
    }

    /// Subscribe to a relay. A relay that is already pending or accepted is
    /// returned unchanged.
    pub async fn enable(&self, inbox_url: &str) -> Result<Relay, AppError> {
        ensure_remote_destination(inbox_url, self.allow_private_addresses).await?;
        let relay = self.db.upsert_relay(inbox_url).await?;
        if matches!(relay.relay_state(), RelayState::Pending | RelayState::Accepted) {
            return Ok(relay);
        }

        let instance = self.instance_actor().await?;
        let follow_id = self.tags.generate_activity_id();
        self.db
            .update_relay_state(&relay.id, RelayState::Pending, Some(&follow_id))
            .await?;
        let follow = builder::follow(&follow_id, &instance.uri, PUBLIC_COLLECTION);
        self.distributor
            .deliver_to_inbox(&instance, &follow, inbox_url)
            .await?;

        tracing::info!(relay = inbox_url, "Relay subscription requested");
        self.db
            .get_relay_by_inbox(inbox_url)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Unsubscribe from a relay and return it to idle.
    pub async fn disable(&self, inbox_url: &str) -> Result<(), AppError> {
        let relay = self
            .db
            .get_relay_by_inbox(inbox_url)
            .await?
            .ok_or(AppError::NotFound)?;

        if let Some(follow_id) = &relay.follow_activity_id {
            if relay.relay_state() != RelayState::Idle {
                let instance = self.instance_actor().await?;
                let undo = builder::undo(
                    &self.tags.generate_activity_id(),
                    &instance.uri,
                    builder::follow_object(follow_id, &instance.uri, PUBLIC_COLLECTION),
                );
                self.distributor
                    .deliver_to_inbox(&instance, &undo, inbox_url)
                    .await?;
            }
        }

        self.db
            .update_relay_state(&relay.id, RelayState::Idle, None)
            .await?;
        tracing::info!(relay = inbox_url, "Relay subscription removed");
        Ok(())
    }

    async fn instance_actor(&self) -> Result<Actor, AppError> {
        self.db
            .get_local_actor(&self.instance_actor_username)
            .await?
            .ok_or_else(|| AppError::Config("instance actor is not initialized".to_string()))
    }
}
