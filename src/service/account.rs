//! Account service
//!
//! Local account creation and the follow operations local accounts start.

use chrono::Utc;
use std::sync::Arc;

use crate::data::{Actor, Database, EntityId};
use crate::error::AppError;
use crate::federation::{Distributor, KeyResolver, TagManager, builder};

#[cfg(test)]
const ACCOUNT_KEY_BITS: usize = 1024;
#[cfg(not(test))]
const ACCOUNT_KEY_BITS: usize = 2048;

fn validate_username(username: &str) -> Result<(), AppError> {
    let valid = !username.is_empty()
        && username.len() <= 30
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid username: {:?}", username)))
    }
}

/// Generate an RSA keypair off the async runtime. Returns (private, public) PEM.
async fn generate_keypair() -> Result<(String, String), AppError> {
    tokio::task::spawn_blocking(|| -> Result<(String, String), anyhow::Error> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, ACCOUNT_KEY_BITS)?;
        let public_key = RsaPublicKey::from(&private_key);
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
        let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?;
        Ok((private_key_pem, public_key_pem))
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))?
    .map_err(AppError::Internal)
}

/// Account service
pub struct AccountService {
    db: Arc<Database>,
    tags: Arc<TagManager>,
    resolver: Arc<KeyResolver>,
    distributor: Arc<Distributor>,
}

impl AccountService {
    pub fn new(
        db: Arc<Database>,
        tags: Arc<TagManager>,
        resolver: Arc<KeyResolver>,
        distributor: Arc<Distributor>,
    ) -> Self {
        Self {
            db,
            tags,
            resolver,
            distributor,
        }
    }

    pub async fn get(&self, username: &str) -> Result<Actor, AppError> {
        self.db
            .get_local_actor(username)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Create a local account with a fresh RSA keypair.
    ///
    /// # Errors
    /// `Validation` when the username is malformed or already taken.
    pub async fn create(&self, username: &str, locked: bool) -> Result<Actor, AppError> {
        self.create_with_type(username, "Person", locked).await
    }

    /// The instance actor signs relay subscriptions and followers
    /// synchronization fetches. Created on first use.
    pub async fn ensure_instance_actor(&self, username: &str) -> Result<Actor, AppError> {
        if let Some(actor) = self.db.get_local_actor(username).await? {
            return Ok(actor);
        }
        tracing::info!(username, "Creating instance actor");
        self.create_with_type(username, "Application", true).await
    }

    async fn create_with_type(
        &self,
        username: &str,
        actor_type: &str,
        locked: bool,
    ) -> Result<Actor, AppError> {
        let username = username.trim();
        validate_username(username)?;

        // Fast-path guard before expensive key generation.
        if self.db.get_local_actor(username).await?.is_some() {
            return Err(AppError::Validation(format!(
                "username {} is already taken",
                username
            )));
        }

        let (private_key_pem, public_key_pem) = generate_keypair().await?;
        let now = Utc::now();
        let actor = Actor {
            id: EntityId::new().0,
            uri: self.tags.actor_uri(username),
            username: username.to_string(),
            domain: None,
            actor_type: actor_type.to_string(),
            inbox_url: self.tags.inbox_url(username),
            shared_inbox_url: Some(self.tags.shared_inbox_url()),
            followers_url: self.tags.followers_url(username),
            featured_url: Some(self.tags.featured_url(username)),
            public_key_pem: Some(public_key_pem),
            private_key_pem: Some(private_key_pem),
            locked,
            silenced: false,
            suspended_at: None,
            deletion_request_at: None,
            moved_to_uri: None,
            also_known_as: "[]".to_string(),
            last_refreshed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_actor(&actor).await?;
        tracing::info!(actor = %actor.uri, "Local account created");
        Ok(actor)
    }

    /// Request to follow a remote account. The edge stays a follow request
    /// until the remote side sends Accept.
    pub async fn follow(&self, account_id: &str, target_uri: &str) -> Result<Actor, AppError> {
        let account = self.local_account(account_id).await?;
        let target = self.resolver.resolve(target_uri).await?;
        if target.is_local() {
            return Err(AppError::Validation(
                "local follows do not federate".to_string(),
            ));
        }
        if self.db.is_following(&account.id, &target.id).await?
            || self.db.has_requested(&account.id, &target.id).await?
        {
            return Ok(target);
        }
        if self.db.is_blocking(&target.id, &account.id).await? {
            return Err(AppError::Forbidden);
        }

        let follow_id = self.tags.generate_activity_id();
        self.db
            .insert_follow_request(&account.id, &target.id, Some(&follow_id))
            .await?;
        let follow = builder::follow(&follow_id, &account.uri, &target.uri);
        self.distributor
            .deliver_to_inbox(&account, &follow, &target.inbox_url)
            .await?;
        tracing::info!(follower = %account.uri, target = %target.uri, "Follow requested");
        Ok(target)
    }

    /// Drop a follow (or pending request) of a remote account and tell it.
    pub async fn unfollow(&self, account_id: &str, target_id: &str) -> Result<(), AppError> {
        let account = self.local_account(account_id).await?;
        let target = self.db.get_actor(target_id).await?.ok_or(AppError::NotFound)?;

        let edge = match self.db.get_follow(&account.id, &target.id).await? {
            Some(edge) => Some(edge),
            None => self.db.get_follow_request(&account.id, &target.id).await?,
        };
        let Some(edge) = edge else {
            return Ok(());
        };

        self.db.delete_follow(&account.id, &target.id).await?;
        self.db.delete_follow_request(&account.id, &target.id).await?;

        if !target.is_local() {
            let follow_id = edge.uri.unwrap_or_else(|| self.tags.generate_activity_id());
            let undo = builder::undo(
                &self.tags.generate_activity_id(),
                &account.uri,
                builder::follow_object(&follow_id, &account.uri, &target.uri),
            );
            self.distributor
                .deliver_to_inbox(&account, &undo, &target.inbox_url)
                .await?;
        }
        tracing::info!(follower = %account.uri, target = %target.uri, "Unfollowed");
        Ok(())
    }

    async fn local_account(&self, account_id: &str) -> Result<Actor, AppError> {
        match self.db.get_actor(account_id).await? {
            Some(actor) if actor.can_sign() => Ok(actor),
            _ => Err(AppError::NotFound),
        }
    }
}
