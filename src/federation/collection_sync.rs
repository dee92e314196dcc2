//! Followers collection synchronization
//!
//! A remote server attaches `Collection-Synchronization` to deliveries. It
//! names the sender's followers collection, a partial collection URL scoped
//! to our domain, and a digest of the follower URIs it knows on our side.
//! The digest is the hex XOR of the SHA-256 of every follower URI, so it does
//! not depend on ordering. A mismatch schedules a fetch of the partial
//! collection; the fetch then repairs follows in both directions.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

use super::builder;
use super::distribution::Distributor;
use super::key_resolver::KeyResolver;
use super::tag_manager::{TagManager, authority_of};
use crate::data::{Actor, Database};
use crate::error::AppError;
use crate::metrics::COLLECTION_SYNC_CHECKS;
use crate::service::{Job, JobQueue};

pub const HEADER_NAME: &str = "collection-synchronization";

/// Parsed `Collection-Synchronization` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncHeader {
    pub collection_id: String,
    pub url: String,
    pub digest: String,
}

/// Parse `collectionId="...", url="...", digest="..."`.
pub fn parse_header(value: &str) -> Option<SyncHeader> {
    let mut collection_id = None;
    let mut url = None;
    let mut digest = None;

    for part in value.split(',') {
        let Some((key, raw)) = part.trim().split_once('=') else {
            continue;
        };
        let raw = raw.trim().trim_matches('"').to_string();
        match key.trim() {
            "collectionId" => collection_id = Some(raw),
            "url" => url = Some(raw),
            "digest" => digest = Some(raw.to_ascii_lowercase()),
            _ => {}
        }
    }

    Some(SyncHeader {
        collection_id: collection_id?,
        url: url?,
        digest: digest?,
    })
}

/// Order-independent digest of a set of URIs.
pub fn followers_digest<I, S>(uris: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut acc = [0u8; 32];
    for uri in uris {
        let hash = Sha256::digest(uri.as_ref().as_bytes());
        for (byte, h) in acc.iter_mut().zip(hash.iter()) {
            *byte ^= h;
        }
    }
    hex::encode(acc)
}

/// Header value for an outbound delivery.
pub fn outbound_header(collection_id: &str, digest: &str, url: &str) -> String {
    format!(
        "collectionId=\"{}\", digest=\"{}\", url=\"{}\"",
        collection_id, digest, url
    )
}

/// What a header check decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    InSync,
    /// Digests differ; a synchronization job was queued
    Scheduled,
    /// Header does not describe the sender's own followers on this domain
    Ignored,
}

impl SyncDecision {
    fn label(&self) -> &'static str {
        match self {
            Self::InSync => "in_sync",
            Self::Scheduled => "scheduled",
            Self::Ignored => "ignored",
        }
    }
}

pub struct CollectionSynchronizer {
    db: Arc<Database>,
    tags: Arc<TagManager>,
    resolver: Arc<KeyResolver>,
    distributor: Arc<Distributor>,
    jobs: Arc<JobQueue>,
    instance_actor_username: String,
}

impl CollectionSynchronizer {
    pub fn new(
        db: Arc<Database>,
        tags: Arc<TagManager>,
        resolver: Arc<KeyResolver>,
        distributor: Arc<Distributor>,
        jobs: Arc<JobQueue>,
        instance_actor_username: String,
    ) -> Self {
        Self {
            db,
            tags,
            resolver,
            distributor,
            jobs,
            instance_actor_username,
        }
    }

    /// Digest of `actor`'s followers on `domain` (`None` = local followers),
    /// cached per (actor, domain) until the follower set changes.
    pub async fn digest_for(&self, actor: &Actor, domain: Option<&str>) -> Result<String, AppError> {
        let key = domain.unwrap_or(self.tags.domain());
        self.db
            .cached_followers_digest(&actor.id, key, domain, |uris| followers_digest(uris))
            .await
    }

    /// Check the header a remote `sender` attached to an inbox POST.
    pub async fn reconcile(&self, sender: &Actor, header_value: &str) -> Result<SyncDecision, AppError> {
        let decision = self.decide(sender, header_value).await?;
        COLLECTION_SYNC_CHECKS
            .with_label_values(&[decision.label()])
            .inc();
        Ok(decision)
    }

    async fn decide(&self, sender: &Actor, header_value: &str) -> Result<SyncDecision, AppError> {
        if sender.is_local() {
            return Ok(SyncDecision::Ignored);
        }

        let Some(header) = parse_header(header_value) else {
            tracing::debug!(actor = %sender.uri, "Malformed Collection-Synchronization header");
            return Ok(SyncDecision::Ignored);
        };

        if header.collection_id != sender.followers_url {
            tracing::debug!(
                actor = %sender.uri,
                collection = %header.collection_id,
                "Collection-Synchronization names a foreign collection"
            );
            return Ok(SyncDecision::Ignored);
        }

        if authority_of(&header.url).is_none() || authority_of(&header.url) != authority_of(&header.collection_id) {
            tracing::debug!(
                actor = %sender.uri,
                url = %header.url,
                "Collection-Synchronization url is not on the collection's host"
            );
            return Ok(SyncDecision::Ignored);
        }

        let local_digest = self.digest_for(sender, None).await?;
        if local_digest == header.digest {
            return Ok(SyncDecision::InSync);
        }

        tracing::info!(actor = %sender.uri, "Followers digest mismatch, scheduling synchronization");
        self.db.mark_sync_requested(&sender.id, self.tags.domain()).await?;
        self.jobs
            .enqueue(Job::FollowersSynchronization {
                account_id: sender.id.clone(),
                url: header.url,
            })
            .await?;
        Ok(SyncDecision::Scheduled)
    }

    /// Fetch the remote partial followers collection and reconcile it.
    ///
    /// Local accounts following `account_id` that the remote does not list
    /// are unfollowed. Listed local accounts whose follow we lost are
    /// repaired: a pending request is accepted, otherwise an Undo Follow is
    /// sent so the remote drops the stale entry.
    pub async fn synchronize(&self, account_id: &str, url: &str) -> Result<(), AppError> {
        let Some(remote) = self.db.get_actor(account_id).await? else {
            return Ok(());
        };
        if remote.is_local() {
            return Ok(());
        }

        let signer = self
            .db
            .get_local_actor(&self.instance_actor_username)
            .await?
            .ok_or_else(|| AppError::Config("instance actor is not initialized".to_string()))?;

        let items = self
            .resolver
            .fetcher()
            .fetch_collection_items(url, &signer)
            .await?;

        let mut expected = HashSet::new();
        for item in &items {
            let Some(username) = self.tags.local_username(item) else {
                continue;
            };
            if let Some(local) = self.db.get_local_actor(&username).await? {
                expected.insert(local.id.clone());
                self.repair_listed_follow(&local, &remote).await?;
            }
        }

        for follower in self.db.get_local_followers(&remote.id).await? {
            if expected.contains(&follower.id) {
                continue;
            }
            tracing::info!(
                follower = %follower.uri,
                target = %remote.uri,
                "Removing follow unknown to the remote side"
            );
            let follow = self.db.get_follow(&follower.id, &remote.id).await?;
            self.db.delete_follow(&follower.id, &remote.id).await?;
            let follow_id = follow
                .and_then(|edge| edge.uri)
                .unwrap_or_else(|| self.tags.generate_activity_id());
            self.send_undo_follow(&follower, &remote, &follow_id).await?;
        }

        Ok(())
    }

    async fn repair_listed_follow(&self, local: &Actor, remote: &Actor) -> Result<(), AppError> {
        if self.db.is_following(&local.id, &remote.id).await? {
            return Ok(());
        }

        if self.db.has_requested(&local.id, &remote.id).await? {
            self.db.accept_follow_request(&local.id, &remote.id).await?;
            return Ok(());
        }

        // No follow id exists on our side; receivers match the Undo by actor and object.
        let follow_id = self.tags.generate_activity_id();
        self.send_undo_follow(local, remote, &follow_id).await
    }

    async fn send_undo_follow(&self, local: &Actor, remote: &Actor, follow_id: &str) -> Result<(), AppError> {
        let activity = builder::undo(
            &self.tags.generate_activity_id(),
            &local.uri,
            builder::follow_object(follow_id, &local.uri, &remote.uri),
        );
        self.distributor
            .deliver_to_inbox(local, &activity, remote.preferred_inbox_url())
            .await?;
        Ok(())
    }
}
