//! Remote actor resolution
//!
//! Resolves signing actors and their public keys: in-memory cache first,
//! then the database, then a remote fetch through [`RemoteActorFetcher`].

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::signature::{ensure_remote_destination, sign_request};
use super::tag_manager::{authority_of, strip_fragment};
use crate::data::{Actor, Database, EntityId};
use crate::error::AppError;
use crate::metrics::REMOTE_KEY_FETCHES;

/// Federation-relevant fields of a fetched actor document
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteActorDocument {
    pub uri: String,
    pub username: String,
    pub actor_type: String,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub followers_url: String,
    pub featured_url: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub locked: bool,
    pub also_known_as: Vec<String>,
    pub moved_to: Option<String>,
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Values of a property that may be a single string or an array of strings.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(single)) => vec![single.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(_) => string_field(item, "id"),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

impl RemoteActorDocument {
    pub fn from_json(value: &Value) -> Result<Self, AppError> {
        let uri = string_field(value, "id")
            .ok_or_else(|| AppError::Federation("Missing id in actor".to_string()))?;
        let inbox_url = string_field(value, "inbox")
            .ok_or_else(|| AppError::Federation("Missing inbox in actor".to_string()))?;

        let username = string_field(value, "preferredUsername")
            .or_else(|| uri.trim_end_matches('/').rsplit('/').next().map(str::to_string))
            .unwrap_or_default();

        let public_key = match value.get("publicKey") {
            Some(Value::Array(keys)) => keys.first().cloned(),
            Some(key @ Value::Object(_)) => Some(key.clone()),
            _ => None,
        };

        Ok(Self {
            username,
            actor_type: string_field(value, "type").unwrap_or_else(|| "Person".to_string()),
            shared_inbox_url: value
                .get("endpoints")
                .and_then(|endpoints| string_field(endpoints, "sharedInbox")),
            followers_url: string_field(value, "followers").unwrap_or_default(),
            featured_url: string_field(value, "featured"),
            public_key_id: public_key.as_ref().and_then(|key| string_field(key, "id")),
            public_key_pem: public_key
                .as_ref()
                .and_then(|key| string_field(key, "publicKeyPem")),
            locked: value
                .get("manuallyApprovesFollowers")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            also_known_as: string_list(value.get("alsoKnownAs")),
            moved_to: string_field(value, "movedTo"),
            uri,
            inbox_url,
        })
    }

    /// Merge the document into a stored actor row (or build a new one).
    pub fn into_actor(self, existing: Option<Actor>) -> Actor {
        let now = Utc::now();
        let domain = authority_of(&self.uri);
        let also_known_as =
            serde_json::to_string(&self.also_known_as).unwrap_or_else(|_| "[]".to_string());

        match existing {
            Some(mut actor) => {
                actor.actor_type = self.actor_type;
                actor.inbox_url = self.inbox_url;
                actor.shared_inbox_url = self.shared_inbox_url;
                actor.followers_url = self.followers_url;
                actor.featured_url = self.featured_url;
                actor.public_key_pem = self.public_key_pem;
                actor.locked = self.locked;
                actor.also_known_as = also_known_as;
                actor.last_refreshed_at = Some(now);
                actor.updated_at = now;
                actor
            }
            None => Actor {
                id: EntityId::new().0,
                uri: self.uri,
                username: self.username,
                domain,
                actor_type: self.actor_type,
                inbox_url: self.inbox_url,
                shared_inbox_url: self.shared_inbox_url,
                followers_url: self.followers_url,
                featured_url: self.featured_url,
                public_key_pem: self.public_key_pem,
                private_key_pem: None,
                locked: self.locked,
                silenced: false,
                suspended_at: None,
                deletion_request_at: None,
                moved_to_uri: self.moved_to,
                also_known_as,
                last_refreshed_at: Some(now),
                created_at: now,
                updated_at: now,
            },
        }
    }
}

/// Network access to remote actors and collections
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteActorFetcher: Send + Sync {
    /// Fetch and parse the actor document at `uri`.
    async fn fetch_actor(&self, uri: &str) -> Result<RemoteActorDocument, AppError>;

    /// Fetch a collection with a request signed as `signer` and return the
    /// ids of its items.
    async fn fetch_collection_items(&self, url: &str, signer: &Actor)
    -> Result<Vec<String>, AppError>;
}

/// [`RemoteActorFetcher`] over HTTP
pub struct HttpActorFetcher {
    http_client: reqwest::Client,
    allow_private_addresses: bool,
}

impl HttpActorFetcher {
    pub fn new(http_client: reqwest::Client, allow_private_addresses: bool) -> Self {
        Self {
            http_client,
            allow_private_addresses,
        }
    }

    async fn get_json(&self, url: &str, signer: Option<&Actor>) -> Result<Value, AppError> {
        ensure_remote_destination(url, self.allow_private_addresses).await?;

        let mut request = self
            .http_client
            .get(url)
            .header("Accept", "application/activity+json, application/ld+json");

        if let Some(signer) = signer {
            let private_key = signer
                .private_key_pem
                .as_deref()
                .ok_or_else(|| AppError::Validation("Signer has no private key".to_string()))?;
            let signed = sign_request("GET", url, None, private_key, &signer.key_id())?;
            request = request
                .header("Date", signed.date)
                .header("Signature", signed.signature);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch {}: HTTP {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse {}: {}", url, e)))
    }
}

#[async_trait]
impl RemoteActorFetcher for HttpActorFetcher {
    async fn fetch_actor(&self, uri: &str) -> Result<RemoteActorDocument, AppError> {
        let uri = strip_fragment(uri);
        let document = RemoteActorDocument::from_json(&self.get_json(uri, None).await?)?;

        if document.uri != uri {
            return Err(AppError::Federation(format!(
                "Actor document id {} does not match {}",
                document.uri, uri
            )));
        }

        Ok(document)
    }

    async fn fetch_collection_items(
        &self,
        url: &str,
        signer: &Actor,
    ) -> Result<Vec<String>, AppError> {
        let collection = self.get_json(url, Some(signer)).await?;
        let items = |value: &Value| {
            let mut ids = string_list(value.get("orderedItems"));
            ids.extend(string_list(value.get("items")));
            ids
        };

        match collection.get("first") {
            Some(page @ Value::Object(_)) => Ok(items(page)),
            Some(Value::String(page_url)) => {
                let page = self.get_json(page_url, Some(signer)).await?;
                Ok(items(&page))
            }
            _ => Ok(items(&collection)),
        }
    }
}

/// Cached actor entry
#[derive(Debug, Clone)]
struct CachedActor {
    actor: Actor,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedActor {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}

/// Resolves actor URIs (or key ids) to stored actors with public keys.
pub struct KeyResolver {
    db: Arc<Database>,
    fetcher: Arc<dyn RemoteActorFetcher>,
    /// actor URI -> cached actor
    cache: RwLock<HashMap<String, CachedActor>>,
    default_ttl: Duration,
}

impl KeyResolver {
    pub fn new(
        db: Arc<Database>,
        fetcher: Arc<dyn RemoteActorFetcher>,
        default_ttl: Option<Duration>,
    ) -> Self {
        Self {
            db,
            fetcher,
            cache: RwLock::new(HashMap::new()),
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }

    pub fn fetcher(&self) -> &Arc<dyn RemoteActorFetcher> {
        &self.fetcher
    }

    /// Resolve an actor URI or key id.
    ///
    /// Unknown remote actors are fetched once and stored; later calls are
    /// served from the cache or the database.
    pub async fn resolve(&self, uri_or_key_id: &str) -> Result<Actor, AppError> {
        let uri = strip_fragment(uri_or_key_id);

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(uri) {
                if cached.is_valid() {
                    tracing::debug!(actor = uri, "Actor cache hit");
                    return Ok(cached.actor.clone());
                }
            }
        }

        let actor = match self.db.get_actor_by_uri(uri).await? {
            Some(actor) => actor,
            None => self.fetch_and_store(uri, None).await?,
        };

        self.remember(&actor).await;
        Ok(actor)
    }

    /// Look up an actor without touching the network.
    pub async fn find_stored(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        self.db.get_actor_by_uri(strip_fragment(uri)).await
    }

    /// Re-fetch a remote actor and store the refreshed profile and key.
    pub async fn refresh(&self, actor: &Actor) -> Result<Actor, AppError> {
        if actor.is_local() {
            return Ok(actor.clone());
        }
        self.invalidate(&actor.uri).await;
        let refreshed = self.fetch_and_store(&actor.uri, Some(actor.clone())).await?;
        self.remember(&refreshed).await;
        Ok(refreshed)
    }

    async fn fetch_and_store(&self, uri: &str, existing: Option<Actor>) -> Result<Actor, AppError> {
        tracing::debug!(actor = uri, "Fetching remote actor");
        let document = match self.fetcher.fetch_actor(uri).await {
            Ok(document) => {
                REMOTE_KEY_FETCHES.with_label_values(&["success"]).inc();
                document
            }
            Err(error) => {
                REMOTE_KEY_FETCHES.with_label_values(&["failure"]).inc();
                return Err(error);
            }
        };

        if authority_of(&document.uri) != authority_of(uri) {
            return Err(AppError::Federation(format!(
                "Actor document for {} is hosted elsewhere",
                uri
            )));
        }

        let is_new = existing.is_none();
        let actor = document.into_actor(existing);
        if is_new {
            self.db.insert_actor(&actor).await?;
        } else {
            self.db.update_remote_actor(&actor).await?;
        }
        Ok(actor)
    }

    async fn remember(&self, actor: &Actor) {
        let mut cache = self.cache.write().await;
        cache.insert(
            actor.uri.clone(),
            CachedActor {
                actor: actor.clone(),
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }

    /// Invalidate a cached actor
    pub async fn invalidate(&self, uri: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(strip_fragment(uri));
        tracing::debug!(actor = uri, "Invalidated actor cache entry");
    }

    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache.values().filter(|v| v.is_valid()).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.is_valid());
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired actor cache entries", removed);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) fn remote_document(uri: &str, public_key_pem: Option<&str>) -> RemoteActorDocument {
        RemoteActorDocument {
            uri: uri.to_string(),
            username: uri.rsplit('/').next().unwrap_or_default().to_string(),
            actor_type: "Person".to_string(),
            inbox_url: format!("{}/inbox", uri),
            shared_inbox_url: None,
            followers_url: format!("{}/followers", uri),
            featured_url: None,
            public_key_id: Some(format!("{}#main-key", uri)),
            public_key_pem: public_key_pem.map(str::to_string),
            locked: false,
            also_known_as: Vec::new(),
            moved_to: None,
        }
    }

    async fn test_db() -> (Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db")).await.unwrap();
        (Arc::new(db), temp_dir)
    }

    #[test]
    fn parses_actor_document() {
        let document = RemoteActorDocument::from_json(&json!({
            "id": "https://remote.example/users/bob",
            "type": "Group",
            "preferredUsername": "bob",
            "inbox": "https://remote.example/users/bob/inbox",
            "followers": "https://remote.example/users/bob/followers",
            "endpoints": { "sharedInbox": "https://remote.example/inbox" },
            "manuallyApprovesFollowers": true,
            "alsoKnownAs": "https://old.example/users/bob",
            "publicKey": {
                "id": "https://remote.example/users/bob#main-key",
                "publicKeyPem": "PEM"
            }
        }))
        .unwrap();

        assert_eq!(document.actor_type, "Group");
        assert_eq!(document.shared_inbox_url.as_deref(), Some("https://remote.example/inbox"));
        assert!(document.locked);
        assert_eq!(document.also_known_as, vec!["https://old.example/users/bob".to_string()]);
        assert_eq!(document.public_key_pem.as_deref(), Some("PEM"));

        let actor = document.into_actor(None);
        assert_eq!(actor.domain.as_deref(), Some("remote.example"));
        assert!(actor.is_group());
    }

    #[test]
    fn rejects_actor_without_inbox() {
        assert!(RemoteActorDocument::from_json(&json!({ "id": "https://remote.example/x" })).is_err());
    }

    #[tokio::test]
    async fn resolve_fetches_unknown_actor_once() {
        let (db, _dir) = test_db().await;
        let uri = "https://remote.example/users/bob";

        let mut fetcher = MockRemoteActorFetcher::new();
        fetcher
            .expect_fetch_actor()
            .times(1)
            .returning(|uri| Ok(remote_document(uri, Some("PEM"))));

        let resolver = KeyResolver::new(db.clone(), Arc::new(fetcher), None);
        let first = resolver.resolve(&format!("{}#main-key", uri)).await.unwrap();
        let second = resolver.resolve(uri).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(db.get_actor_by_uri(uri).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resolve_rejects_document_from_other_host() {
        let (db, _dir) = test_db().await;

        let mut fetcher = MockRemoteActorFetcher::new();
        fetcher
            .expect_fetch_actor()
            .returning(|_| Ok(remote_document("https://evil.example/users/bob", Some("PEM"))));

        let resolver = KeyResolver::new(db, Arc::new(fetcher), None);
        assert!(resolver.resolve("https://remote.example/users/bob").await.is_err());
    }

    #[tokio::test]
    async fn cache_entries_expire() {
        let (db, _dir) = test_db().await;
        let resolver = KeyResolver::new(
            db,
            Arc::new(MockRemoteActorFetcher::new()),
            Some(Duration::from_millis(50)),
        );
        resolver
            .remember(&remote_document("https://remote.example/users/bob", None).into_actor(None))
            .await;

        assert_eq!(resolver.stats().await.valid_entries, 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(resolver.stats().await.expired_entries, 1);

        resolver.prune_expired().await;
        assert_eq!(resolver.stats().await.total_entries, 0);
    }
}
