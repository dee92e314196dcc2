//! URI generation and addressing
//!
//! `TagManager` is constructed from the server configuration and passed to
//! whatever needs local URIs or `to`/`cc` audiences; it holds no other state.

use std::collections::HashSet;

use crate::config::ServerConfig;
use crate::data::{Actor, Status, Visibility};

/// ActivityStreams public collection
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Host of a URL including an explicit non-default port, lowercased.
///
/// Used as the "domain" of actors and for same-origin comparisons.
pub fn authority_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// URI without its fragment part (`actor#main-key` -> `actor`).
pub fn strip_fragment(uri: &str) -> &str {
    uri.split('#').next().unwrap_or(uri)
}

/// Inputs for computing the addressing of a status
#[derive(Debug, Clone, Copy)]
pub struct StatusAudience<'a> {
    pub status: &'a Status,
    pub author: &'a Actor,
    pub mentions: &'a [Actor],
    /// Author of the reblogged status, when `status` is a reblog
    pub reblogged_author: Option<&'a Actor>,
    /// Followers and follow requesters of the author; only consulted when
    /// the author is silenced
    pub author_reach: &'a HashSet<String>,
}

impl<'a> StatusAudience<'a> {
    /// Mentioned accounts the status may reach.
    ///
    /// A silenced author only reaches mentioned accounts that follow them or
    /// asked to. Direct statuses always reach every mentioned account.
    pub fn reachable_mentions(&self) -> Vec<&'a Actor> {
        let restricted =
            self.author.silenced && self.status.visibility() != Visibility::Direct;
        self.mentions
            .iter()
            .filter(|mentioned| !restricted || self.author_reach.contains(&mentioned.id))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct TagManager {
    base_url: String,
    domain: String,
}

impl TagManager {
    pub fn new(server: &ServerConfig) -> Self {
        let base_url = server.base_url();
        let domain = authority_of(&base_url).unwrap_or_else(|| server.domain.to_ascii_lowercase());
        Self { base_url, domain }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn actor_uri(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url, username)
    }

    pub fn inbox_url(&self, username: &str) -> String {
        format!("{}/inbox", self.actor_uri(username))
    }

    pub fn shared_inbox_url(&self) -> String {
        format!("{}/inbox", self.base_url)
    }

    pub fn followers_url(&self, username: &str) -> String {
        format!("{}/followers", self.actor_uri(username))
    }

    pub fn featured_url(&self, username: &str) -> String {
        format!("{}/collections/featured", self.actor_uri(username))
    }

    pub fn followers_synchronization_url(&self, username: &str) -> String {
        format!("{}/followers_synchronization", self.actor_uri(username))
    }

    pub fn status_uri(&self, username: &str, status_id: &str) -> String {
        format!("{}/statuses/{}", self.actor_uri(username), status_id)
    }

    /// Id of the Create/Announce activity wrapping a local status.
    pub fn activity_uri_for(&self, status_uri: &str) -> String {
        format!("{}/activity", status_uri)
    }

    /// Fresh id for a standalone activity (Follow, Accept, Undo, ...).
    ///
    /// Relay follows use this bare `{base}/{id}` form, which is how an Accept
    /// from a relay is recognized.
    pub fn generate_activity_id(&self) -> String {
        format!("{}/{}", self.base_url, ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn uri_for<'a>(&self, actor: &'a Actor) -> &'a str {
        &actor.uri
    }

    pub fn followers_uri_for<'a>(&self, actor: &'a Actor) -> &'a str {
        &actor.followers_url
    }

    pub fn local_uri(&self, uri: &str) -> bool {
        authority_of(uri).is_some_and(|authority| authority == self.domain)
    }

    /// Username of a local actor URI (`{base}/users/{username}`).
    pub fn local_username(&self, uri: &str) -> Option<String> {
        if !self.local_uri(uri) {
            return None;
        }
        let parsed = url::Url::parse(strip_fragment(uri)).ok()?;
        let mut segments = parsed.path_segments()?;
        match (segments.next(), segments.next(), segments.next()) {
            (Some("users"), Some(username), None) if !username.is_empty() => {
                Some(username.to_string())
            }
            _ => None,
        }
    }

    /// Primary audience of a status.
    pub fn to(&self, audience: &StatusAudience<'_>) -> Vec<String> {
        match audience.status.visibility() {
            Visibility::Public => vec![PUBLIC_COLLECTION.to_string()],
            Visibility::Unlisted | Visibility::Private => {
                vec![self.followers_uri_for(audience.author).to_string()]
            }
            Visibility::Direct => {
                let mut to = Vec::new();
                for mentioned in audience.reachable_mentions() {
                    push_unique(&mut to, self.uri_for(mentioned));
                    if mentioned.is_group() {
                        push_unique(&mut to, self.followers_uri_for(mentioned));
                    }
                }
                to
            }
        }
    }

    /// Secondary audience of a status.
    pub fn cc(&self, audience: &StatusAudience<'_>) -> Vec<String> {
        let mut cc = Vec::new();

        match audience.status.visibility() {
            Visibility::Public => cc.push(self.followers_uri_for(audience.author).to_string()),
            Visibility::Unlisted => cc.push(PUBLIC_COLLECTION.to_string()),
            Visibility::Private => {}
            Visibility::Direct => return cc,
        }

        if let Some(original_author) = audience.reblogged_author {
            push_unique(&mut cc, self.uri_for(original_author));
        }

        for mentioned in audience.reachable_mentions() {
            push_unique(&mut cc, self.uri_for(mentioned));
        }

        cc
    }
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|existing| existing == value) {
        values.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EntityId;
    use chrono::Utc;

    fn manager() -> TagManager {
        TagManager::new(&ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            domain: "local.test".to_string(),
            protocol: "https".to_string(),
        })
    }

    fn actor(uri: &str, domain: Option<&str>) -> Actor {
        Actor {
            id: EntityId::new().0,
            uri: uri.to_string(),
            username: uri.rsplit('/').next().unwrap().to_string(),
            domain: domain.map(str::to_string),
            actor_type: "Person".to_string(),
            inbox_url: format!("{}/inbox", uri),
            shared_inbox_url: None,
            followers_url: format!("{}/followers", uri),
            featured_url: None,
            public_key_pem: None,
            private_key_pem: None,
            locked: false,
            silenced: false,
            suspended_at: None,
            deletion_request_at: None,
            moved_to_uri: None,
            also_known_as: "[]".to_string(),
            last_refreshed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn status(author: &Actor, visibility: Visibility) -> Status {
        Status {
            id: EntityId::new().0,
            uri: format!("{}/statuses/1", author.uri),
            account_id: author.id.clone(),
            visibility: visibility.as_str().to_string(),
            content: String::new(),
            reblog_of_id: None,
            in_reply_to_uri: None,
            local: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn audience<'a>(
        status: &'a Status,
        author: &'a Actor,
        mentions: &'a [Actor],
        reach: &'a HashSet<String>,
    ) -> StatusAudience<'a> {
        StatusAudience {
            status,
            author,
            mentions,
            reblogged_author: None,
            author_reach: reach,
        }
    }

    #[test]
    fn public_status_addresses_public_then_followers() {
        let tags = manager();
        let author = actor("https://local.test/users/alice", None);
        let status = status(&author, Visibility::Public);
        let reach = HashSet::new();
        let audience = audience(&status, &author, &[], &reach);

        assert_eq!(tags.to(&audience), vec![PUBLIC_COLLECTION.to_string()]);
        assert_eq!(tags.cc(&audience), vec![author.followers_url.clone()]);
    }

    #[test]
    fn unlisted_and_private_statuses_address_followers() {
        let tags = manager();
        let author = actor("https://local.test/users/alice", None);
        let reach = HashSet::new();

        let unlisted = status(&author, Visibility::Unlisted);
        let audience_unlisted = audience(&unlisted, &author, &[], &reach);
        assert_eq!(tags.to(&audience_unlisted), vec![author.followers_url.clone()]);
        assert_eq!(tags.cc(&audience_unlisted), vec![PUBLIC_COLLECTION.to_string()]);

        let private = status(&author, Visibility::Private);
        let audience_private = audience(&private, &author, &[], &reach);
        assert_eq!(tags.to(&audience_private), vec![author.followers_url.clone()]);
        assert!(tags.cc(&audience_private).is_empty());
    }

    #[test]
    fn direct_status_to_group_includes_group_followers() {
        let tags = manager();
        let author = actor("https://local.test/users/alice", None);
        let mut group = actor("https://remote.org/group", Some("remote.org"));
        group.actor_type = "Group".to_string();
        let status = status(&author, Visibility::Direct);
        let reach = HashSet::new();
        let mentions = [group.clone()];
        let audience = audience(&status, &author, &mentions, &reach);

        let to = tags.to(&audience);
        assert!(to.contains(&group.uri));
        assert!(to.contains(&group.followers_url));
        assert!(tags.cc(&audience).is_empty());
    }

    #[test]
    fn silenced_author_only_reaches_followers_and_requesters() {
        let tags = manager();
        let mut author = actor("https://local.test/users/author", None);
        author.silenced = true;
        let bob = actor("https://local.test/users/bob", None);
        let alice = actor("https://local.test/users/alice", None);
        let foo = actor("https://remote.example/users/foo", Some("remote.example"));
        let reach: HashSet<String> = [bob.id.clone(), foo.id.clone()].into_iter().collect();
        let mentions = [alice.clone(), bob.clone(), foo.clone()];

        let public = status(&author, Visibility::Public);
        let cc = tags.cc(&audience(&public, &author, &mentions, &reach));
        assert!(cc.contains(&bob.uri));
        assert!(cc.contains(&foo.uri));
        assert!(!cc.contains(&alice.uri));
    }

    #[test]
    fn silenced_author_direct_status_addresses_every_mention() {
        let tags = manager();
        let mut author = actor("https://local.test/users/author", None);
        author.silenced = true;
        let bob = actor("https://local.test/users/bob", None);
        let stranger = actor("https://s.example/users/s", Some("s.example"));
        let reach: HashSet<String> = [bob.id.clone()].into_iter().collect();
        let mentions = [bob.clone(), stranger.clone()];

        let direct = status(&author, Visibility::Direct);
        let to = tags.to(&audience(&direct, &author, &mentions, &reach));
        assert_eq!(to, vec![bob.uri.clone(), stranger.uri.clone()]);
    }

    #[test]
    fn reblog_cc_includes_original_author() {
        let tags = manager();
        let author = actor("https://local.test/users/alice", None);
        let original_author = actor("https://remote.example/users/bob", Some("remote.example"));
        let mut reblog = status(&author, Visibility::Public);
        reblog.reblog_of_id = Some(EntityId::new().0);
        let reach = HashSet::new();
        let mut audience = audience(&reblog, &author, &[], &reach);
        audience.reblogged_author = Some(&original_author);

        assert!(tags.cc(&audience).contains(&original_author.uri));
    }

    #[test]
    fn local_uri_and_username_resolution() {
        let tags = manager();
        assert!(tags.local_uri("https://local.test/users/alice"));
        assert!(!tags.local_uri("http://example.com/123"));
        assert_eq!(
            tags.local_username("https://local.test/users/alice#main-key").as_deref(),
            Some("alice")
        );
        assert_eq!(tags.local_username("https://local.test/users/alice/statuses/1"), None);
    }

    #[test]
    fn authority_keeps_explicit_port() {
        assert_eq!(authority_of("http://127.0.0.1:3000/inbox").as_deref(), Some("127.0.0.1:3000"));
        assert_eq!(authority_of("https://Example.COM/inbox").as_deref(), Some("example.com"));
        assert_eq!(strip_fragment("https://example.com/123#456"), "https://example.com/123");
    }
}
