//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time in unix milliseconds, the unit of queue timestamps.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// Actor
// =============================================================================

/// A local or remote federation identity
///
/// Local actors have `domain == None` and hold a private key; remote actors
/// only carry the public key used to verify what they send.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// ActivityPub id (globally unique)
    pub uri: String,
    pub username: String,
    /// `None` for local actors
    pub domain: Option<String>,
    /// Person, Service, Group, Application, Organization
    pub actor_type: String,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub followers_url: String,
    pub featured_url: Option<String>,
    pub public_key_pem: Option<String>,
    /// Only present for local actors
    pub private_key_pem: Option<String>,
    /// Follows need manual approval
    pub locked: bool,
    pub silenced: bool,
    pub suspended_at: Option<DateTime<Utc>>,
    /// Pending account deletion; a suspension with a pending deletion
    /// request is still reversible.
    pub deletion_request_at: Option<DateTime<Utc>>,
    pub moved_to_uri: Option<String>,
    /// JSON array of URIs
    pub also_known_as: String,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    pub fn is_local(&self) -> bool {
        self.domain.is_none()
    }

    /// Whether this actor can sign outbound activities.
    pub fn can_sign(&self) -> bool {
        self.is_local() && self.private_key_pem.is_some()
    }

    pub fn is_group(&self) -> bool {
        self.actor_type.eq_ignore_ascii_case("Group")
    }

    /// Shared inbox when the remote server advertises one, personal inbox otherwise.
    pub fn preferred_inbox_url(&self) -> &str {
        self.shared_inbox_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or(&self.inbox_url)
    }

    /// Key id used in HTTP signatures for this actor.
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.uri)
    }

    pub fn suspension(&self) -> SuspensionState {
        match (self.suspended_at, self.deletion_request_at) {
            (None, _) => SuspensionState::Active,
            (Some(_), Some(_)) => SuspensionState::Temporary,
            (Some(_), None) => SuspensionState::Permanent,
        }
    }

    pub fn also_known_as_uris(&self) -> Vec<String> {
        serde_json::from_str(&self.also_known_as).unwrap_or_default()
    }
}

/// How an account's suspension is seen by federation endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspensionState {
    Active,
    /// Suspended with a pending deletion request (reversible)
    Temporary,
    /// Suspended and the deletion request was carried out
    Permanent,
}

// =============================================================================
// Relationships
// =============================================================================

/// A follow or follow request edge
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Relationship {
    pub id: String,
    pub account_id: String,
    pub target_account_id: String,
    /// Origin activity URI, used for idempotent de-duplication
    pub uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A block edge
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Block {
    pub id: String,
    pub account_id: String,
    pub target_account_id: String,
    /// URI of the last Block activity applied to this edge
    pub uri: Option<String>,
    /// Timestamp of the last Block activity applied to this edge
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Kind of edge or object an ordering record refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneKind {
    Follow,
    Block,
    Announce,
    /// Delete received before the Create it removes
    Status,
}

impl TombstoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Block => "block",
            Self::Announce => "announce",
            Self::Status => "status",
        }
    }
}

/// Ordering record left behind by an Undo or Delete
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UndoTombstone {
    pub id: String,
    pub actor_id: String,
    pub kind: String,
    pub object_uri: Option<String>,
    pub target_account_id: Option<String>,
    pub undone_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Relays
// =============================================================================

/// Relay subscription state machine: idle -> pending -> accepted | rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Pending,
    Accepted,
    Rejected,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "accepted" => Self::Accepted,
            "rejected" => Self::Rejected,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Relay {
    pub id: String,
    pub inbox_url: String,
    /// Sentinel id of the Follow sent to the relay
    pub follow_activity_id: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relay {
    pub fn relay_state(&self) -> RelayState {
        RelayState::parse(&self.state)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    /// Followers-only
    Private,
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::Private => "private",
            Self::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Self::Public),
            "unlisted" => Some(Self::Unlisted),
            "private" => Some(Self::Private),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

/// A post; local or remote, possibly a reblog of another status
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Status {
    pub id: String,
    pub uri: String,
    pub account_id: String,
    /// public, unlisted, private, direct
    pub visibility: String,
    pub content: String,
    /// Reblogged status; a reblog never points at another reblog
    pub reblog_of_id: Option<String>,
    pub in_reply_to_uri: Option<String>,
    pub local: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Status {
    pub fn visibility(&self) -> Visibility {
        Visibility::parse(&self.visibility).unwrap_or(Visibility::Public)
    }

    pub fn is_reblog(&self) -> bool {
        self.reblog_of_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub id: String,
    pub status_id: String,
    pub account_id: String,
    /// JSON array of option titles
    pub options: String,
    pub expires_at: DateTime<Utc>,
    /// Set once when the expiry notification fan-out ran
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Poll {
    pub fn option_titles(&self) -> Vec<String> {
        serde_json::from_str(&self.options).unwrap_or_default()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollVote {
    pub id: String,
    pub poll_id: String,
    pub account_id: String,
    pub choice: i64,
    pub uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Local notification
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    pub account_id: String,
    /// Type of the object the notification is about, e.g. "Poll", "Follow"
    pub activity_type: String,
    pub activity_id: String,
    /// poll, follow, follow_request, mention
    pub kind: String,
    pub from_account_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Delivery
// =============================================================================

/// One (activity, destination inbox) pair queued for outbound send
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryTask {
    pub id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub sender_actor_id: String,
    pub inbox_url: String,
    /// Serialized activity JSON
    pub payload: String,
    /// Attach a Collection-Synchronization header for the sender's followers
    pub synchronize_followers: bool,
    pub attempts: i64,
    pub next_attempt_at_ms: i64,
    pub claimed_until_ms: Option<i64>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InboxFailure {
    pub inbox_url: String,
    pub consecutive_failures: i64,
    pub unreachable_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Cached followers digest for an (actor, domain) pair
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CollectionSyncRecord {
    pub id: String,
    pub actor_id: String,
    pub domain: String,
    pub digest: String,
    pub computed_at: DateTime<Utc>,
    pub sync_requested_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Jobs
// =============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub payload: String,
    pub run_at_ms: i64,
    pub lock_key: Option<String>,
    pub attempts: i64,
    /// Lease of the runner holding the job
    pub claimed_until_ms: Option<i64>,
    /// Lock key the job was claimed under; `lock_key` is cleared on claim
    pub claimed_lock_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(domain: Option<&str>) -> Actor {
        Actor {
            id: EntityId::new().0,
            uri: "https://remote.example/users/bob".to_string(),
            username: "bob".to_string(),
            domain: domain.map(str::to_string),
            actor_type: "Person".to_string(),
            inbox_url: "https://remote.example/users/bob/inbox".to_string(),
            shared_inbox_url: None,
            followers_url: "https://remote.example/users/bob/followers".to_string(),
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

    #[test]
    fn preferred_inbox_falls_back_to_personal_inbox() {
        let mut remote = actor(Some("remote.example"));
        assert_eq!(
            remote.preferred_inbox_url(),
            "https://remote.example/users/bob/inbox"
        );

        remote.shared_inbox_url = Some("https://remote.example/inbox".to_string());
        assert_eq!(remote.preferred_inbox_url(), "https://remote.example/inbox");
    }

    #[test]
    fn only_local_actors_with_private_key_can_sign() {
        let mut remote = actor(Some("remote.example"));
        remote.private_key_pem = Some("pem".to_string());
        assert!(!remote.can_sign());

        let mut local = actor(None);
        assert!(!local.can_sign());
        local.private_key_pem = Some("pem".to_string());
        assert!(local.can_sign());
    }

    #[test]
    fn suspension_state_distinguishes_reversible_suspensions() {
        let mut account = actor(None);
        assert_eq!(account.suspension(), SuspensionState::Active);

        account.suspended_at = Some(Utc::now());
        account.deletion_request_at = Some(Utc::now());
        assert_eq!(account.suspension(), SuspensionState::Temporary);

        account.deletion_request_at = None;
        assert_eq!(account.suspension(), SuspensionState::Permanent);
    }

    #[test]
    fn visibility_parses_known_values_only() {
        assert_eq!(Visibility::parse("private"), Some(Visibility::Private));
        assert_eq!(Visibility::parse("limited"), None);
    }
}
