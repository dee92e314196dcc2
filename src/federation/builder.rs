//! ActivityPub JSON builders
//!
//! Plain constructors for the activities this server sends. Addressing is
//! computed by [`TagManager`](super::TagManager) and passed in.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use crate::data::{Actor, Poll, Status};

pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Reference to a Follow inside Accept/Reject/Undo.
pub fn follow_object(id: &str, actor: &str, object: &str) -> Value {
    json!({
        "id": id,
        "type": "Follow",
        "actor": actor,
        "object": object
    })
}

/// Build a Follow activity
///
/// # Arguments
/// * `id` - Activity ID (unique URI)
/// * `actor` - Actor URI (follower)
/// * `object` - Object URI (followee)
pub fn follow(id: &str, actor: &str, object: &str) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "type": "Follow",
        "id": id,
        "actor": actor,
        "object": object
    })
}

/// Build an Accept activity
///
/// # Arguments
/// * `id` - Activity ID (unique URI)
/// * `actor` - Actor URI (accepter)
/// * `object` - Original activity being accepted (usually a Follow)
pub fn accept(id: &str, actor: &str, object: Value) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "type": "Accept",
        "id": id,
        "actor": actor,
        "object": object
    })
}

pub fn reject(id: &str, actor: &str, object: Value) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "type": "Reject",
        "id": id,
        "actor": actor,
        "object": object
    })
}

/// Build an Undo activity
///
/// # Arguments
/// * `id` - Activity ID (unique URI)
/// * `actor` - Actor URI (undoer)
/// * `object` - Original activity being undone
pub fn undo(id: &str, actor: &str, object: Value) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "type": "Undo",
        "id": id,
        "actor": actor,
        "object": object
    })
}

pub fn create(id: &str, actor: &str, object: Value, to: &[String], cc: &[String]) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "type": "Create",
        "id": id,
        "actor": actor,
        "published": object.get("published").cloned().unwrap_or(Value::Null),
        "to": to,
        "cc": cc,
        "object": object
    })
}

pub fn update(id: &str, actor: &str, object: Value, to: &[String], cc: &[String]) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "type": "Update",
        "id": id,
        "actor": actor,
        "published": timestamp(Utc::now()),
        "to": to,
        "cc": cc,
        "object": object
    })
}

/// Build an Announce activity (boost/reblog)
pub fn announce(
    id: &str,
    actor: &str,
    object: &str,
    published: DateTime<Utc>,
    to: &[String],
    cc: &[String],
) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "type": "Announce",
        "id": id,
        "actor": actor,
        "published": timestamp(published),
        "to": to,
        "cc": cc,
        "object": object
    })
}

pub fn delete(id: &str, actor: &str, object: &str, to: &[String]) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "type": "Delete",
        "id": id,
        "actor": actor,
        "to": to,
        "object": {
            "type": "Tombstone",
            "id": object
        }
    })
}

/// Note (or Question, when `poll` is set) for a local status.
pub fn status_object(
    status: &Status,
    author: &Actor,
    mentions: &[Actor],
    poll: Option<(&Poll, &[i64])>,
    to: &[String],
    cc: &[String],
) -> Value {
    let tag: Vec<Value> = mentions
        .iter()
        .map(|mentioned| {
            json!({
                "type": "Mention",
                "href": mentioned.uri,
                "name": mention_name(mentioned)
            })
        })
        .collect();

    let mut object = json!({
        "id": status.uri,
        "type": "Note",
        "attributedTo": author.uri,
        "content": status.content,
        "published": timestamp(status.created_at),
        "inReplyTo": status.in_reply_to_uri,
        "to": to,
        "cc": cc,
        "tag": tag
    });

    if let Some((poll, votes)) = poll {
        let options: Vec<Value> = poll
            .option_titles()
            .iter()
            .enumerate()
            .map(|(index, title)| {
                json!({
                    "type": "Note",
                    "name": title,
                    "replies": {
                        "type": "Collection",
                        "totalItems": votes.get(index).copied().unwrap_or(0)
                    }
                })
            })
            .collect();

        object["type"] = json!("Question");
        object["oneOf"] = Value::Array(options);
        object["endTime"] = json!(timestamp(poll.expires_at));
        if poll.is_expired_at(Utc::now()) {
            object["closed"] = json!(timestamp(poll.expires_at));
        }
    }

    object
}

/// Create of a poll answer, addressed to the poll's author only.
pub fn vote(id: &str, voter: &Actor, question_uri: &str, question_author: &str, choice: &str) -> Value {
    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "type": "Create",
        "id": format!("{}/activity", id),
        "actor": voter.uri,
        "to": [question_author],
        "object": {
            "id": id,
            "type": "Note",
            "name": choice,
            "attributedTo": voter.uri,
            "inReplyTo": question_uri,
            "to": [question_author]
        }
    })
}

fn mention_name(actor: &Actor) -> String {
    match &actor.domain {
        Some(domain) => format!("@{}@{}", actor.username, domain),
        None => format!("@{}", actor.username),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn author() -> Actor {
        Actor {
            id: "a1".to_string(),
            uri: "https://local.test/users/alice".to_string(),
            username: "alice".to_string(),
            domain: None,
            actor_type: "Person".to_string(),
            inbox_url: "https://local.test/users/alice/inbox".to_string(),
            shared_inbox_url: None,
            followers_url: "https://local.test/users/alice/followers".to_string(),
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

    fn status() -> Status {
        Status {
            id: "s1".to_string(),
            uri: "https://local.test/users/alice/statuses/s1".to_string(),
            account_id: "a1".to_string(),
            visibility: "public".to_string(),
            content: "<p>hello</p>".to_string(),
            reblog_of_id: None,
            in_reply_to_uri: None,
            local: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_object_is_a_note_with_mentions() {
        let mut mentioned = author();
        mentioned.uri = "https://remote.example/users/bob".to_string();
        mentioned.username = "bob".to_string();
        mentioned.domain = Some("remote.example".to_string());

        let object = status_object(&status(), &author(), &[mentioned], None, &[], &[]);
        assert_eq!(object["type"], "Note");
        assert_eq!(object["tag"][0]["href"], "https://remote.example/users/bob");
        assert_eq!(object["tag"][0]["name"], "@bob@remote.example");
    }

    #[test]
    fn expired_poll_becomes_closed_question() {
        let poll = Poll {
            id: "p1".to_string(),
            status_id: "s1".to_string(),
            account_id: "a1".to_string(),
            options: r#"["yes","no"]"#.to_string(),
            expires_at: Utc::now() - Duration::minutes(1),
            notified_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let object = status_object(&status(), &author(), &[], Some((&poll, &[3, 1])), &[], &[]);
        assert_eq!(object["type"], "Question");
        assert_eq!(object["oneOf"][0]["name"], "yes");
        assert_eq!(object["oneOf"][0]["replies"]["totalItems"], 3);
        assert!(object.get("closed").is_some());
    }

    #[test]
    fn undo_wraps_follow_reference() {
        let activity = undo(
            "https://local.test/01",
            "https://local.test/users/alice",
            follow_object(
                "https://local.test/02",
                "https://local.test/users/alice",
                "https://remote.example/users/bob",
            ),
        );
        assert_eq!(activity["object"]["type"], "Follow");
        assert_eq!(activity["object"]["object"], "https://remote.example/users/bob");
    }
}
