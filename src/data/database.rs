//! SQLite database operations
//!
//! All database access goes through this module.
//! Uses SQLx runtime queries; timestamps are stored as TEXT through the chrono
//! integration and compared in Rust, queue timestamps are unix milliseconds.

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool};
use std::ops::{Deref, DerefMut};
use std::collections::HashSet;
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Result of applying an inbound Block to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Created,
    /// Existing block now carries the newer activity's URI
    Updated,
    /// Existing block is newer than this activity
    Stale,
    /// An Undo for this block was already recorded
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct BlockApplied {
    pub outcome: BlockOutcome,
    /// Follow edges (either direction) removed together with the block
    pub severed_follows: Vec<Relationship>,
    /// Follow requests (either direction) removed together with the block
    pub severed_requests: Vec<Relationship>,
}

/// Result of applying an inbound Follow to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    Followed,
    Requested,
    AlreadyFollowing,
    AlreadyRequested,
    /// An Undo for this follow was already recorded
    Suppressed,
}

/// Result of accepting an outgoing follow request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    AlreadyFollowing,
    NoRequest,
}

/// Result of an Undo against a relationship edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    Removed,
    /// Target not present yet; an ordering record was left behind
    Recorded,
    /// Edge was re-applied by a newer activity
    Stale,
}

/// Whether an ordering record prevents applying an activity with the given
/// id, edge target and timestamp. Records win ties.
fn suppressed_by(
    tombstones: &[UndoTombstone],
    object_uri: Option<&str>,
    target_account_id: Option<&str>,
    at: DateTime<Utc>,
) -> bool {
    tombstones.iter().any(|tombstone| {
        let same_activity = matches!(
            (object_uri, tombstone.object_uri.as_deref()),
            (Some(uri), Some(recorded)) if uri == recorded
        );
        let same_edge = matches!(
            (target_account_id, tombstone.target_account_id.as_deref()),
            (Some(target), Some(recorded)) if target == recorded
        );
        same_activity || (same_edge && tombstone.undone_at >= at)
    })
}

const CONNECTION_TAKEN: &str = "transaction connection is only taken on drop";

/// A `BEGIN IMMEDIATE` transaction on a pooled connection.
///
/// Unless the transaction ends in a successful `COMMIT` or `ROLLBACK`, the
/// connection is detached from the pool on drop. Closing it rolls the
/// transaction back, so no pooled connection keeps a write lock.
struct ImmediateTransaction {
    conn: Option<PoolConnection<Sqlite>>,
    settled: bool,
}

impl ImmediateTransaction {
    async fn begin(pool: &SqlitePool) -> Result<Self, AppError> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self {
            conn: Some(conn),
            settled: false,
        })
    }

    /// Commit on `Ok`, roll back on `Err`, and hand `result` back.
    async fn finish<T>(mut self, result: Result<T, AppError>) -> Result<T, AppError> {
        match result {
            Ok(value) => {
                sqlx::query("COMMIT").execute(&mut *self).await?;
                self.settled = true;
                Ok(value)
            }
            Err(error) => {
                match sqlx::query("ROLLBACK").execute(&mut *self).await {
                    Ok(_) => self.settled = true,
                    Err(rollback_error) => {
                        tracing::error!(%rollback_error, "Rollback failed, discarding connection");
                    }
                }
                Err(error)
            }
        }
    }
}

impl Deref for ImmediateTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        self.conn.as_deref().expect(CONNECTION_TAKEN)
    }
}

impl DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        self.conn.as_deref_mut().expect(CONNECTION_TAKEN)
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(conn) = self.conn.take() {
            tracing::warn!("Transaction left open, closing its connection");
            drop(conn.detach());
        }
    }
}

/// Ordering records of `actor_id` naming either the activity or the edge
/// target; [`suppressed_by`] applies the timestamp rule.
async fn tombstones_for(
    conn: &mut SqliteConnection,
    actor_id: &str,
    kind: TombstoneKind,
    object_uri: &str,
    target_account_id: &str,
) -> Result<Vec<UndoTombstone>, AppError> {
    let rows = sqlx::query_as::<_, UndoTombstone>(
        r#"
        SELECT * FROM undo_tombstones
        WHERE actor_id = ? AND kind = ?
          AND (object_uri = ? OR target_account_id = ?)
        "#,
    )
    .bind(actor_id)
    .bind(kind.as_str())
    .bind(object_uri)
    .bind(target_account_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

async fn insert_tombstone(
    conn: &mut SqliteConnection,
    actor_id: &str,
    kind: TombstoneKind,
    object_uri: Option<&str>,
    target_account_id: Option<&str>,
    undone_at: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO undo_tombstones (id, actor_id, kind, object_uri, target_account_id, undone_at, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(EntityId::new().0)
    .bind(actor_id)
    .bind(kind.as_str())
    .bind(object_uri)
    .bind(target_account_id)
    .bind(undone_at)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn invalidate_sync_records(
    conn: &mut SqliteConnection,
    actor_ids: &[&str],
) -> Result<(), AppError> {
    for actor_id in actor_ids {
        sqlx::query("DELETE FROM collection_sync_records WHERE actor_id = ?")
            .bind(actor_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// URIs of the followers of `target_account_id` on `domain` (`None` = local).
async fn follower_uris_on_domain(
    conn: &mut SqliteConnection,
    target_account_id: &str,
    domain: Option<&str>,
) -> Result<Vec<String>, AppError> {
    let uris = match domain {
        Some(domain) => {
            sqlx::query_scalar::<_, String>(
                r#"
                SELECT a.uri FROM actors a
                JOIN follows f ON f.account_id = a.id
                WHERE f.target_account_id = ? AND a.domain = ? COLLATE NOCASE
                ORDER BY a.uri
                "#,
            )
            .bind(target_account_id)
            .bind(domain)
            .fetch_all(&mut *conn)
            .await?
        }
        None => {
            sqlx::query_scalar::<_, String>(
                r#"
                SELECT a.uri FROM actors a
                JOIN follows f ON f.account_id = a.id
                WHERE f.target_account_id = ? AND a.domain IS NULL
                ORDER BY a.uri
                "#,
            )
            .bind(target_account_id)
            .fetch_all(&mut *conn)
            .await?
        }
    };
    Ok(uris)
}

async fn upsert_sync_record(
    conn: &mut SqliteConnection,
    actor_id: &str,
    domain: &str,
    digest: &str,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO collection_sync_records (id, actor_id, domain, digest, computed_at, sync_requested_at)
        VALUES (?, ?, ?, ?, ?, NULL)
        ON CONFLICT(actor_id, domain) DO UPDATE SET
            digest = excluded.digest,
            computed_at = excluded.computed_at
        "#,
    )
    .bind(EntityId::new().0)
    .bind(actor_id)
    .bind(domain)
    .bind(digest)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn find_edge(
    conn: &mut SqliteConnection,
    table: &str,
    account_id: &str,
    target_account_id: &str,
) -> Result<Option<Relationship>, AppError> {
    let row = sqlx::query_as::<_, Relationship>(&format!(
        "SELECT id, account_id, target_account_id, uri, created_at FROM {} WHERE account_id = ? AND target_account_id = ?",
        table
    ))
    .bind(account_id)
    .bind(target_account_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn insert_edge(
    conn: &mut SqliteConnection,
    table: &str,
    account_id: &str,
    target_account_id: &str,
    uri: Option<&str>,
) -> Result<bool, AppError> {
    let result = sqlx::query(&format!(
        "INSERT OR IGNORE INTO {} (id, account_id, target_account_id, uri, created_at) VALUES (?, ?, ?, ?, ?)",
        table
    ))
    .bind(EntityId::new().0)
    .bind(account_id)
    .bind(target_account_id)
    .bind(uri)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn delete_edge(
    conn: &mut SqliteConnection,
    table: &str,
    account_id: &str,
    target_account_id: &str,
) -> Result<Option<Relationship>, AppError> {
    let row = sqlx::query_as::<_, Relationship>(&format!(
        "DELETE FROM {} WHERE account_id = ? AND target_account_id = ? RETURNING id, account_id, target_account_id, uri, created_at",
        table
    ))
    .bind(account_id)
    .bind(target_account_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to the SQLite database at `path`, creating it when missing,
    /// and run migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // Actors
    // =========================================================================

    pub async fn insert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (
                id, uri, username, domain, actor_type, inbox_url, shared_inbox_url,
                followers_url, featured_url, public_key_pem, private_key_pem, locked,
                silenced, suspended_at, deletion_request_at, moved_to_uri, also_known_as,
                last_refreshed_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.actor_type)
        .bind(&actor.inbox_url)
        .bind(&actor.shared_inbox_url)
        .bind(&actor.followers_url)
        .bind(&actor.featured_url)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.locked)
        .bind(actor.silenced)
        .bind(actor.suspended_at)
        .bind(actor.deletion_request_at)
        .bind(&actor.moved_to_uri)
        .bind(&actor.also_known_as)
        .bind(actor.last_refreshed_at)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    pub async fn get_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    pub async fn get_local_actor(&self, username: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE domain IS NULL AND username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    /// Refresh the federation-visible fields of a remote actor.
    pub async fn update_remote_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE actors SET
                actor_type = ?, inbox_url = ?, shared_inbox_url = ?, followers_url = ?,
                featured_url = ?, public_key_pem = ?, locked = ?, also_known_as = ?,
                last_refreshed_at = ?, updated_at = ?
            WHERE id = ? AND domain IS NOT NULL
            "#,
        )
        .bind(&actor.actor_type)
        .bind(&actor.inbox_url)
        .bind(&actor.shared_inbox_url)
        .bind(&actor.followers_url)
        .bind(&actor.featured_url)
        .bind(&actor.public_key_pem)
        .bind(actor.locked)
        .bind(&actor.also_known_as)
        .bind(actor.last_refreshed_at)
        .bind(Utc::now())
        .bind(&actor.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_actor_silenced(&self, id: &str, silenced: bool) -> Result<(), AppError> {
        sqlx::query("UPDATE actors SET silenced = ?, updated_at = ? WHERE id = ?")
            .bind(silenced)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Suspend an actor. With `reversible` the deletion request stays pending.
    pub async fn suspend_actor(&self, id: &str, reversible: bool) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE actors SET suspended_at = ?, deletion_request_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(if reversible { Some(now) } else { None })
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_actor_moved_to(&self, id: &str, moved_to_uri: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE actors SET moved_to_uri = ?, updated_at = ? WHERE id = ?")
            .bind(moved_to_uri)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Permanently suspend a remote actor that deleted itself and drop every
    /// relationship edge it takes part in.
    pub async fn remove_deleted_actor(&self, id: &str) -> Result<(), AppError> {
        let mut conn = ImmediateTransaction::begin(&self.pool).await?;

        let result: Result<(), AppError> = async {
            let now = Utc::now();
            sqlx::query(
                "UPDATE actors SET suspended_at = ?, deletion_request_at = NULL, updated_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?;

            let affected = sqlx::query_scalar::<_, String>(
                "SELECT target_account_id FROM follows WHERE account_id = ?",
            )
            .bind(id)
            .fetch_all(&mut *conn)
            .await?;

            for table in ["follows", "follow_requests", "blocks", "mutes"] {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE account_id = ? OR target_account_id = ?",
                    table
                ))
                .bind(id)
                .bind(id)
                .execute(&mut *conn)
                .await?;
            }

            let mut invalidated: Vec<&str> = affected.iter().map(String::as_str).collect();
            invalidated.push(id);
            invalidate_sync_records(&mut conn, &invalidated).await
        }
        .await;

        conn.finish(result).await
    }

    // =========================================================================
    // Follows
    // =========================================================================

    pub async fn is_following(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM follows WHERE account_id = ? AND target_account_id = ?",
        )
        .bind(account_id)
        .bind(target_account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn has_requested(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM follow_requests WHERE account_id = ? AND target_account_id = ?",
        )
        .bind(account_id)
        .bind(target_account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn get_follow(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let mut conn = self.pool.acquire().await?;
        find_edge(&mut conn, "follows", account_id, target_account_id).await
    }

    pub async fn get_follow_request(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let mut conn = self.pool.acquire().await?;
        find_edge(&mut conn, "follow_requests", account_id, target_account_id).await
    }

    /// Look up an outgoing follow request or follow by the URI of its Follow activity.
    pub async fn find_follow_edge_by_uri(
        &self,
        uri: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let row = sqlx::query_as::<_, Relationship>(
            r#"
            SELECT id, account_id, target_account_id, uri, created_at FROM follow_requests WHERE uri = ?
            UNION ALL
            SELECT id, account_id, target_account_id, uri, created_at FROM follows WHERE uri = ?
            LIMIT 1
            "#,
        )
        .bind(uri)
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Insert a follow edge directly (local follows, migrations of followers).
    pub async fn insert_follow(
        &self,
        account_id: &str,
        target_account_id: &str,
        uri: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut conn = ImmediateTransaction::begin(&self.pool).await?;
        let result: Result<bool, AppError> = async {
            let inserted =
                insert_edge(&mut conn, "follows", account_id, target_account_id, uri).await?;
            if inserted {
                invalidate_sync_records(&mut conn, &[target_account_id]).await?;
            }
            Ok(inserted)
        }
        .await;
        conn.finish(result).await
    }

    pub async fn insert_follow_request(
        &self,
        account_id: &str,
        target_account_id: &str,
        uri: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_edge(&mut conn, "follow_requests", account_id, target_account_id, uri).await
    }

    pub async fn delete_follow(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        let removed = delete_edge(&mut conn, "follows", account_id, target_account_id).await?;
        if removed.is_some() {
            invalidate_sync_records(&mut conn, &[target_account_id]).await?;
        }
        Ok(removed.is_some())
    }

    pub async fn delete_follow_request(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        let removed =
            delete_edge(&mut conn, "follow_requests", account_id, target_account_id).await?;
        Ok(removed.is_some())
    }

    /// Apply an inbound Follow from `account_id` to `target_account_id`.
    ///
    /// Creates a follow request when `needs_approval`, a follow otherwise. An
    /// Undo that already arrived for this follow suppresses it.
    pub async fn apply_follow(
        &self,
        account_id: &str,
        target_account_id: &str,
        uri: &str,
        at: DateTime<Utc>,
        needs_approval: bool,
    ) -> Result<FollowOutcome, AppError> {
        let mut conn = ImmediateTransaction::begin(&self.pool).await?;

        let result: Result<FollowOutcome, AppError> = async {
            let tombstones = tombstones_for(
                &mut conn,
                account_id,
                TombstoneKind::Follow,
                uri,
                target_account_id,
            )
            .await?;
            if suppressed_by(&tombstones, Some(uri), Some(target_account_id), at) {
                return Ok(FollowOutcome::Suppressed);
            }

            if find_edge(&mut conn, "follows", account_id, target_account_id)
                .await?
                .is_some()
            {
                sqlx::query(
                    "UPDATE follows SET uri = ? WHERE account_id = ? AND target_account_id = ?",
                )
                .bind(uri)
                .bind(account_id)
                .bind(target_account_id)
                .execute(&mut *conn)
                .await?;
                return Ok(FollowOutcome::AlreadyFollowing);
            }

            if needs_approval {
                if find_edge(&mut conn, "follow_requests", account_id, target_account_id)
                    .await?
                    .is_some()
                {
                    return Ok(FollowOutcome::AlreadyRequested);
                }
                insert_edge(
                    &mut conn,
                    "follow_requests",
                    account_id,
                    target_account_id,
                    Some(uri),
                )
                .await?;
                return Ok(FollowOutcome::Requested);
            }

            insert_edge(&mut conn, "follows", account_id, target_account_id, Some(uri)).await?;
            delete_edge(&mut conn, "follow_requests", account_id, target_account_id).await?;
            invalidate_sync_records(&mut conn, &[target_account_id]).await?;
            Ok(FollowOutcome::Followed)
        }
        .await;

        conn.finish(result).await
    }

    /// Turn the pending request `account_id -> target_account_id` into a follow.
    pub async fn accept_follow_request(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<AcceptOutcome, AppError> {
        let mut conn = ImmediateTransaction::begin(&self.pool).await?;

        let result: Result<AcceptOutcome, AppError> = async {
            let request =
                delete_edge(&mut conn, "follow_requests", account_id, target_account_id).await?;

            if find_edge(&mut conn, "follows", account_id, target_account_id)
                .await?
                .is_some()
            {
                return Ok(AcceptOutcome::AlreadyFollowing);
            }

            let Some(request) = request else {
                return Ok(AcceptOutcome::NoRequest);
            };

            insert_edge(
                &mut conn,
                "follows",
                account_id,
                target_account_id,
                request.uri.as_deref(),
            )
            .await?;
            invalidate_sync_records(&mut conn, &[target_account_id]).await?;
            Ok(AcceptOutcome::Accepted)
        }
        .await;

        conn.finish(result).await
    }

    /// Apply an Undo of a Follow. Removes the follow or pending request, or
    /// records the Undo when neither exists yet.
    pub async fn undo_follow(
        &self,
        account_id: &str,
        target_account_id: &str,
        follow_uri: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<UndoOutcome, AppError> {
        let mut conn = ImmediateTransaction::begin(&self.pool).await?;

        let result: Result<UndoOutcome, AppError> = async {
            let follow = delete_edge(&mut conn, "follows", account_id, target_account_id).await?;
            let request =
                delete_edge(&mut conn, "follow_requests", account_id, target_account_id).await?;

            if follow.is_some() {
                invalidate_sync_records(&mut conn, &[target_account_id]).await?;
            }

            if follow.is_some() || request.is_some() {
                return Ok(UndoOutcome::Removed);
            }

            insert_tombstone(
                &mut conn,
                account_id,
                TombstoneKind::Follow,
                follow_uri,
                Some(target_account_id),
                at,
            )
            .await?;
            Ok(UndoOutcome::Recorded)
        }
        .await;

        conn.finish(result).await
    }

    /// All followers of an actor.
    pub async fn get_followers(&self, target_account_id: &str) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            JOIN follows f ON f.account_id = a.id
            WHERE f.target_account_id = ?
            ORDER BY f.created_at
            "#,
        )
        .bind(target_account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(actors)
    }

    /// Follower URIs of an actor restricted to one domain (`None` = local).
    pub async fn get_follower_uris_on_domain(
        &self,
        target_account_id: &str,
        domain: Option<&str>,
    ) -> Result<Vec<String>, AppError> {
        let mut conn = self.pool.acquire().await?;
        follower_uris_on_domain(&mut conn, target_account_id, domain).await
    }

    /// Local accounts following the given actor.
    pub async fn get_local_followers(
        &self,
        target_account_id: &str,
    ) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            JOIN follows f ON f.account_id = a.id
            WHERE f.target_account_id = ? AND a.domain IS NULL
            "#,
        )
        .bind(target_account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(actors)
    }

    pub async fn get_follower_ids(
        &self,
        target_account_id: &str,
    ) -> Result<HashSet<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT account_id FROM follows WHERE target_account_id = ?",
        )
        .bind(target_account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn get_follow_requester_ids(
        &self,
        target_account_id: &str,
    ) -> Result<HashSet<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT account_id FROM follow_requests WHERE target_account_id = ?",
        )
        .bind(target_account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    // =========================================================================
    // Blocks & mutes
    // =========================================================================

    pub async fn get_block(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<Option<Block>, AppError> {
        let block = sqlx::query_as::<_, Block>(
            "SELECT * FROM blocks WHERE account_id = ? AND target_account_id = ?",
        )
        .bind(account_id)
        .bind(target_account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(block)
    }

    pub async fn is_blocking(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<bool, AppError> {
        Ok(self.get_block(account_id, target_account_id).await?.is_some())
    }

    /// Apply an inbound Block atomically with severing every follow and
    /// follow request between the two accounts.
    ///
    /// The follows are severed even when an earlier Undo suppresses the block.
    pub async fn apply_block(
        &self,
        account_id: &str,
        target_account_id: &str,
        uri: &str,
        at: DateTime<Utc>,
    ) -> Result<BlockApplied, AppError> {
        let mut conn = ImmediateTransaction::begin(&self.pool).await?;

        let result: Result<BlockApplied, AppError> = async {
            let mut severed_follows = Vec::new();
            let mut severed_requests = Vec::new();
            for (from, to) in [
                (target_account_id, account_id),
                (account_id, target_account_id),
            ] {
                if let Some(edge) = delete_edge(&mut conn, "follows", from, to).await? {
                    severed_follows.push(edge);
                }
                if let Some(edge) = delete_edge(&mut conn, "follow_requests", from, to).await? {
                    severed_requests.push(edge);
                }
            }
            if !severed_follows.is_empty() {
                invalidate_sync_records(&mut conn, &[account_id, target_account_id]).await?;
            }

            let tombstones = tombstones_for(
                &mut conn,
                account_id,
                TombstoneKind::Block,
                uri,
                target_account_id,
            )
            .await?;
            let outcome = if suppressed_by(&tombstones, Some(uri), Some(target_account_id), at) {
                BlockOutcome::Suppressed
            } else {
                let existing = sqlx::query_as::<_, Block>(
                    "SELECT * FROM blocks WHERE account_id = ? AND target_account_id = ?",
                )
                .bind(account_id)
                .bind(target_account_id)
                .fetch_optional(&mut *conn)
                .await?;

                match existing {
                    Some(block) if block.last_activity_at > at => BlockOutcome::Stale,
                    Some(block) => {
                        sqlx::query("UPDATE blocks SET uri = ?, last_activity_at = ? WHERE id = ?")
                            .bind(uri)
                            .bind(at)
                            .bind(&block.id)
                            .execute(&mut *conn)
                            .await?;
                        BlockOutcome::Updated
                    }
                    None => {
                        sqlx::query(
                            "INSERT INTO blocks (id, account_id, target_account_id, uri, last_activity_at, created_at) VALUES (?, ?, ?, ?, ?, ?)",
                        )
                        .bind(EntityId::new().0)
                        .bind(account_id)
                        .bind(target_account_id)
                        .bind(uri)
                        .bind(at)
                        .bind(Utc::now())
                        .execute(&mut *conn)
                        .await?;
                        BlockOutcome::Created
                    }
                }
            };

            Ok(BlockApplied {
                outcome,
                severed_follows,
                severed_requests,
            })
        }
        .await;

        conn.finish(result).await
    }

    /// Block by `account_id` created from the activity `uri`.
    pub async fn find_block_by_uri(
        &self,
        account_id: &str,
        uri: &str,
    ) -> Result<Option<Block>, AppError> {
        let block = sqlx::query_as::<_, Block>(
            "SELECT * FROM blocks WHERE account_id = ? AND uri = ?",
        )
        .bind(account_id)
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(block)
    }

    /// Apply an Undo of a Block.
    pub async fn undo_block(
        &self,
        account_id: &str,
        target_account_id: &str,
        block_uri: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<UndoOutcome, AppError> {
        let mut conn = ImmediateTransaction::begin(&self.pool).await?;

        let result: Result<UndoOutcome, AppError> = async {
            let existing = sqlx::query_as::<_, Block>(
                "SELECT * FROM blocks WHERE account_id = ? AND target_account_id = ?",
            )
            .bind(account_id)
            .bind(target_account_id)
            .fetch_optional(&mut *conn)
            .await?;

            let outcome = match existing {
                Some(block) if block.last_activity_at > at => return Ok(UndoOutcome::Stale),
                Some(block) => {
                    sqlx::query("DELETE FROM blocks WHERE id = ?")
                        .bind(&block.id)
                        .execute(&mut *conn)
                        .await?;
                    UndoOutcome::Removed
                }
                None => UndoOutcome::Recorded,
            };

            insert_tombstone(
                &mut conn,
                account_id,
                TombstoneKind::Block,
                block_uri,
                Some(target_account_id),
                at,
            )
            .await?;
            Ok(outcome)
        }
        .await;

        conn.finish(result).await
    }

    /// Insert a block without any activity ordering (carried over on Move).
    pub async fn insert_block(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO blocks (id, account_id, target_account_id, uri, last_activity_at, created_at) VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(account_id)
        .bind(target_account_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Local accounts blocking the given actor.
    pub async fn get_local_blocker_ids(
        &self,
        target_account_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT b.account_id FROM blocks b
            JOIN actors a ON a.id = b.account_id
            WHERE b.target_account_id = ? AND a.domain IS NULL
            "#,
        )
        .bind(target_account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn insert_mute(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO mutes (id, account_id, target_account_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(account_id)
        .bind(target_account_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_muting(
        &self,
        account_id: &str,
        target_account_id: &str,
    ) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM mutes WHERE account_id = ? AND target_account_id = ?",
        )
        .bind(account_id)
        .bind(target_account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn get_local_muter_ids(
        &self,
        target_account_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT m.account_id FROM mutes m
            JOIN actors a ON a.id = m.account_id
            WHERE m.target_account_id = ? AND a.domain IS NULL
            "#,
        )
        .bind(target_account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    // =========================================================================
    // Ordering records
    // =========================================================================

    /// Record that `object_uri` was undone or deleted before it was seen.
    pub async fn record_tombstone(
        &self,
        actor_id: &str,
        kind: TombstoneKind,
        object_uri: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_tombstone(&mut conn, actor_id, kind, Some(object_uri), None, at).await
    }

    /// Drop ordering records written before `older_than`. Returns how many
    /// were removed.
    pub async fn prune_tombstones(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM undo_tombstones WHERE julianday(undone_at) < julianday(?)",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Whether an ordering record exists for `object_uri` by `actor_id`.
    pub async fn has_tombstone(
        &self,
        actor_id: &str,
        kind: TombstoneKind,
        object_uri: &str,
    ) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM undo_tombstones WHERE actor_id = ? AND kind = ? AND object_uri = ?",
        )
        .bind(actor_id)
        .bind(kind.as_str())
        .bind(object_uri)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // =========================================================================
    // Relays
    // =========================================================================

    pub async fn get_relay_by_inbox(&self, inbox_url: &str) -> Result<Option<Relay>, AppError> {
        let relay = sqlx::query_as::<_, Relay>("SELECT * FROM relays WHERE inbox_url = ?")
            .bind(inbox_url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(relay)
    }

    pub async fn get_relay_by_follow_activity_id(
        &self,
        follow_activity_id: &str,
    ) -> Result<Option<Relay>, AppError> {
        let relay =
            sqlx::query_as::<_, Relay>("SELECT * FROM relays WHERE follow_activity_id = ?")
                .bind(follow_activity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(relay)
    }

    pub async fn get_relays_in_state(&self, state: RelayState) -> Result<Vec<Relay>, AppError> {
        let relays = sqlx::query_as::<_, Relay>("SELECT * FROM relays WHERE state = ?")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(relays)
    }

    /// Insert the relay if unknown and return the stored row.
    pub async fn upsert_relay(&self, inbox_url: &str) -> Result<Relay, AppError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT OR IGNORE INTO relays (id, inbox_url, follow_activity_id, state, created_at, updated_at) VALUES (?, ?, NULL, 'idle', ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(inbox_url)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_relay_by_inbox(inbox_url)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn update_relay_state(
        &self,
        id: &str,
        state: RelayState,
        follow_activity_id: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE relays SET state = ?, follow_activity_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(follow_activity_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Statuses
    // =========================================================================

    /// Insert a status; returns false when one with the same URI exists.
    pub async fn insert_status(&self, status: &Status) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO statuses
                (id, uri, account_id, visibility, content, reblog_of_id, in_reply_to_uri, local, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&status.id)
        .bind(&status.uri)
        .bind(&status.account_id)
        .bind(&status.visibility)
        .bind(&status.content)
        .bind(&status.reblog_of_id)
        .bind(&status.in_reply_to_uri)
        .bind(status.local)
        .bind(status.created_at)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_status(&self, id: &str) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }

    pub async fn get_status_by_uri(&self, uri: &str) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }

    pub async fn update_status_content(&self, id: &str, content: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE statuses SET content = ?, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_status(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM statuses WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_reblog(
        &self,
        account_id: &str,
        reblog_of_id: &str,
    ) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>(
            "SELECT * FROM statuses WHERE account_id = ? AND reblog_of_id = ?",
        )
        .bind(account_id)
        .bind(reblog_of_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(status)
    }

    pub async fn insert_mentions(
        &self,
        status_id: &str,
        account_ids: &[String],
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        for account_id in account_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO mentions (id, status_id, account_id) VALUES (?, ?, ?)",
            )
            .bind(EntityId::new().0)
            .bind(status_id)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_mentioned_actors(&self, status_id: &str) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            JOIN mentions m ON m.account_id = a.id
            WHERE m.status_id = ?
            ORDER BY a.uri
            "#,
        )
        .bind(status_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(actors)
    }

    pub async fn insert_pin(&self, account_id: &str, status_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO pins (id, account_id, status_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(account_id)
        .bind(status_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_pin(&self, account_id: &str, status_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM pins WHERE account_id = ? AND status_id = ?")
            .bind(account_id)
            .bind(status_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_pinned(&self, account_id: &str, status_id: &str) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM pins WHERE account_id = ? AND status_id = ?",
        )
        .bind(account_id)
        .bind(status_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // =========================================================================
    // Polls
    // =========================================================================

    pub async fn insert_poll(&self, poll: &Poll) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO polls (id, status_id, account_id, options, expires_at, notified_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.status_id)
        .bind(&poll.account_id)
        .bind(&poll.options)
        .bind(poll.expires_at)
        .bind(poll.notified_at)
        .bind(poll.created_at)
        .bind(poll.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_poll(&self, id: &str) -> Result<Option<Poll>, AppError> {
        let poll = sqlx::query_as::<_, Poll>("SELECT * FROM polls WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(poll)
    }

    pub async fn get_poll_by_status(&self, status_id: &str) -> Result<Option<Poll>, AppError> {
        let poll = sqlx::query_as::<_, Poll>("SELECT * FROM polls WHERE status_id = ?")
            .bind(status_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(poll)
    }

    pub async fn update_poll(
        &self,
        id: &str,
        options: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE polls SET options = ?, expires_at = ?, updated_at = ? WHERE id = ?")
            .bind(options)
            .bind(expires_at)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Claim the one-time expiry transition. Returns false when it already ran.
    pub async fn mark_poll_notified(&self, id: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE polls SET notified_at = ? WHERE id = ? AND notified_at IS NULL")
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_poll_vote(
        &self,
        poll_id: &str,
        account_id: &str,
        choice: i64,
        uri: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO poll_votes (id, poll_id, account_id, choice, uri, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(poll_id)
        .bind(account_id)
        .bind(choice)
        .bind(uri)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Vote count per option, in option order.
    pub async fn count_poll_votes(&self, poll: &Poll) -> Result<Vec<i64>, AppError> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT choice, COUNT(*) FROM poll_votes WHERE poll_id = ? GROUP BY choice",
        )
        .bind(&poll.id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = vec![0; poll.option_titles().len()];
        for (choice, count) in rows {
            if let Some(slot) = usize::try_from(choice).ok().and_then(|i| counts.get_mut(i)) {
                *slot = count;
            }
        }
        Ok(counts)
    }

    /// Distinct accounts that voted in the poll.
    pub async fn get_poll_voters(&self, poll_id: &str) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            WHERE a.id IN (SELECT account_id FROM poll_votes WHERE poll_id = ?)
            ORDER BY a.uri
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(actors)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Insert a notification; duplicates of the same tuple are ignored.
    pub async fn insert_notification(
        &self,
        account_id: &str,
        activity_type: &str,
        activity_id: &str,
        kind: &str,
        from_account_id: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO notifications (id, account_id, activity_type, activity_id, kind, from_account_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(account_id)
        .bind(activity_type)
        .bind(activity_id)
        .bind(kind)
        .bind(from_account_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_notifications(&self, account_id: &str) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE account_id = ? ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    // =========================================================================
    // Delivery queue
    // =========================================================================

    /// Enqueue one delivery task; an existing (activity, inbox) pair is kept.
    pub async fn insert_delivery_task(&self, task: &DeliveryTask) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO delivery_tasks (
                id, activity_id, activity_type, sender_actor_id, inbox_url, payload,
                synchronize_followers, attempts, next_attempt_at_ms, claimed_until_ms,
                last_attempt_at, last_error, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.activity_id)
        .bind(&task.activity_type)
        .bind(&task.sender_actor_id)
        .bind(&task.inbox_url)
        .bind(&task.payload)
        .bind(task.synchronize_followers)
        .bind(task.attempts)
        .bind(task.next_attempt_at_ms)
        .bind(task.claimed_until_ms)
        .bind(task.last_attempt_at)
        .bind(&task.last_error)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lease due tasks to the caller until `lease_until_ms`.
    pub async fn claim_due_delivery_tasks(
        &self,
        now_ms: i64,
        lease_until_ms: i64,
        limit: u32,
    ) -> Result<Vec<DeliveryTask>, AppError> {
        let tasks = sqlx::query_as::<_, DeliveryTask>(
            r#"
            UPDATE delivery_tasks SET claimed_until_ms = ?
            WHERE id IN (
                SELECT id FROM delivery_tasks
                WHERE next_attempt_at_ms <= ?
                  AND (claimed_until_ms IS NULL OR claimed_until_ms <= ?)
                ORDER BY next_attempt_at_ms
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(lease_until_ms)
        .bind(now_ms)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    pub async fn delete_delivery_task(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM delivery_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn reschedule_delivery_task(
        &self,
        id: &str,
        attempts: i64,
        next_attempt_at_ms: i64,
        last_error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET attempts = ?, next_attempt_at_ms = ?, claimed_until_ms = NULL,
                last_attempt_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(next_attempt_at_ms)
        .bind(Utc::now())
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_delivery_tasks(&self, activity_id: &str) -> Result<Vec<DeliveryTask>, AppError> {
        let tasks = sqlx::query_as::<_, DeliveryTask>(
            "SELECT * FROM delivery_tasks WHERE activity_id = ? ORDER BY inbox_url",
        )
        .bind(activity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    pub async fn count_delivery_tasks(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM delivery_tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Reset the failure streak of an inbox. Returns true if it was unreachable.
    pub async fn record_inbox_success(&self, inbox_url: &str) -> Result<bool, AppError> {
        let previous = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "DELETE FROM inbox_failures WHERE inbox_url = ? RETURNING unreachable_since",
        )
        .bind(inbox_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(previous, Some(Some(_))))
    }

    /// Count a permanent failure. Returns true when this failure makes the
    /// inbox unreachable.
    pub async fn record_inbox_failure(
        &self,
        inbox_url: &str,
        threshold: u32,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let failure = sqlx::query_as::<_, InboxFailure>(
            r#"
            INSERT INTO inbox_failures (inbox_url, consecutive_failures, unreachable_since, updated_at)
            VALUES (?, 1, NULL, ?)
            ON CONFLICT(inbox_url) DO UPDATE SET
                consecutive_failures = consecutive_failures + 1,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(inbox_url)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        if failure.consecutive_failures < i64::from(threshold) {
            return Ok(false);
        }

        // A retried unreachable inbox that fails again starts a new window.
        sqlx::query("UPDATE inbox_failures SET unreachable_since = ? WHERE inbox_url = ?")
            .bind(now)
            .bind(inbox_url)
            .execute(&self.pool)
            .await?;
        Ok(failure.unreachable_since.is_none())
    }

    /// Inboxes marked unreachable at or after `marked_after`. Older marks
    /// have lapsed and their inboxes are tried again.
    pub async fn get_unreachable_inboxes(
        &self,
        marked_after: DateTime<Utc>,
    ) -> Result<HashSet<String>, AppError> {
        let failures = sqlx::query_as::<_, InboxFailure>(
            "SELECT * FROM inbox_failures WHERE unreachable_since IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(failures
            .into_iter()
            .filter(|failure| {
                failure
                    .unreachable_since
                    .is_some_and(|since| since >= marked_after)
            })
            .map(|failure| failure.inbox_url)
            .collect())
    }

    // =========================================================================
    // Collection synchronization records
    // =========================================================================

    pub async fn get_sync_record(
        &self,
        actor_id: &str,
        domain: &str,
    ) -> Result<Option<CollectionSyncRecord>, AppError> {
        let record = sqlx::query_as::<_, CollectionSyncRecord>(
            "SELECT * FROM collection_sync_records WHERE actor_id = ? AND domain = ?",
        )
        .bind(actor_id)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Cached followers digest of `actor_id` under `key`. When no record is
    /// cached, `compute` digests the followers on `domain` (`None` = local)
    /// and the result is stored. Reading the followers and storing the
    /// digest share one transaction, so a follow change cannot slip in
    /// between and leave a stale digest behind.
    pub async fn cached_followers_digest<F>(
        &self,
        actor_id: &str,
        key: &str,
        domain: Option<&str>,
        compute: F,
    ) -> Result<String, AppError>
    where
        F: FnOnce(&[String]) -> String,
    {
        if let Some(record) = self.get_sync_record(actor_id, key).await? {
            return Ok(record.digest);
        }

        let mut conn = ImmediateTransaction::begin(&self.pool).await?;
        let result: Result<String, AppError> = async {
            let cached = sqlx::query_scalar::<_, String>(
                "SELECT digest FROM collection_sync_records WHERE actor_id = ? AND domain = ?",
            )
            .bind(actor_id)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
            if let Some(digest) = cached {
                return Ok(digest);
            }

            let uris = follower_uris_on_domain(&mut conn, actor_id, domain).await?;
            let digest = compute(&uris);
            upsert_sync_record(&mut conn, actor_id, key, &digest).await?;
            Ok(digest)
        }
        .await;
        conn.finish(result).await
    }

    pub async fn mark_sync_requested(&self, actor_id: &str, domain: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE collection_sync_records SET sync_requested_at = ? WHERE actor_id = ? AND domain = ?",
        )
        .bind(Utc::now())
        .bind(actor_id)
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Insert a job. With a lock key, a second job under the same key is
    /// ignored while the first is still pending; returns whether it was inserted.
    pub async fn enqueue_job(
        &self,
        kind: &str,
        payload: &str,
        run_at_ms: i64,
        lock_key: Option<&str>,
        attempts: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO jobs (id, kind, payload, run_at_ms, lock_key, attempts, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(kind)
        .bind(payload)
        .bind(run_at_ms)
        .bind(lock_key)
        .bind(attempts)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lease due jobs to the caller until `lease_until_ms`.
    ///
    /// Claiming moves the lock key aside, so a job under the same key can be
    /// scheduled while this one runs. Jobs whose lease lapsed are claimed
    /// again.
    pub async fn claim_due_jobs(
        &self,
        now_ms: i64,
        lease_until_ms: i64,
        limit: u32,
    ) -> Result<Vec<JobRow>, AppError> {
        let jobs = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET claimed_until_ms = ?,
                claimed_lock_key = COALESCE(lock_key, claimed_lock_key),
                lock_key = NULL
            WHERE id IN (
                SELECT id FROM jobs
                WHERE run_at_ms <= ?
                  AND (claimed_until_ms IS NULL OR claimed_until_ms <= ?)
                ORDER BY run_at_ms
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(lease_until_ms)
        .bind(now_ms)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Remove a finished job.
    pub async fn complete_job(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release a claimed job for another attempt at `run_at_ms`. The job
    /// takes its lock key back unless another pending job holds it.
    pub async fn retry_job(&self, id: &str, attempts: i64, run_at_ms: i64) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = ?, run_at_ms = ?, claimed_until_ms = NULL,
                lock_key = CASE
                    WHEN EXISTS (
                        SELECT 1 FROM jobs AS other
                        WHERE other.lock_key = jobs.claimed_lock_key
                    ) THEN NULL
                    ELSE claimed_lock_key
                END,
                claimed_lock_key = NULL
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(run_at_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pending_jobs(&self, kind: &str) -> Result<Vec<JobRow>, AppError> {
        let jobs = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE kind = ? AND claimed_until_ms IS NULL ORDER BY run_at_ms",
        )
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn create_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::connect(&db_path).await.unwrap();
        (db, temp_dir)
    }

    fn actor(username: &str, domain: Option<&str>) -> Actor {
        let host = domain.unwrap_or("local.test");
        let uri = format!("https://{}/users/{}", host, username);
        Actor {
            id: EntityId::new().0,
            uri: uri.clone(),
            username: username.to_string(),
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

    async fn stored(db: &Database, username: &str, domain: Option<&str>) -> Actor {
        let actor = actor(username, domain);
        db.insert_actor(&actor).await.unwrap();
        actor
    }

    #[tokio::test]
    async fn test_actor_lookup_by_uri_and_username() {
        let (db, _dir) = create_test_db().await;
        let alice = stored(&db, "alice", None).await;

        let by_uri = db.get_actor_by_uri(&alice.uri).await.unwrap().unwrap();
        assert_eq!(by_uri.id, alice.id);
        assert!(by_uri.is_local());

        let by_name = db.get_local_actor("alice").await.unwrap().unwrap();
        assert_eq!(by_name.id, alice.id);
        assert!(db.get_local_actor("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_moderation_flags_are_persisted() {
        let (db, _dir) = create_test_db().await;
        let bob = stored(&db, "bob", Some("remote.example")).await;

        db.set_actor_silenced(&bob.id, true).await.unwrap();
        db.suspend_actor(&bob.id, true).await.unwrap();

        let bob = db.get_actor(&bob.id).await.unwrap().unwrap();
        assert!(bob.silenced);
        assert_eq!(bob.suspension(), SuspensionState::Temporary);
    }

    #[tokio::test]
    async fn test_block_severs_follows_in_both_directions() {
        let (db, _dir) = create_test_db().await;
        let local = stored(&db, "alice", None).await;
        let remote = stored(&db, "bob", Some("remote.example")).await;

        db.insert_follow(&local.id, &remote.id, None).await.unwrap();
        db.insert_follow(&remote.id, &local.id, None).await.unwrap();

        let applied = db
            .apply_block(&remote.id, &local.id, "https://remote.example/block/1", Utc::now())
            .await
            .unwrap();

        assert_eq!(applied.outcome, BlockOutcome::Created);
        assert_eq!(applied.severed_follows.len(), 2);
        assert!(db.is_blocking(&remote.id, &local.id).await.unwrap());
        assert!(!db.is_following(&local.id, &remote.id).await.unwrap());
        assert!(!db.is_following(&remote.id, &local.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_block_updates_uri() {
        let (db, _dir) = create_test_db().await;
        let local = stored(&db, "alice", None).await;
        let remote = stored(&db, "bob", Some("remote.example")).await;
        let first = Utc::now() - Duration::minutes(5);

        db.apply_block(&remote.id, &local.id, "https://remote.example/block/1", first)
            .await
            .unwrap();
        let applied = db
            .apply_block(&remote.id, &local.id, "https://remote.example/block/2", Utc::now())
            .await
            .unwrap();

        assert_eq!(applied.outcome, BlockOutcome::Updated);
        let block = db.get_block(&remote.id, &local.id).await.unwrap().unwrap();
        assert_eq!(block.uri.as_deref(), Some("https://remote.example/block/2"));
    }

    #[tokio::test]
    async fn test_undo_block_received_first_suppresses_older_block() {
        let (db, _dir) = create_test_db().await;
        let local = stored(&db, "alice", None).await;
        let remote = stored(&db, "bob", Some("remote.example")).await;
        db.insert_follow(&local.id, &remote.id, None).await.unwrap();

        let block_at = Utc::now() - Duration::minutes(1);
        let undo = db
            .undo_block(&remote.id, &local.id, Some("https://remote.example/block/1"), Utc::now())
            .await
            .unwrap();
        assert_eq!(undo, UndoOutcome::Recorded);

        let applied = db
            .apply_block(&remote.id, &local.id, "https://remote.example/block/1", block_at)
            .await
            .unwrap();

        assert_eq!(applied.outcome, BlockOutcome::Suppressed);
        assert!(!db.is_blocking(&remote.id, &local.id).await.unwrap());
        assert!(!db.is_following(&local.id, &remote.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_undo_wins_timestamp_tie() {
        let (db, _dir) = create_test_db().await;
        let local = stored(&db, "alice", None).await;
        let remote = stored(&db, "bob", Some("remote.example")).await;
        let at = Utc::now();

        db.undo_block(&remote.id, &local.id, None, at).await.unwrap();
        let applied = db
            .apply_block(&remote.id, &local.id, "https://remote.example/block/9", at)
            .await
            .unwrap();

        assert_eq!(applied.outcome, BlockOutcome::Suppressed);
    }

    #[tokio::test]
    async fn test_newer_block_after_undo_applies() {
        let (db, _dir) = create_test_db().await;
        let local = stored(&db, "alice", None).await;
        let remote = stored(&db, "bob", Some("remote.example")).await;

        db.undo_block(&remote.id, &local.id, None, Utc::now() - Duration::minutes(10))
            .await
            .unwrap();
        let applied = db
            .apply_block(&remote.id, &local.id, "https://remote.example/block/2", Utc::now())
            .await
            .unwrap();

        assert_eq!(applied.outcome, BlockOutcome::Created);
    }

    #[tokio::test]
    async fn test_accept_follow_request_is_idempotent() {
        let (db, _dir) = create_test_db().await;
        let local = stored(&db, "alice", None).await;
        let remote = stored(&db, "bob", Some("remote.example")).await;
        db.insert_follow_request(&local.id, &remote.id, Some("https://local.test/f/1"))
            .await
            .unwrap();

        let first = db.accept_follow_request(&local.id, &remote.id).await.unwrap();
        let second = db.accept_follow_request(&local.id, &remote.id).await.unwrap();

        assert_eq!(first, AcceptOutcome::Accepted);
        assert_eq!(second, AcceptOutcome::AlreadyFollowing);
        assert!(db.is_following(&local.id, &remote.id).await.unwrap());
        assert!(!db.has_requested(&local.id, &remote.id).await.unwrap());
        assert_eq!(db.get_followers(&remote.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_follow_after_undo_is_suppressed() {
        let (db, _dir) = create_test_db().await;
        let local = stored(&db, "alice", None).await;
        let remote = stored(&db, "bob", Some("remote.example")).await;
        let follow_uri = "https://remote.example/follows/1";

        db.undo_follow(&remote.id, &local.id, Some(follow_uri), Utc::now())
            .await
            .unwrap();
        let outcome = db
            .apply_follow(&remote.id, &local.id, follow_uri, Utc::now(), false)
            .await
            .unwrap();

        assert_eq!(outcome, FollowOutcome::Suppressed);
        assert!(!db.is_following(&remote.id, &local.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_follow_change_invalidates_sync_record() {
        let (db, _dir) = create_test_db().await;
        let local = stored(&db, "alice", None).await;
        let remote = stored(&db, "bob", Some("remote.example")).await;
        db.cached_followers_digest(&remote.id, "local.test", None, |_| "abc".to_string())
            .await
            .unwrap();
        assert!(db.get_sync_record(&remote.id, "local.test").await.unwrap().is_some());

        db.insert_follow(&local.id, &remote.id, None).await.unwrap();

        assert!(db.get_sync_record(&remote.id, "local.test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cached_digest_matches_followers_after_concurrent_follows() {
        use crate::federation::collection_sync::followers_digest;

        let (db, _dir) = create_test_db().await;
        let alice = stored(&db, "alice", None).await;
        let mut remotes = Vec::new();
        for index in 0..8 {
            remotes.push(stored(&db, &format!("user{}", index), Some("remote.example")).await);
        }

        let follows = async {
            for remote in &remotes {
                db.insert_follow(&remote.id, &alice.id, None).await.unwrap();
            }
        };
        let digests = async {
            for _ in 0..8 {
                db.cached_followers_digest(&alice.id, "remote.example", Some("remote.example"), |uris| {
                    followers_digest(uris)
                })
                .await
                .unwrap();
                tokio::task::yield_now().await;
            }
        };
        tokio::join!(follows, digests);

        let current = db
            .get_follower_uris_on_domain(&alice.id, Some("remote.example"))
            .await
            .unwrap();
        let cached = db
            .cached_followers_digest(&alice.id, "remote.example", Some("remote.example"), |uris| {
                followers_digest(uris)
            })
            .await
            .unwrap();
        assert_eq!(current.len(), 8);
        assert_eq!(cached, followers_digest(&current));
    }

    #[tokio::test]
    async fn test_inbox_becomes_unreachable_at_threshold() {
        let (db, _dir) = create_test_db().await;
        let inbox = "https://dead.example/inbox";

        assert!(!db.record_inbox_failure(inbox, 2).await.unwrap());
        assert!(db.record_inbox_failure(inbox, 2).await.unwrap());
        assert!(!db.record_inbox_failure(inbox, 2).await.unwrap());
        let window_start = Utc::now() - Duration::hours(1);
        assert!(db.get_unreachable_inboxes(window_start).await.unwrap().contains(inbox));

        assert!(db.record_inbox_success(inbox).await.unwrap());
        assert!(db.get_unreachable_inboxes(window_start).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_mark_lapses_and_failure_renews_it() {
        let (db, _dir) = create_test_db().await;
        let inbox = "https://dead.example/inbox";
        db.record_inbox_failure(inbox, 1).await.unwrap();

        sqlx::query("UPDATE inbox_failures SET unreachable_since = ? WHERE inbox_url = ?")
            .bind(Utc::now() - Duration::days(8))
            .bind(inbox)
            .execute(db.pool())
            .await
            .unwrap();
        let window_start = Utc::now() - Duration::days(7);
        assert!(db.get_unreachable_inboxes(window_start).await.unwrap().is_empty());

        // Still failing after the lapse: skipped again, not newly unreachable.
        assert!(!db.record_inbox_failure(inbox, 1).await.unwrap());
        assert!(db.get_unreachable_inboxes(window_start).await.unwrap().contains(inbox));
    }

    #[tokio::test]
    async fn test_prune_tombstones_keeps_recent_records() {
        let (db, _dir) = create_test_db().await;
        let remote = stored(&db, "bob", Some("remote.example")).await;
        let old = "https://remote.example/follows/old";
        let recent = "https://remote.example/follows/recent";
        db.record_tombstone(&remote.id, TombstoneKind::Follow, old, Utc::now() - Duration::days(40))
            .await
            .unwrap();
        db.record_tombstone(&remote.id, TombstoneKind::Follow, recent, Utc::now())
            .await
            .unwrap();

        let pruned = db.prune_tombstones(Utc::now() - Duration::days(30)).await.unwrap();

        assert_eq!(pruned, 1);
        assert!(!db.has_tombstone(&remote.id, TombstoneKind::Follow, old).await.unwrap());
        assert!(db.has_tombstone(&remote.id, TombstoneKind::Follow, recent).await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_job_is_enqueued_once_until_claimed() {
        let (db, _dir) = create_test_db().await;
        let now = now_ms();

        assert!(db.enqueue_job("poll_expiration_notify", "{}", now, Some("poll:1"), 0).await.unwrap());
        assert!(!db.enqueue_job("poll_expiration_notify", "{}", now, Some("poll:1"), 0).await.unwrap());

        let claimed = db.claim_due_jobs(now, now + 60_000, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].claimed_lock_key.as_deref(), Some("poll:1"));

        assert!(db.enqueue_job("poll_expiration_notify", "{}", now, Some("poll:1"), 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_claimed_job_is_leased_until_completed() {
        let (db, _dir) = create_test_db().await;
        let now = now_ms();
        db.enqueue_job("distribute", "{}", now, None, 0).await.unwrap();

        let claimed = db.claim_due_jobs(now, now + 60_000, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(db.claim_due_jobs(now, now + 60_000, 10).await.unwrap().is_empty());
        assert!(db.get_pending_jobs("distribute").await.unwrap().is_empty());

        // A runner that died mid-batch leaves the job to be claimed again.
        let reclaimed = db.claim_due_jobs(now + 60_000, now + 120_000, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed[0].id);

        db.complete_job(&claimed[0].id).await.unwrap();
        assert!(db.claim_due_jobs(now + 200_000, now + 300_000, 10).await.unwrap().is_empty());
    }

    async fn insert_uncommitted_job(conn: &mut SqliteConnection) {
        sqlx::query(
            "INSERT INTO jobs (id, kind, payload, run_at_ms, created_at) VALUES (?, 'uncommitted', '{}', 0, ?)",
        )
        .bind(EntityId::new().0)
        .bind(Utc::now())
        .execute(conn)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_failed_transaction_is_rolled_back() {
        let (db, _dir) = create_test_db().await;

        let mut tx = ImmediateTransaction::begin(db.pool()).await.unwrap();
        insert_uncommitted_job(&mut tx).await;
        let result: Result<(), AppError> = Err(AppError::Validation("rejected".to_string()));
        assert!(tx.finish(result).await.is_err());

        assert!(db.get_pending_jobs("uncommitted").await.unwrap().is_empty());
        assert!(db.enqueue_job("distribute", "{}", now_ms(), None, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_transaction_releases_the_write_lock() {
        let (db, _dir) = create_test_db().await;

        {
            let mut tx = ImmediateTransaction::begin(db.pool()).await.unwrap();
            insert_uncommitted_job(&mut tx).await;
        }

        // Another writer gets through and the abandoned insert is gone.
        assert!(db.enqueue_job("distribute", "{}", now_ms(), None, 0).await.unwrap());
        assert!(db.get_pending_jobs("uncommitted").await.unwrap().is_empty());
        assert_eq!(db.get_pending_jobs("distribute").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retried_job_takes_back_its_lock_key() {
        let (db, _dir) = create_test_db().await;
        let now = now_ms();
        db.enqueue_job("poll_expiration_notify", "{}", now, Some("poll:1"), 0).await.unwrap();
        let claimed = db.claim_due_jobs(now, now + 60_000, 10).await.unwrap();

        db.retry_job(&claimed[0].id, 1, now + 1000).await.unwrap();

        let pending = db.get_pending_jobs("poll_expiration_notify").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].lock_key.as_deref(), Some("poll:1"));
        assert!(!db.enqueue_job("poll_expiration_notify", "{}", now, Some("poll:1"), 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_claimed_delivery_task_is_leased() {
        let (db, _dir) = create_test_db().await;
        let sender = stored(&db, "alice", None).await;
        let now = now_ms();
        let task = DeliveryTask {
            id: EntityId::new().0,
            activity_id: "https://local.test/a/1".to_string(),
            activity_type: "Create".to_string(),
            sender_actor_id: sender.id.clone(),
            inbox_url: "https://remote.example/inbox".to_string(),
            payload: "{}".to_string(),
            synchronize_followers: false,
            attempts: 0,
            next_attempt_at_ms: now,
            claimed_until_ms: None,
            last_attempt_at: None,
            last_error: None,
            created_at: Utc::now(),
        };
        assert!(db.insert_delivery_task(&task).await.unwrap());
        assert!(!db.insert_delivery_task(&DeliveryTask { id: EntityId::new().0, ..task.clone() }).await.unwrap());

        let first = db.claim_due_delivery_tasks(now, now + 60_000, 10).await.unwrap();
        let second = db.claim_due_delivery_tasks(now, now + 60_000, 10).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }
}
