//! SQLite database operations
//!
//! All database access goes through this module.
//! Timestamps are always bound from Rust via [`format_timestamp`].

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Maximum stored length of a delivery error message
const MAX_ERROR_LEN: usize = 512;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

fn now_ts() -> String {
    format_timestamp(Utc::now())
}

fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Escape LIKE wildcards for use with `ESCAPE '\'`
fn escape_like(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the parent directory and database file if needed,
    /// then applies embedded migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| AppError::Internal(e.into()))?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url).await?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(path = %path.display(), "Database migrations applied");

        Ok(Self { pool })
    }

    /// Raw pool access for ad-hoc queries
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Create a local user with `did:web:{domain}:{username}`
    pub async fn create_local_user(
        &self,
        username: &str,
        display_name: &str,
        domain: &str,
    ) -> Result<User, AppError> {
        let did = format!("did:web:{}:{}", domain, username);
        sqlx::query(
            r#"
            INSERT INTO users (id, username, instance_domain, did, display_name, is_remote, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(username)
        .bind(domain)
        .bind(&did)
        .bind(display_name)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        self.get_user_by_did(&did).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_local_user(&self, username: &str) -> Result<Option<User>, AppError> {
        let user =
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ? AND is_remote = 0")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(user)
    }

    /// Patch a local user's profile; `None` fields stay unchanged
    pub async fn update_local_profile(
        &self,
        username: &str,
        display_name: Option<&str>,
        bio: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Option<User>, AppError> {
        sqlx::query(
            r#"
            UPDATE users SET
                display_name = COALESCE(?, display_name),
                bio = COALESCE(?, bio),
                avatar_url = COALESCE(?, avatar_url)
            WHERE username = ? AND is_remote = 0
            "#,
        )
        .bind(display_name)
        .bind(bio)
        .bind(avatar_url)
        .bind(username)
        .execute(&self.pool)
        .await?;

        self.get_local_user(username).await
    }

    pub async fn get_user_by_did(&self, did: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE did = ?")
            .bind(did)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Get or create the ghost user for a cached remote actor
    pub async fn ensure_ghost_user(&self, actor: &RemoteActor) -> Result<User, AppError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, instance_domain, did, display_name, avatar_url, is_remote, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(did) DO UPDATE SET
                display_name = COALESCE(NULLIF(excluded.display_name, ''), users.display_name),
                avatar_url = COALESCE(NULLIF(excluded.avatar_url, ''), users.avatar_url)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.actor_uri)
        .bind(&actor.display_name)
        .bind(&actor.avatar_url)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        self.get_user_by_did(&actor.actor_uri)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Patch a ghost user's profile, leaving blank fields untouched
    pub async fn patch_ghost_profile(
        &self,
        did: &str,
        display_name: &str,
        bio: &str,
        avatar_url: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                display_name = COALESCE(NULLIF(?, ''), display_name),
                bio = COALESCE(NULLIF(?, ''), bio),
                avatar_url = COALESCE(NULLIF(?, ''), avatar_url)
            WHERE did = ? AND is_remote = 1
            "#,
        )
        .bind(display_name)
        .bind(bio)
        .bind(avatar_url)
        .bind(did)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Posts & interactions
    // =========================================================================

    pub async fn insert_local_post(
        &self,
        author_did: &str,
        content: &str,
        visibility: &str,
    ) -> Result<Post, AppError> {
        let id = EntityId::new().0;
        sqlx::query(
            r#"
            INSERT INTO posts (id, author_did, content, visibility, is_remote, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&id)
        .bind(author_did)
        .bind(content)
        .bind(visibility)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(post)
    }

    /// Store a remote note; returns false when the note URI already exists
    pub async fn insert_remote_post(
        &self,
        author_did: &str,
        content: &str,
        visibility: &str,
        note_uri: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO posts (id, author_did, content, visibility, is_remote, original_post_uri, created_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(author_did)
        .bind(content)
        .bind(visibility)
        .bind(note_uri)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Find a live post by remote URI or, for local posts, by embedded ID
    pub async fn find_post(
        &self,
        uri: &str,
        local_id: Option<&str>,
    ) -> Result<Option<Post>, AppError> {
        let post = sqlx::query_as::<_, Post>(
            r#"
            SELECT * FROM posts
            WHERE deleted_at IS NULL AND (original_post_uri = ? OR id = ?)
            LIMIT 1
            "#,
        )
        .bind(uri)
        .bind(local_id.unwrap_or(""))
        .fetch_optional(&self.pool)
        .await?;
        Ok(post)
    }

    pub async fn soft_delete_post(
        &self,
        uri: &str,
        local_id: Option<&str>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET deleted_at = ?
            WHERE deleted_at IS NULL AND (original_post_uri = ? OR id = ?)
            "#,
        )
        .bind(now_ts())
        .bind(uri)
        .bind(local_id.unwrap_or(""))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_interaction(
        &self,
        post_id: &str,
        actor_did: &str,
        kind: InteractionKind,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO interactions (id, post_id, actor_did, interaction_type, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(post_id)
        .bind(actor_did)
        .bind(kind.as_str())
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_interaction(
        &self,
        post_id: &str,
        actor_did: &str,
        kind: InteractionKind,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM interactions WHERE post_id = ? AND actor_did = ? AND interaction_type = ?",
        )
        .bind(post_id)
        .bind(actor_did)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_interactions(
        &self,
        post_id: &str,
        kind: InteractionKind,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM interactions WHERE post_id = ? AND interaction_type = ?",
        )
        .bind(post_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Remove every trace of a deleted remote actor in one transaction
    ///
    /// Posts are soft-deleted; interactions, follow edges, the ghost user
    /// and the actor cache row are removed.
    pub async fn purge_remote_actor(&self, actor_uri: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE posts SET deleted_at = ? WHERE author_did = ? AND deleted_at IS NULL")
            .bind(now_ts())
            .bind(actor_uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM interactions WHERE actor_did = ?")
            .bind(actor_uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM follows WHERE follower_did = ? OR following_did = ?")
            .bind(actor_uri)
            .bind(actor_uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM users WHERE did = ? AND is_remote = 1")
            .bind(actor_uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM remote_actors WHERE actor_uri = ?")
            .bind(actor_uri)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Follow graph
    // =========================================================================

    /// Insert or update a follow edge
    ///
    /// An existing edge keeps its stored Follow id unless a new one is given.
    pub async fn upsert_follow(
        &self,
        follower_did: &str,
        following_did: &str,
        status: FollowStatus,
        follow_activity_id: Option<&str>,
    ) -> Result<(), AppError> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO follows (follower_did, following_did, status, follow_activity_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(follower_did, following_did) DO UPDATE SET
                status = excluded.status,
                follow_activity_id = COALESCE(excluded.follow_activity_id, follows.follow_activity_id),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(follower_did)
        .bind(following_did)
        .bind(status.as_str())
        .bind(follow_activity_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_follow(
        &self,
        follower_did: &str,
        following_did: &str,
    ) -> Result<Option<FollowEdge>, AppError> {
        let edge = sqlx::query_as::<_, FollowEdge>(
            "SELECT * FROM follows WHERE follower_did = ? AND following_did = ?",
        )
        .bind(follower_did)
        .bind(following_did)
        .fetch_optional(&self.pool)
        .await?;
        Ok(edge)
    }

    /// Accept the pending edge created by exactly this Follow activity
    ///
    /// Only the followed actor may accept it.
    pub async fn accept_follow_by_activity(
        &self,
        follow_activity_id: &str,
        following_did: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE follows SET status = 'accepted', updated_at = ?
            WHERE follow_activity_id = ? AND following_did = ? AND status = 'pending'
            "#,
        )
        .bind(now_ts())
        .bind(follow_activity_id)
        .bind(following_did)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Accept pending edges towards `following_did` whose follower DID
    /// contains `follower_fragment` literally
    pub async fn accept_follow_loosely(
        &self,
        follower_fragment: &str,
        following_did: &str,
    ) -> Result<u64, AppError> {
        if follower_fragment.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE follows SET status = 'accepted', updated_at = ?
            WHERE status = 'pending'
              AND following_did = ?
              AND follower_did LIKE '%' || ? || '%' ESCAPE '\'
            "#,
        )
        .bind(now_ts())
        .bind(following_did)
        .bind(escape_like(follower_fragment))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_follow(
        &self,
        follower_did: &str,
        following_did: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM follows WHERE follower_did = ? AND following_did = ?")
            .bind(follower_did)
            .bind(following_did)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Inbox URLs of accepted remote followers of `following_did`
    pub async fn get_follower_inboxes(&self, following_did: &str) -> Result<Vec<String>, AppError> {
        let inboxes: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT ra.inbox_url
            FROM follows f
            JOIN remote_actors ra ON ra.actor_uri = f.follower_did
            WHERE f.following_did = ? AND f.status = 'accepted' AND ra.inbox_url != ''
            GROUP BY ra.inbox_url
            ORDER BY MIN(f.created_at) ASC
            "#,
        )
        .bind(following_did)
        .fetch_all(&self.pool)
        .await?;
        Ok(inboxes)
    }

    // =========================================================================
    // Direct messages
    // =========================================================================

    /// Get or create the thread between two users, independent of order
    pub async fn get_or_create_thread(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<MessageThread, AppError> {
        let (first, second) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };
        let now = now_ts();

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_threads (id, participant_a, participant_b, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(first)
        .bind(second)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let thread = sqlx::query_as::<_, MessageThread>(
            "SELECT * FROM message_threads WHERE participant_a = ? AND participant_b = ?",
        )
        .bind(first)
        .bind(second)
        .fetch_one(&self.pool)
        .await?;
        Ok(thread)
    }

    /// Store a message; duplicate remote activity IDs are ignored
    pub async fn insert_message(
        &self,
        thread_id: &str,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
        remote_activity_id: Option<&str>,
    ) -> Result<bool, AppError> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages (id, thread_id, sender_id, recipient_id, content, remote_activity_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(thread_id)
        .bind(sender_id)
        .bind(recipient_id)
        .bind(content)
        .bind(remote_activity_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE message_threads SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(thread_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_thread_messages(&self, thread_id: &str) -> Result<Vec<Message>, AppError> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE thread_id = ? ORDER BY created_at ASC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    // =========================================================================
    // Instance keys
    // =========================================================================

    pub async fn get_instance_keys(
        &self,
        domain: &str,
    ) -> Result<Option<InstanceKeyRecord>, AppError> {
        let record = sqlx::query_as::<_, InstanceKeyRecord>(
            "SELECT * FROM instance_keys WHERE domain = ?",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Persist a keypair for `domain` and return whichever pair is stored
    ///
    /// A concurrent writer that got there first wins; its keys are returned.
    pub async fn store_instance_keys(
        &self,
        domain: &str,
        public_key_pem: &str,
        private_key_pem: &str,
    ) -> Result<InstanceKeyRecord, AppError> {
        sqlx::query(
            r#"
            INSERT INTO instance_keys (domain, public_key_pem, private_key_pem, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(domain) DO NOTHING
            "#,
        )
        .bind(domain)
        .bind(public_key_pem)
        .bind(private_key_pem)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        self.get_instance_keys(domain)
            .await?
            .ok_or_else(|| AppError::Crypto(format!("instance keys for {} not persisted", domain)))
    }

    // =========================================================================
    // Remote actor cache
    // =========================================================================

    pub async fn get_remote_actor_by_handle(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>(
            r#"
            SELECT * FROM remote_actors
            WHERE username = ? AND domain = ?
            ORDER BY last_fetched_at DESC
            LIMIT 1
            "#,
        )
        .bind(username)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    pub async fn get_remote_actor(&self, actor_uri: &str) -> Result<Option<RemoteActor>, AppError> {
        let actor =
            sqlx::query_as::<_, RemoteActor>("SELECT * FROM remote_actors WHERE actor_uri = ?")
                .bind(actor_uri)
                .fetch_optional(&self.pool)
                .await?;
        Ok(actor)
    }

    /// Insert or refresh a cached actor keyed by its URI
    pub async fn upsert_remote_actor(&self, actor: &RemoteActor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO remote_actors (
                actor_uri, username, domain, inbox_url, outbox_url, shared_inbox_url,
                public_key_pem, display_name, avatar_url, last_fetched_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(actor_uri) DO UPDATE SET
                username = excluded.username,
                domain = excluded.domain,
                inbox_url = excluded.inbox_url,
                outbox_url = excluded.outbox_url,
                shared_inbox_url = excluded.shared_inbox_url,
                public_key_pem = excluded.public_key_pem,
                display_name = excluded.display_name,
                avatar_url = excluded.avatar_url,
                last_fetched_at = excluded.last_fetched_at
            "#,
        )
        .bind(&actor.actor_uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.inbox_url)
        .bind(&actor.outbox_url)
        .bind(&actor.shared_inbox_url)
        .bind(&actor.public_key_pem)
        .bind(&actor.display_name)
        .bind(&actor.avatar_url)
        .bind(format_timestamp(actor.last_fetched_at))
        .bind(format_timestamp(actor.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Patch cached actor metadata, leaving blank fields untouched
    pub async fn patch_remote_actor(
        &self,
        actor_uri: &str,
        display_name: &str,
        avatar_url: &str,
        public_key_pem: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE remote_actors SET
                display_name = COALESCE(NULLIF(?, ''), display_name),
                avatar_url = COALESCE(NULLIF(?, ''), avatar_url),
                public_key_pem = COALESCE(NULLIF(?, ''), public_key_pem),
                last_fetched_at = ?
            WHERE actor_uri = ?
            "#,
        )
        .bind(display_name)
        .bind(avatar_url)
        .bind(public_key_pem)
        .bind(now_ts())
        .bind(actor_uri)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_remote_actors(&self) -> Result<Vec<RemoteActor>, AppError> {
        let actors = sqlx::query_as::<_, RemoteActor>(
            "SELECT * FROM remote_actors ORDER BY domain, username",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(actors)
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Record a new pending delivery, eligible for retry immediately
    /// Record a new delivery attempt in flight
    ///
    /// `lease_until` keeps the retry sweep off the entry while the first
    /// attempt runs; an attempt that never reports back is retried after it.
    pub async fn insert_outbox_entry(
        &self,
        activity_id: &str,
        activity_type: &str,
        payload: &str,
        target_inbox: &str,
        target_domain: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<OutboxEntry, AppError> {
        let id = EntityId::new().0;
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO outbox_activities (
                id, activity_id, activity_type, payload, target_inbox, target_domain,
                status, retry_count, next_retry_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(activity_id)
        .bind(activity_type)
        .bind(payload)
        .bind(target_inbox)
        .bind(target_domain)
        .bind(format_timestamp(lease_until))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_outbox_entry(&id).await?.ok_or(AppError::NotFound)
    }

    /// Take the delivery lease on a stored entry
    ///
    /// Without `force` only a due entry is taken. With it, any failed entry
    /// is taken too. A `pending` entry whose lease has not run out belongs
    /// to another attempt and is never taken.
    pub async fn claim_outbox_entry(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        force: bool,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_activities
            SET status = 'pending', next_retry_at = ?, updated_at = ?
            WHERE id = ?
              AND status IN ('pending', 'failed')
              AND (
                  (next_retry_at IS NOT NULL AND next_retry_at <= ?)
                  OR (? AND status = 'failed')
              )
            "#,
        )
        .bind(format_timestamp(lease_until))
        .bind(now_ts())
        .bind(id)
        .bind(format_timestamp(now))
        .bind(force)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_outbox_entry(&self, id: &str) -> Result<Option<OutboxEntry>, AppError> {
        let entry =
            sqlx::query_as::<_, OutboxEntry>("SELECT * FROM outbox_activities WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(entry)
    }

    pub async fn mark_outbox_sent(&self, id: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE outbox_activities
            SET status = 'sent', next_retry_at = NULL, last_error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a transient failure: bump the attempt counter and schedule a retry
    ///
    /// `next_retry_at = None` abandons the entry.
    pub async fn mark_outbox_failed(
        &self,
        id: &str,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE outbox_activities
            SET status = 'failed',
                retry_count = retry_count + 1,
                last_error = ?,
                next_retry_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(truncate_error(error))
        .bind(next_retry_at.map(format_timestamp))
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Defer an entry without consuming an attempt
    pub async fn defer_outbox_entry(
        &self,
        id: &str,
        error: &str,
        until: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE outbox_activities
            SET status = 'failed', last_error = ?, next_retry_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(truncate_error(error))
        .bind(format_timestamp(until))
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Entries due for another attempt, oldest first
    pub async fn list_retryable_outbox(
        &self,
        max_retries: u32,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, AppError> {
        let entries = sqlx::query_as::<_, OutboxEntry>(
            r#"
            SELECT * FROM outbox_activities
            WHERE status IN ('pending', 'failed')
              AND retry_count < ?
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= ?
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(max_retries as i64)
        .bind(format_timestamp(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Most recent successfully sent activities authored by `actor_uri`
    pub async fn list_sent_activities(
        &self,
        actor_uri: &str,
        limit: u32,
    ) -> Result<Vec<String>, AppError> {
        let payloads: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT payload FROM outbox_activities
            WHERE status = 'sent' AND json_extract(payload, '$.actor') = ?
            GROUP BY activity_id
            ORDER BY MAX(created_at) DESC
            LIMIT ?
            "#,
        )
        .bind(actor_uri)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(payloads)
    }

    pub async fn count_outbox_by_status(&self, status: OutboxStatus) -> Result<i64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_activities WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Domains whose circuit is open at `now`
    pub async fn count_open_circuits(&self, now: DateTime<Utc>) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM federation_failures WHERE circuit_open_until > ?",
        )
        .bind(format_timestamp(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // =========================================================================
    // Inbox & deduplication
    // =========================================================================

    /// Persist a raw inbound activity; duplicates are ignored
    pub async fn insert_inbox_activity(
        &self,
        activity_id: &str,
        actor_uri: &str,
        activity_type: &str,
        payload: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO inbox_activities (activity_id, actor_uri, activity_type, payload, received_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(activity_id)
        .bind(actor_uri)
        .bind(activity_type)
        .bind(payload)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_inbox_activity(
        &self,
        activity_id: &str,
    ) -> Result<Option<InboxRecord>, AppError> {
        let record = sqlx::query_as::<_, InboxRecord>(
            "SELECT * FROM inbox_activities WHERE activity_id = ?",
        )
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Whether an unexpired dedup record exists for `activity_id`
    pub async fn is_activity_processed(&self, activity_id: &str) -> Result<bool, AppError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM activity_deduplication WHERE activity_id = ? AND expires_at > ?",
        )
        .bind(activity_id)
        .bind(now_ts())
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Atomically claim `activity_id` for processing
    ///
    /// Returns `false` when an unexpired claim already exists. An expired
    /// record is taken over.
    pub async fn claim_activity(
        &self,
        activity_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            INSERT INTO activity_deduplication (activity_id, processed_at, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(activity_id) DO UPDATE SET
                processed_at = excluded.processed_at,
                expires_at = excluded.expires_at
            WHERE activity_deduplication.expires_at <= ?2
            "#,
        )
        .bind(activity_id)
        .bind(&now)
        .bind(format_timestamp(expires_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop a claim so a redelivery is processed again
    pub async fn release_activity(&self, activity_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM activity_deduplication WHERE activity_id = ?")
            .bind(activity_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn purge_expired_dedup(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM activity_deduplication WHERE expires_at <= ?")
            .bind(format_timestamp(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Circuit breaker & connection ledger
    // =========================================================================

    /// Count a failure; opens the circuit when the count reaches `threshold`
    ///
    /// Returns the updated state.
    pub async fn record_domain_failure(
        &self,
        domain: &str,
        error: &str,
        threshold: u32,
        open_until: DateTime<Utc>,
    ) -> Result<DomainFailureState, AppError> {
        let now = now_ts();
        let state = sqlx::query_as::<_, DomainFailureState>(
            r#"
            INSERT INTO federation_failures (domain, failure_count, last_failure_at, circuit_open_until, last_error, updated_at)
            VALUES (?1, 1, ?2, CASE WHEN 1 >= ?3 THEN ?4 ELSE NULL END, ?5, ?2)
            ON CONFLICT(domain) DO UPDATE SET
                failure_count = federation_failures.failure_count + 1,
                last_failure_at = ?2,
                circuit_open_until = CASE
                    WHEN federation_failures.failure_count + 1 >= ?3 THEN ?4
                    ELSE federation_failures.circuit_open_until
                END,
                last_error = ?5,
                updated_at = ?2
            RETURNING *
            "#,
        )
        .bind(domain)
        .bind(&now)
        .bind(threshold as i64)
        .bind(format_timestamp(open_until))
        .bind(truncate_error(error))
        .fetch_one(&self.pool)
        .await?;
        Ok(state)
    }

    /// Reset the failure counter and close the circuit
    pub async fn record_domain_success(&self, domain: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO federation_failures (domain, failure_count, last_failure_at, circuit_open_until, last_error, updated_at)
            VALUES (?1, 0, NULL, NULL, NULL, ?2)
            ON CONFLICT(domain) DO UPDATE SET
                failure_count = 0,
                last_failure_at = NULL,
                circuit_open_until = NULL,
                last_error = NULL,
                updated_at = ?2
            "#,
        )
        .bind(domain)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_domain_failure_state(
        &self,
        domain: &str,
    ) -> Result<Option<DomainFailureState>, AppError> {
        let state = sqlx::query_as::<_, DomainFailureState>(
            "SELECT * FROM federation_failures WHERE domain = ?",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    pub async fn list_domain_failure_states(&self) -> Result<Vec<DomainFailureState>, AppError> {
        let states = sqlx::query_as::<_, DomainFailureState>(
            "SELECT * FROM federation_failures ORDER BY failure_count DESC, domain ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    pub async fn record_connection(
        &self,
        source_domain: &str,
        target_domain: &str,
        status: OutboxStatus,
    ) -> Result<(), AppError> {
        let sent = i64::from(status == OutboxStatus::Sent);
        let failed = i64::from(status == OutboxStatus::Failed);
        sqlx::query(
            r#"
            INSERT INTO federation_connections (source_domain, target_domain, success_count, failure_count, last_status, last_seen)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_domain, target_domain) DO UPDATE SET
                success_count = federation_connections.success_count + excluded.success_count,
                failure_count = federation_connections.failure_count + excluded.failure_count,
                last_status = excluded.last_status,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(source_domain)
        .bind(target_domain)
        .bind(sent)
        .bind(failed)
        .bind(status.as_str())
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_connections(&self) -> Result<Vec<DomainConnectionStats>, AppError> {
        let rows = sqlx::query_as::<_, DomainConnectionStats>(
            "SELECT * FROM federation_connections ORDER BY last_seen DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // =========================================================================
    // Reputation
    // =========================================================================

    /// Every domain known through actors, blocks, failures or outbox targets
    pub async fn list_known_domains(&self) -> Result<Vec<String>, AppError> {
        let domains: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT domain FROM (
                SELECT domain FROM remote_actors
                UNION SELECT domain FROM blocked_domains
                UNION SELECT domain FROM federation_failures
                UNION SELECT target_domain AS domain FROM outbox_activities
            )
            WHERE domain IS NOT NULL AND domain != ''
            ORDER BY domain
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(domains)
    }

    /// Block actions against `domain` citing spam or abuse since `since`
    pub async fn count_spam_signals(
        &self,
        domain: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM admin_actions
            WHERE action_type = 'block_domain'
              AND target = ?
              AND (LOWER(COALESCE(reason, '')) LIKE '%spam%' OR LOWER(COALESCE(reason, '')) LIKE '%abuse%')
              AND created_at > ?
            "#,
        )
        .bind(domain)
        .bind(format_timestamp(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_deliveries(
        &self,
        domain: &str,
        status: OutboxStatus,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM outbox_activities
            WHERE target_domain = ? AND status = ? AND created_at > ?
            "#,
        )
        .bind(domain)
        .bind(status.as_str())
        .bind(format_timestamp(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn upsert_reputation(&self, reputation: &DomainReputation) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO instance_reputation (domain, reputation_score, spam_count, failure_count, success_count, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET
                reputation_score = excluded.reputation_score,
                spam_count = excluded.spam_count,
                failure_count = excluded.failure_count,
                success_count = excluded.success_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&reputation.domain)
        .bind(reputation.reputation_score)
        .bind(reputation.spam_count)
        .bind(reputation.failure_count)
        .bind(reputation.success_count)
        .bind(format_timestamp(reputation.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_reputations(&self) -> Result<Vec<DomainReputation>, AppError> {
        let rows = sqlx::query_as::<_, DomainReputation>(
            "SELECT * FROM instance_reputation ORDER BY reputation_score ASC, domain ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_reputation(&self, domain: &str) -> Result<Option<DomainReputation>, AppError> {
        let row = sqlx::query_as::<_, DomainReputation>(
            "SELECT * FROM instance_reputation WHERE domain = ?",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // =========================================================================
    // Domain blocks & admin actions
    // =========================================================================

    pub async fn is_domain_blocked(&self, domain: &str) -> Result<bool, AppError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM blocked_domains WHERE domain = ?")
                .bind(domain)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Block a domain and log the admin action in one transaction
    pub async fn block_domain(&self, domain: &str, reason: Option<&str>) -> Result<(), AppError> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO blocked_domains (domain, reason, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET reason = excluded.reason
            "#,
        )
        .bind(domain)
        .bind(reason)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO admin_actions (id, action_type, target, reason, created_at)
            VALUES (?, 'block_domain', ?, ?, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(domain)
        .bind(reason)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn unblock_domain(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM blocked_domains WHERE domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            sqlx::query(
                r#"
                INSERT INTO admin_actions (id, action_type, target, reason, created_at)
                VALUES (?, 'unblock_domain', ?, NULL, ?)
                "#,
            )
            .bind(EntityId::new().0)
            .bind(domain)
            .bind(now_ts())
            .execute(&self.pool)
            .await?;
        }

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_blocked_domains(&self) -> Result<Vec<BlockedDomain>, AppError> {
        let rows = sqlx::query_as::<_, BlockedDomain>(
            "SELECT * FROM blocked_domains ORDER BY domain ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
