//! Data models
//!
//! Rust structs representing federation and domain rows.
//! Local IDs are ULIDs; remote objects are keyed by their URI.

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

/// Render a timestamp in the single layout used for every stored column.
///
/// Fixed-width microseconds keep lexical and chronological order identical,
/// which the retry and reputation windows rely on.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

// =============================================================================
// Users, posts and interactions
// =============================================================================

/// Local user or ghost record for a remote actor
///
/// Ghost users carry `is_remote = true` and use the remote actor URI as `did`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub instance_domain: String,
    pub did: String,
    pub display_name: String,
    pub bio: String,
    pub avatar_url: String,
    pub is_remote: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: String,
    pub author_did: String,
    pub content: String,
    pub visibility: String,
    pub is_remote: bool,
    /// Note URI for remote posts
    pub original_post_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Interaction kinds stored in the `interactions` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Like,
    Repost,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Like => "like",
            InteractionKind::Repost => "repost",
        }
    }
}

// =============================================================================
// Follow graph
// =============================================================================

/// Follow edge status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowStatus {
    Pending,
    Accepted,
}

impl FollowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowStatus::Pending => "pending",
            FollowStatus::Accepted => "accepted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowEdge {
    pub follower_did: String,
    pub following_did: String,
    pub status: String,
    /// Id of the Follow activity that created a pending edge
    pub follow_activity_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Direct messages
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageThread {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub remote_activity_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Federation state
// =============================================================================

/// Persisted instance keypair, one row per domain
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceKeyRecord {
    pub domain: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
    pub created_at: DateTime<Utc>,
}

/// Cached remote actor metadata
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteActor {
    pub actor_uri: String,
    pub username: String,
    pub domain: String,
    pub inbox_url: String,
    pub outbox_url: Option<String>,
    pub shared_inbox_url: Option<String>,
    pub public_key_pem: Option<String>,
    pub display_name: String,
    pub avatar_url: String,
    pub last_fetched_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Outbox delivery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEntry {
    pub id: String,
    pub activity_id: String,
    pub activity_type: String,
    /// Serialized activity JSON
    pub payload: String,
    pub target_inbox: String,
    pub target_domain: String,
    pub status: String,
    pub retry_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InboxRecord {
    pub activity_id: String,
    pub actor_uri: String,
    pub activity_type: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// Per-domain circuit breaker state
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DomainFailureState {
    pub domain: String,
    pub failure_count: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub circuit_open_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Observability ledger row for source -> target delivery traffic
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DomainConnectionStats {
    pub source_domain: String,
    pub target_domain: String,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_status: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DomainReputation {
    pub domain: String,
    pub reputation_score: i64,
    pub spam_count: i64,
    pub failure_count: i64,
    pub success_count: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BlockedDomain {
    pub domain: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
