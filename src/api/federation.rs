//! Local-client federation endpoints
//!
//! Entry points through which local users reach remote instances: search,
//! follow, publish, interact, message. All routes require the bearer token.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::AppState;
use crate::data::{FollowStatus, InteractionKind, User};
use crate::error::AppError;
use crate::federation::{Handle, ProfileUpdate, build, post_id_from_uri};

/// Create federation router
///
/// Routes:
/// - GET /api/federation/users?q= - Search local and remote users
/// - POST /api/federation/follow - Follow a remote user
/// - POST /api/federation/unfollow - Undo a follow
/// - POST /api/federation/posts - Publish a post to followers
/// - DELETE /api/federation/posts/:id - Delete a post everywhere
/// - POST /api/federation/interactions - Like or boost a post
/// - POST /api/federation/messages - Send a direct message
/// - PUT /api/federation/profile - Update and broadcast a profile
pub fn federation_router() -> Router<AppState> {
    Router::new()
        .route("/users", get(search_users))
        .route("/follow", post(follow_remote))
        .route("/unfollow", post(unfollow_remote))
        .route("/posts", post(create_post))
        .route("/posts/:id", delete(delete_post))
        .route("/interactions", post(interact))
        .route("/messages", post(send_message))
        .route("/profile", put(update_profile))
}

async fn local_user(state: &AppState, username: &str) -> Result<User, AppError> {
    state
        .db
        .get_local_user(username)
        .await?
        .ok_or(AppError::NotFound)
}

fn require_federation(state: &AppState) -> Result<(), AppError> {
    if state.config.federation.enabled {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

// =============================================================================
// Search
// =============================================================================

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

/// User search result
#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub domain: String,
    pub avatar_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_uri: Option<String>,
    pub is_remote: bool,
}

impl UserSummary {
    fn from_user(user: User, actor_uri: Option<String>) -> Self {
        Self {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            domain: user.instance_domain,
            avatar_url: user.avatar_url,
            actor_uri,
            is_remote: user.is_remote,
        }
    }
}

/// GET /api/federation/users?q=@user@domain
///
/// A full handle on another instance is resolved over WebFinger and gets a
/// ghost user. A bare query matches local usernames and cached actors.
async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, AppError> {
    let q = query
        .q
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| AppError::Validation("query parameter 'q' required".to_string()))?;

    let mut users = Vec::new();
    if q.trim_start_matches('@').contains('@') {
        let handle = Handle::parse(&q)?;
        if handle.domain == state.identity.domain() {
            if let Some(user) = state.db.get_local_user(&handle.username).await? {
                let actor_uri = state.identity.actor_uri(&user.username);
                users.push(UserSummary::from_user(user, Some(actor_uri)));
            }
        } else {
            require_federation(&state)?;
            match state.resolver.resolve_remote_user(&q).await {
                Ok(actor) => {
                    let ghost = state.resolver.ensure_remote_user(&actor.actor_uri).await?;
                    users.push(UserSummary::from_user(ghost, Some(actor.actor_uri)));
                }
                Err(error) => {
                    tracing::info!(handle = %q, %error, "Remote user search found nothing");
                }
            }
        }
    } else {
        let needle = q.to_lowercase();
        if let Some(user) = state.db.get_local_user(&needle).await? {
            let actor_uri = state.identity.actor_uri(&user.username);
            users.push(UserSummary::from_user(user, Some(actor_uri)));
        }
        for actor in state.db.list_remote_actors().await? {
            if actor.username.to_lowercase().contains(&needle)
                || actor.display_name.to_lowercase().contains(&needle)
            {
                users.push(UserSummary {
                    id: String::new(),
                    username: actor.username,
                    display_name: actor.display_name,
                    domain: actor.domain,
                    avatar_url: actor.avatar_url,
                    actor_uri: Some(actor.actor_uri),
                    is_remote: true,
                });
            }
        }
    }

    Ok(Json(json!({ "total": users.len(), "users": users })))
}

// =============================================================================
// Follow graph
// =============================================================================

#[derive(Debug, Deserialize)]
struct FollowRequest {
    username: String,
    handle: String,
}

/// POST /api/federation/follow
///
/// Stores a pending edge keyed by the Follow id, then delivers the Follow.
/// A transient delivery failure leaves the Follow queued for retry.
async fn follow_remote(
    State(state): State<AppState>,
    Json(req): Json<FollowRequest>,
) -> Result<Json<Value>, AppError> {
    require_federation(&state)?;
    let user = local_user(&state, &req.username).await?;
    let remote = state.resolver.resolve_remote_user(&req.handle).await?;

    if let Some(edge) = state.db.get_follow(&user.did, &remote.actor_uri).await? {
        if edge.status == FollowStatus::Accepted.as_str() {
            return Ok(Json(json!({
                "status": "already_following",
                "target": req.handle,
            })));
        }
    }

    let actor_uri = state.identity.actor_uri(&user.username);
    let activity = build::follow(&actor_uri, &remote.actor_uri);
    let follow_id = activity["id"].as_str().unwrap_or_default().to_string();
    state
        .db
        .upsert_follow(
            &user.did,
            &remote.actor_uri,
            FollowStatus::Pending,
            Some(&follow_id),
        )
        .await?;

    let status = match state.delivery.deliver_activity(&activity, &remote.inbox_url).await {
        Ok(()) => "follow_sent",
        Err(error @ AppError::PolicyRejected(_)) => return Err(error),
        Err(error) => {
            tracing::warn!(target = %remote.actor_uri, %error, "Follow queued for retry");
            "follow_queued"
        }
    };

    Ok(Json(json!({
        "status": status,
        "target": req.handle,
        "follow_id": follow_id,
    })))
}

/// POST /api/federation/unfollow
///
/// Removes the edge and sends Undo{Follow} referencing the original Follow.
async fn unfollow_remote(
    State(state): State<AppState>,
    Json(req): Json<FollowRequest>,
) -> Result<Json<Value>, AppError> {
    require_federation(&state)?;
    let user = local_user(&state, &req.username).await?;
    let remote = state.resolver.resolve_remote_user(&req.handle).await?;
    let edge = state
        .db
        .get_follow(&user.did, &remote.actor_uri)
        .await?
        .ok_or(AppError::NotFound)?;

    let actor_uri = state.identity.actor_uri(&user.username);
    let original = match edge.follow_activity_id {
        Some(id) => json!({
            "id": id,
            "type": "Follow",
            "actor": actor_uri,
            "object": remote.actor_uri,
        }),
        None => build::follow(&actor_uri, &remote.actor_uri),
    };
    let undo = build::undo(state.identity.base_url(), &actor_uri, original);

    state.db.delete_follow(&user.did, &remote.actor_uri).await?;
    if let Err(error) = state.delivery.deliver_activity(&undo, &remote.inbox_url).await {
        tracing::warn!(target = %remote.actor_uri, %error, "Undo{{Follow}} not delivered");
    }

    Ok(Json(json!({ "status": "unfollowed", "target": req.handle })))
}

// =============================================================================
// Posts
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreatePostRequest {
    username: String,
    content: String,
    #[serde(default = "default_visibility")]
    visibility: String,
}

fn default_visibility() -> String {
    "public".to_string()
}

/// POST /api/federation/posts
///
/// Stores the post and fans the Create out in the background.
async fn create_post(
    State(state): State<AppState>,
    Json(req): Json<CreatePostRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if req.content.trim().is_empty() {
        return Err(AppError::Validation("content must not be empty".to_string()));
    }
    if !matches!(req.visibility.as_str(), "public" | "unlisted" | "followers") {
        return Err(AppError::Validation(format!(
            "unsupported visibility '{}'",
            req.visibility
        )));
    }

    let user = local_user(&state, &req.username).await?;
    let post = state
        .db
        .insert_local_post(&user.did, &req.content, &req.visibility)
        .await?;

    let actor_uri = state.identity.actor_uri(&user.username);
    let activity = build::create_note(
        state.identity.base_url(),
        &actor_uri,
        &post.id,
        &format!("<p>{}</p>", html_escape::encode_text(&post.content)),
        &post.visibility,
        post.created_at,
    );
    let activity_id = activity["id"].clone();

    if state.config.federation.enabled {
        fan_out_in_background(&state, activity, user.did.clone());
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "post": post, "activity_id": activity_id })),
    ))
}

#[derive(Debug, Deserialize)]
struct UsernameQuery {
    username: String,
}

/// DELETE /api/federation/posts/:id?username=
async fn delete_post(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Query(query): Query<UsernameQuery>,
) -> Result<Json<Value>, AppError> {
    let user = local_user(&state, &query.username).await?;
    let post = state
        .db
        .find_post("", Some(&post_id))
        .await?
        .filter(|post| post.author_did == user.did)
        .ok_or(AppError::NotFound)?;

    state.db.soft_delete_post("", Some(&post.id)).await?;

    if state.config.federation.enabled {
        let base_url = state.identity.base_url();
        let activity = build::delete(
            base_url,
            &state.identity.actor_uri(&user.username),
            &format!("{}/posts/{}", base_url, post.id),
        );
        fan_out_in_background(&state, activity, user.did);
    }

    Ok(Json(json!({ "status": "deleted", "id": post.id })))
}

fn fan_out_in_background(state: &AppState, activity: Value, author_did: String) {
    let delivery = state.delivery.clone();
    tokio::spawn(async move {
        match delivery.deliver_to_followers(&activity, &author_did).await {
            Ok(report) => tracing::info!(
                activity = %activity["id"],
                targets = report.targets,
                delivered = report.delivered,
                failed = report.failed,
                "Fan-out finished"
            ),
            Err(error) => tracing::error!(activity = %activity["id"], %error, "Fan-out failed"),
        }
    });
}

// =============================================================================
// Interactions
// =============================================================================

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum InteractionRequestKind {
    Like,
    Announce,
}

#[derive(Debug, Deserialize)]
struct InteractionRequest {
    username: String,
    /// Remote note URI or local post id
    object: String,
    kind: InteractionRequestKind,
}

/// POST /api/federation/interactions
///
/// Records the interaction locally; remote posts also get the activity
/// delivered to their author.
async fn interact(
    State(state): State<AppState>,
    Json(req): Json<InteractionRequest>,
) -> Result<Json<Value>, AppError> {
    let user = local_user(&state, &req.username).await?;
    let local_id = post_id_from_uri(&req.object).unwrap_or_else(|| req.object.clone());
    let post = state
        .db
        .find_post(&req.object, Some(&local_id))
        .await?
        .ok_or(AppError::NotFound)?;

    let kind = match req.kind {
        InteractionRequestKind::Like => InteractionKind::Like,
        InteractionRequestKind::Announce => InteractionKind::Repost,
    };
    let created = state.db.insert_interaction(&post.id, &user.did, kind).await?;

    let mut delivered = false;
    if let (true, true, Some(object_uri)) = (
        created,
        state.config.federation.enabled,
        post.original_post_uri.as_deref().filter(|_| post.is_remote),
    ) {
        let base_url = state.identity.base_url();
        let actor_uri = state.identity.actor_uri(&user.username);
        let activity = match req.kind {
            InteractionRequestKind::Like => build::like(base_url, &actor_uri, object_uri),
            InteractionRequestKind::Announce => build::announce(base_url, &actor_uri, object_uri),
        };
        match state.delivery.deliver_to_actor(&activity, &post.author_did).await {
            Ok(()) => delivered = true,
            Err(error) => {
                tracing::warn!(author = %post.author_did, %error, "Interaction not delivered");
            }
        }
    }

    Ok(Json(json!({
        "status": if created { "recorded" } else { "unchanged" },
        "delivered": delivered,
    })))
}

// =============================================================================
// Direct messages
// =============================================================================

#[derive(Debug, Deserialize)]
struct MessageRequest {
    username: String,
    /// `user@domain` handle or actor URI
    recipient: String,
    content: String,
}

/// POST /api/federation/messages
///
/// Rate-limited per sender, stored in the local thread, then delivered.
async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<Value>, AppError> {
    require_federation(&state)?;
    if req.content.trim().is_empty() {
        return Err(AppError::Validation("content must not be empty".to_string()));
    }
    let sender = local_user(&state, &req.username).await?;
    state.guard.allow_local_send(&sender.id, 1)?;

    let remote = if req.recipient.starts_with("http://") || req.recipient.starts_with("https://") {
        state.resolver.resolve_actor_from_uri(&req.recipient).await?
    } else {
        state.resolver.resolve_remote_user(&req.recipient).await?
    };
    let recipient = state.resolver.ensure_remote_user(&remote.actor_uri).await?;

    let sender_uri = state.identity.actor_uri(&sender.username);
    let activity = build::create_direct_message(
        state.identity.base_url(),
        &sender_uri,
        &remote.actor_uri,
        &html_escape::encode_text(&req.content),
    );
    let activity_id = activity["id"].as_str().unwrap_or_default().to_string();

    let thread = state
        .db
        .get_or_create_thread(&sender.id, &recipient.id)
        .await?;
    state
        .db
        .insert_message(
            &thread.id,
            &sender.id,
            &recipient.id,
            &req.content,
            Some(&activity_id),
        )
        .await?;

    let status = match state.delivery.deliver_activity(&activity, &remote.inbox_url).await {
        Ok(()) => "delivered",
        Err(error @ AppError::PolicyRejected(_)) => return Err(error),
        Err(error) => {
            tracing::warn!(recipient = %remote.actor_uri, %error, "Direct message queued for retry");
            "queued"
        }
    };

    Ok(Json(json!({
        "status": status,
        "thread_id": thread.id,
        "activity_id": activity_id,
    })))
}

// =============================================================================
// Profile
// =============================================================================

#[derive(Debug, Deserialize)]
struct ProfileRequest {
    username: String,
    display_name: Option<String>,
    bio: Option<String>,
    avatar_url: Option<String>,
}

/// PUT /api/federation/profile
///
/// Updates the local profile and broadcasts Update{Person} to followers.
async fn update_profile(
    State(state): State<AppState>,
    Json(req): Json<ProfileRequest>,
) -> Result<Json<User>, AppError> {
    let user = state
        .db
        .update_local_profile(
            &req.username,
            req.display_name.as_deref(),
            req.bio.as_deref(),
            req.avatar_url.as_deref(),
        )
        .await?
        .ok_or(AppError::NotFound)?;

    if state.config.federation.enabled {
        let public_key_pem = state.identity.public_key_pem().await?;
        let activity = build::update_person(
            state.identity.base_url(),
            &state.identity.actor_uri(&user.username),
            &ProfileUpdate {
                username: &user.username,
                display_name: &user.display_name,
                summary: &user.bio,
                avatar_url: &user.avatar_url,
                public_key_pem: &public_key_pem,
            },
        );
        fan_out_in_background(&state, activity, user.did.clone());
    }

    Ok(Json(user))
}
