//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (personal and shared)
//! - Outbox

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::AppState;
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_JSON, ALREADY_PROCESSED, AS_CONTEXT, INSTANCE_ACTOR, InboundRequest,
};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS,
};

/// Sent activities listed by the outbox
const OUTBOX_PAGE_SIZE: u32 = 20;

/// Create ActivityPub router
///
/// Routes:
/// - GET /ap/users/:username - Actor document
/// - POST /ap/users/:username/inbox - Personal inbox
/// - POST /users/:username/inbox - Personal inbox (legacy path)
/// - POST /ap/shared-inbox - Shared inbox
/// - GET /ap/users/:username/outbox - Outbox
/// - GET /users/:username/outbox - Outbox (legacy path)
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/ap/users/:username", get(actor))
        .route("/ap/users/:username/inbox", post(inbox))
        .route("/users/:username/inbox", post(inbox))
        .route("/ap/shared-inbox", post(shared_inbox))
        .route("/ap/users/:username/outbox", get(outbox))
        .route("/users/:username/outbox", get(outbox))
}

fn activity_json(body: Value) -> Response {
    (
        [(header::CONTENT_TYPE, "application/activity+json; charset=utf-8")],
        Json(body),
    )
        .into_response()
}

fn accepts_activity_json(headers: &HeaderMap) -> bool {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    accept.is_empty()
        || accept.contains(ACTIVITY_JSON)
        || accept.contains("application/ld+json")
        || accept.contains("application/json")
        || accept.contains("*/*")
}

/// GET /ap/users/:username
///
/// Returns the Person document. The instance actor is served even
/// without a user row. Every actor publishes the instance key.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/ap/users/:username"])
        .start_timer();

    if !accepts_activity_json(&headers) {
        return Ok((
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({
                "error": "This endpoint serves ActivityPub actor data. Set Accept: application/activity+json"
            })),
        )
            .into_response());
    }

    let user = state.db.get_local_user(&username).await?;
    let (display_name, summary, avatar_url) = match &user {
        Some(user) => (
            user.display_name.clone(),
            user.bio.clone(),
            user.avatar_url.clone(),
        ),
        None if username == INSTANCE_ACTOR => (
            format!("{} instance", state.identity.domain()),
            String::new(),
            String::new(),
        ),
        None => return Err(AppError::NotFound),
    };

    let base_url = state.identity.base_url();
    let actor_url = state.identity.actor_uri(&username);
    let public_key_pem = state.identity.public_key_pem().await?;

    let mut document = json!({
        "@context": [AS_CONTEXT, "https://w3id.org/security/v1"],
        "id": actor_url,
        "type": if user.is_some() { "Person" } else { "Application" },
        "preferredUsername": username,
        "name": display_name,
        "inbox": format!("{}/inbox", actor_url),
        "outbox": format!("{}/outbox", actor_url),
        "followers": format!("{}/followers", actor_url),
        "following": format!("{}/following", actor_url),
        "endpoints": { "sharedInbox": state.identity.shared_inbox_url() },
        "publicKey": {
            "id": format!("{}#main-key", actor_url),
            "owner": actor_url,
            "publicKeyPem": public_key_pem
        }
    });
    if !summary.is_empty() {
        document["summary"] = json!(summary);
    }
    if !avatar_url.is_empty() {
        let url = if avatar_url.starts_with('/') {
            format!("{}{}", base_url, avatar_url)
        } else {
            avatar_url
        };
        document["icon"] = json!({"type": "Image", "mediaType": "image/jpeg", "url": url});
    }

    Ok(activity_json(document))
}

/// POST /ap/users/:username/inbox
///
/// The username is informational; routing is by the activity's object
/// and audience, so personal inboxes behave like the shared inbox.
async fn inbox(
    State(state): State<AppState>,
    Path(_username): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/ap/users/:username/inbox"])
        .start_timer();
    receive(&state, &method, &uri, &headers, &body).await
}

/// POST /ap/shared-inbox
async fn shared_inbox(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/ap/shared-inbox"])
        .start_timer();
    receive(&state, &method, &uri, &headers, &body).await
}

async fn receive(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Json<Value>, AppError> {
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let result = state
        .inbox
        .handle(InboundRequest {
            method: method.as_str(),
            path,
            headers,
            body,
        })
        .await;

    let outcome = match &result {
        Ok(ALREADY_PROCESSED) => "duplicate",
        Ok(_) => "success",
        Err(AppError::Forbidden) => "forbidden",
        Err(AppError::InvalidSignature(_)) => "unauthorized",
        Err(AppError::RateLimited(_)) => "throttled",
        Err(_) => "error",
    };
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", outcome])
        .inc();

    result.map(|status| Json(json!({ "status": status })))
}

/// GET /ap/users/:username/outbox
///
/// Returns the most recent activities this actor delivered.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/ap/users/:username/outbox"])
        .start_timer();

    if username != INSTANCE_ACTOR && state.db.get_local_user(&username).await?.is_none() {
        return Err(AppError::NotFound);
    }

    let actor_url = state.identity.actor_uri(&username);
    let items: Vec<Value> = state
        .db
        .list_sent_activities(&actor_url, OUTBOX_PAGE_SIZE)
        .await?
        .iter()
        .filter_map(|payload| serde_json::from_str(payload).ok())
        .collect();

    Ok(activity_json(json!({
        "@context": AS_CONTEXT,
        "id": format!("{}/outbox", actor_url),
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items
    })))
}
