//! Admin API endpoints
//!
//! Federation operations and domain blocks.
//! All routes require the admin bearer token.

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::data::{BlockedDomain, DomainConnectionStats, DomainFailureState, DomainReputation};
use crate::error::AppError;
use crate::federation::{DeliveryPolicy, GuardSnapshot, PolicyUpdate};

/// Create admin router
///
/// Routes:
/// - GET /api/admin/federation/policy - Current delivery policy
/// - PUT /api/admin/federation/policy - Update delivery policy
/// - GET /api/admin/federation/circuits - Per-domain failure state
/// - GET /api/admin/federation/reputation - Domain reputation scores
/// - GET /api/admin/federation/connections - Delivery connection ledger
/// - POST /api/admin/federation/retry/:id - Retry one outbox entry
/// - GET /api/admin/security/messaging - Messaging guard snapshot
/// - POST /api/admin/domain_blocks - Block domain
/// - DELETE /api/admin/domain_blocks/:domain - Unblock domain
/// - GET /api/admin/domain_blocks - List blocked domains
pub fn admin_router() -> Router<AppState> {
    Router::new()
        // Federation
        .route("/federation/policy", get(get_policy).put(update_policy))
        .route("/federation/circuits", get(list_circuits))
        .route("/federation/reputation", get(list_reputation))
        .route("/federation/connections", get(list_connections))
        .route("/federation/retry/:id", post(retry_outbox_entry))
        // Security
        .route("/security/messaging", get(messaging_snapshot))
        // Domain blocks
        .route("/domain_blocks", post(block_domain).get(list_domain_blocks))
        .route("/domain_blocks/:domain", delete(unblock_domain))
}

// =============================================================================
// Federation
// =============================================================================

/// GET /api/admin/federation/policy
async fn get_policy(State(state): State<AppState>) -> Json<DeliveryPolicy> {
    Json(state.delivery.policy())
}

/// PUT /api/admin/federation/policy
///
/// Absent or non-positive values leave the current setting unchanged.
async fn update_policy(
    State(state): State<AppState>,
    Json(update): Json<PolicyUpdate>,
) -> Json<DeliveryPolicy> {
    let policy = state.delivery.configure(&update);
    tracing::info!(
        max_retries = policy.max_retries,
        circuit_failure_threshold = policy.circuit_failure_threshold,
        circuit_cooldown_seconds = policy.circuit_cooldown_seconds,
        "Delivery policy updated"
    );
    Json(policy)
}

/// GET /api/admin/federation/circuits
async fn list_circuits(
    State(state): State<AppState>,
) -> Result<Json<Vec<DomainFailureState>>, AppError> {
    Ok(Json(state.db.list_domain_failure_states().await?))
}

/// GET /api/admin/federation/reputation
async fn list_reputation(
    State(state): State<AppState>,
) -> Result<Json<Vec<DomainReputation>>, AppError> {
    Ok(Json(state.db.list_reputations().await?))
}

/// GET /api/admin/federation/connections
async fn list_connections(
    State(state): State<AppState>,
) -> Result<Json<Vec<DomainConnectionStats>>, AppError> {
    Ok(Json(state.db.list_connections().await?))
}

/// POST /api/admin/federation/retry/:id
///
/// A failed attempt is reported in the body; the entry stays queued.
async fn retry_outbox_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let result = state.delivery.retry_outbox_activity(&id).await;
    let entry = state
        .db
        .get_outbox_entry(&id)
        .await?
        .ok_or(AppError::NotFound)?;

    match result {
        Ok(()) => Ok(Json(json!({ "status": "sent", "entry": entry }))),
        Err(AppError::NotFound) => Err(AppError::NotFound),
        Err(error) => Ok(Json(json!({
            "status": "failed",
            "error": error.to_string(),
            "entry": entry,
        }))),
    }
}

// =============================================================================
// Security
// =============================================================================

/// GET /api/admin/security/messaging
async fn messaging_snapshot(State(state): State<AppState>) -> Json<GuardSnapshot> {
    Json(state.guard.snapshot())
}

// =============================================================================
// Domain blocks
// =============================================================================

/// Block domain request
#[derive(Debug, Deserialize)]
struct BlockDomainRequest {
    domain: String,
    reason: Option<String>,
}

/// POST /api/admin/domain_blocks
async fn block_domain(
    State(state): State<AppState>,
    Json(req): Json<BlockDomainRequest>,
) -> Result<StatusCode, AppError> {
    let domain = req.domain.trim().to_ascii_lowercase();
    if domain.is_empty() || domain.contains('/') {
        return Err(AppError::Validation(format!(
            "Invalid domain '{}'",
            req.domain
        )));
    }
    let reason = req.reason.as_deref().map(str::trim).filter(|r| !r.is_empty());

    state.db.block_domain(&domain, reason).await?;
    tracing::info!(%domain, reason = ?reason, "Domain blocked");
    Ok(StatusCode::CREATED)
}

/// DELETE /api/admin/domain_blocks/:domain
async fn unblock_domain(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<StatusCode, AppError> {
    let domain = domain.trim().to_ascii_lowercase();
    if !state.db.unblock_domain(&domain).await? {
        return Err(AppError::NotFound);
    }
    tracing::info!(%domain, "Domain unblocked");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/admin/domain_blocks
async fn list_domain_blocks(
    State(state): State<AppState>,
) -> Result<Json<Vec<BlockedDomain>>, AppError> {
    Ok(Json(state.db.list_blocked_domains().await?))
}
