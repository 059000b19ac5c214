//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{Handle, INSTANCE_ACTOR, generate_webfinger_response};
use crate::metrics::HTTP_REQUEST_DURATION_SECONDS;

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: Option<String>,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local accounts and the instance actor.
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/.well-known/webfinger"])
        .start_timer();

    let resource = query
        .resource
        .filter(|resource| !resource.is_empty())
        .ok_or_else(|| AppError::Validation("resource parameter required".to_string()))?;
    if !resource.starts_with("acct:") {
        return Err(AppError::Validation(
            "resource must use acct: scheme".to_string(),
        ));
    }
    let handle = Handle::parse(&resource)?;

    let domain = state.identity.domain();
    if !handle.domain.eq_ignore_ascii_case(domain) {
        tracing::debug!(requested = %handle.domain, served = %domain, "WebFinger for foreign domain");
        return Err(AppError::NotFound);
    }
    if handle.username != INSTANCE_ACTOR
        && state.db.get_local_user(&handle.username).await?.is_none()
    {
        return Err(AppError::NotFound);
    }

    let mut response =
        generate_webfinger_response(&handle.username, domain, state.identity.base_url());
    response.subject = resource;

    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json; charset=utf-8")],
        Json(response),
    )
        .into_response())
}
