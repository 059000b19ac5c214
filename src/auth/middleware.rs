//! Authentication middleware
//!
//! Protects operator and local-client routes with the configured bearer token.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};

use crate::AppState;
use crate::error::AppError;

/// Compare without short-circuiting on the first differing byte
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Middleware requiring `Authorization: Bearer <admin.api_token>`
///
/// # Usage
/// ```ignore
/// let protected_routes = Router::new()
///     .route("/federation/policy", ...)
///     .layer(middleware::from_fn_with_state(state, require_admin_token));
/// ```
pub async fn require_admin_token(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(AppError::Unauthorized)?;
    if !tokens_match(bearer.token(), &state.config.admin.api_token) {
        tracing::warn!(path = %request.uri().path(), "Rejected request with invalid bearer token");
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_must_match_exactly() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "secreT"));
        assert!(!tokens_match("secret", "secret-longer"));
        assert!(!tokens_match("", "secret"));
    }
}
