//! Bearer-token authentication
//!
//! Session issuance lives outside this service; operator and local-client
//! routes share the configured admin token.

mod middleware;

pub use middleware::require_admin_token;
