//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub and WebFinger (for federation)
//! - Local-client federation actions
//! - Admin API
//! - Metrics (Prometheus)

mod activitypub;
mod admin;
mod federation;
pub mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use admin::admin_router;
pub use federation::federation_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
