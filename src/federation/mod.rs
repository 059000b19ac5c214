//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures and the instance keypair
//! - WebFinger and remote actor resolution
//! - Activity building and delivery (outbox, retry, circuit breaker)
//! - Inbound activity dispatch (inbox, deduplication)
//! - Messaging rate limits and domain reputation
//! - Background sweeps

mod activity;
mod builder;
mod delivery;
mod guard;
mod identity;
mod inbox;
mod policy;
mod reputation;
mod resolver;
mod signature;
mod webfinger;
mod worker;

pub use activity::{
    AS_CONTEXT, ActivityEnvelope, ActivityType, PUBLIC, is_public, post_id_from_uri,
    sanitize_remote_html,
};
pub use builder::ProfileUpdate;
pub use delivery::{DeliveryEngine, FanOutReport, RetrySummary};
pub use guard::{GuardSnapshot, MessagingGuard, SecurityEvent};
pub use identity::{INSTANCE_ACTOR, InstanceIdentity, InstanceKeys};
pub use inbox::{ALREADY_PROCESSED, InboundRequest, InboxDispatcher};
pub use policy::{DeliveryPolicy, PolicyUpdate, backoff_delay};
pub use reputation::score as reputation_score;
pub use resolver::{ActorResolver, InstanceDirectory, username_from_actor_uri};
pub use signature::{
    SignatureHeaders, generate_digest, key_id_matches_actor, parse_signature_header,
    sign_request, verify_signature,
};
pub use webfinger::{ACTIVITY_JSON, Handle, WebFingerResponse, generate_webfinger_response};
pub use worker::{FederationWorker, RetrySweep};

/// Activity JSON builders
pub mod build {
    pub use super::builder::{
        accept, announce, create_direct_message, create_note, delete, follow, like, undo,
        update_person,
    };
}
