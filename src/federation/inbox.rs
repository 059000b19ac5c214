//! Inbound activity processing
//!
//! Admission (block list, rate limit, signature) happens before anything is
//! stored. Each activity `id` is then claimed atomically, persisted raw
//! and dispatched on `type`. A claim lives for seven days so redeliveries
//! become no-ops; it is released again when processing fails.

use std::sync::Arc;

use chrono::{Duration, Utc};
use http::HeaderMap;
use serde_json::{Value, json};

use super::activity::{
    ActivityEnvelope, ActivityType, audience, is_actor_uri, post_id_from_uri,
    sanitize_remote_html, value_id,
};
use super::builder;
use super::delivery::DeliveryEngine;
use super::guard::MessagingGuard;
use super::identity::{INSTANCE_ACTOR, InstanceIdentity};
use super::resolver::{ActorResolver, username_from_actor_uri};
use super::signature::{extract_signature_key_id, key_id_matches_actor, verify_signature};
use crate::data::{Database, FollowStatus, InteractionKind, Post, User};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_RECEIVED, INBOX_DUPLICATES_TOTAL};

/// How long a processed activity id suppresses redelivery
const DEDUP_TTL_DAYS: i64 = 7;

/// Response status for a redelivered activity
pub const ALREADY_PROCESSED: &str = "already processed";

/// The parts of an inbound HTTP request the inbox needs
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    /// Path and query as received
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

pub struct InboxDispatcher {
    db: Arc<Database>,
    identity: Arc<InstanceIdentity>,
    resolver: Arc<ActorResolver>,
    delivery: DeliveryEngine,
    guard: Arc<MessagingGuard>,
    require_signatures: bool,
}

impl InboxDispatcher {
    pub fn new(
        db: Arc<Database>,
        identity: Arc<InstanceIdentity>,
        resolver: Arc<ActorResolver>,
        delivery: DeliveryEngine,
        guard: Arc<MessagingGuard>,
        require_signatures: bool,
    ) -> Self {
        Self {
            db,
            identity,
            resolver,
            delivery,
            guard,
            require_signatures,
        }
    }

    /// Admit, persist and dispatch one inbound activity
    ///
    /// Returns the status string reported to the sender.
    ///
    /// # Errors
    /// * `Validation` - body is not an activity (400)
    /// * `Forbidden` - actor domain is blocked (403)
    /// * `RateLimited` - actor or domain throttled (429)
    /// * `InvalidSignature` - bad or missing signature (401)
    /// * `NotFound` - Follow of an unknown local user (404)
    pub async fn handle(&self, request: InboundRequest<'_>) -> Result<&'static str, AppError> {
        let envelope = ActivityEnvelope::parse(request.body)?;
        let actor = envelope.actor.as_str();
        let domain = self
            .resolver
            .directory()
            .domain_for_url(actor)
            .ok_or_else(|| AppError::Validation(format!("Invalid actor URI: {}", actor)))?;

        if self.db.is_domain_blocked(&domain).await? {
            self.guard.record_inbox_rejected(
                actor,
                "domain blocked",
                json!({"domain": domain, "activity": envelope.id}),
            );
            tracing::info!(%actor, %domain, "Rejected activity from blocked domain");
            return Err(AppError::Forbidden);
        }

        self.guard.allow_remote_inbound(actor, &domain)?;

        if request.headers.contains_key("signature") {
            if let Err(error) = self.verify(&request, actor, &domain).await {
                self.guard.record_inbox_rejected(
                    actor,
                    &error.to_string(),
                    json!({"domain": domain, "activity": envelope.id}),
                );
                tracing::warn!(%actor, %error, "Rejected activity with invalid signature");
                return Err(error);
            }
        } else if self.require_signatures {
            self.guard.record_inbox_rejected(
                actor,
                "missing signature",
                json!({"domain": domain, "activity": envelope.id}),
            );
            return Err(AppError::InvalidSignature(
                "Signature header required".to_string(),
            ));
        }

        let expires_at = Utc::now() + Duration::days(DEDUP_TTL_DAYS);
        if !self.db.claim_activity(&envelope.id, expires_at).await? {
            INBOX_DUPLICATES_TOTAL.inc();
            tracing::debug!(activity = %envelope.id, "Duplicate activity ignored");
            return Ok(ALREADY_PROCESSED);
        }

        match self.process_claimed(&envelope, request.body).await {
            Ok(status) => {
                tracing::info!(
                    activity = %envelope.id,
                    kind = envelope.kind.as_str(),
                    %actor,
                    status,
                    "Inbound activity processed"
                );
                Ok(status)
            }
            Err(AppError::Resolution(reason)) => {
                // Released so a redelivery can succeed once the actor resolves
                self.db.release_activity(&envelope.id).await?;
                tracing::warn!(activity = %envelope.id, %reason, "Activity ignored: actor unresolvable");
                Ok("ignored")
            }
            Err(error) => {
                if let Err(release_error) = self.db.release_activity(&envelope.id).await {
                    tracing::error!(activity = %envelope.id, error = %release_error, "Failed to release activity claim");
                }
                Err(error)
            }
        }
    }

    /// Persist and dispatch an activity this call holds the claim for
    async fn process_claimed(
        &self,
        envelope: &ActivityEnvelope,
        body: &[u8],
    ) -> Result<&'static str, AppError> {
        let payload = String::from_utf8_lossy(body);
        self.db
            .insert_inbox_activity(&envelope.id, &envelope.actor, envelope.kind.as_str(), &payload)
            .await?;
        ACTIVITIES_RECEIVED
            .with_label_values(&[envelope.kind.as_str()])
            .inc();

        match self.dispatch(envelope).await {
            Err(AppError::Validation(reason)) => {
                tracing::warn!(activity = %envelope.id, %reason, "Activity ignored: malformed object");
                Ok("ignored")
            }
            other => other,
        }
    }

    async fn verify(
        &self,
        request: &InboundRequest<'_>,
        actor: &str,
        actor_domain: &str,
    ) -> Result<(), AppError> {
        let key_id = extract_signature_key_id(request.headers)?;
        if !self.signer_may_act_for(&key_id, actor, actor_domain) {
            return Err(AppError::InvalidSignature(
                "Signature keyId does not belong to the activity actor".to_string(),
            ));
        }

        let body = (!request.body.is_empty()).then_some(request.body);
        let pem = self.signer_key(&key_id, false).await?;
        match verify_signature(request.method, request.path, request.headers, body, &pem) {
            Ok(()) => Ok(()),
            Err(first) => {
                // The signer may have rotated its key since we cached it
                let fresh = self.signer_key(&key_id, true).await?;
                if fresh == pem {
                    return Err(first);
                }
                verify_signature(request.method, request.path, request.headers, body, &fresh)
            }
        }
    }

    /// The actor itself, or its instance actor, may sign
    fn signer_may_act_for(&self, key_id: &str, actor: &str, actor_domain: &str) -> bool {
        if key_id_matches_actor(key_id, actor) {
            return true;
        }
        let key_actor = key_id.split('#').next().unwrap_or(key_id);
        username_from_actor_uri(key_actor).as_deref() == Some(INSTANCE_ACTOR)
            && self.resolver.directory().domain_for_url(key_actor).as_deref() == Some(actor_domain)
    }

    async fn signer_key(&self, key_id: &str, refresh: bool) -> Result<String, AppError> {
        self.resolver
            .public_key_for(key_id, refresh)
            .await
            .map_err(|error| match error {
                AppError::InvalidSignature(reason) => AppError::InvalidSignature(reason),
                other => AppError::InvalidSignature(format!("Signer key unavailable: {}", other)),
            })
    }

    async fn dispatch(&self, envelope: &ActivityEnvelope) -> Result<&'static str, AppError> {
        match &envelope.kind {
            ActivityType::Follow => self.handle_follow(envelope).await,
            ActivityType::Accept => self.handle_accept(envelope).await,
            ActivityType::Create => self.handle_create(envelope).await,
            ActivityType::Like => {
                self.handle_interaction(envelope, InteractionKind::Like, "liked")
                    .await
            }
            ActivityType::Announce => {
                self.handle_interaction(envelope, InteractionKind::Repost, "announced")
                    .await
            }
            ActivityType::Update => self.handle_update(envelope).await,
            ActivityType::Delete => self.handle_delete(envelope).await,
            ActivityType::Undo => self.handle_undo(envelope).await,
            ActivityType::Other(kind) => {
                tracing::debug!(%kind, "Unsupported activity type ignored");
                Ok("ignored")
            }
        }
    }

    /// Local user addressed by an actor URI on this instance
    async fn local_user_for(&self, actor_uri: &str) -> Result<Option<User>, AppError> {
        if !self.identity.is_local_actor(actor_uri) {
            return Ok(None);
        }
        match username_from_actor_uri(actor_uri) {
            Some(username) => self.db.get_local_user(&username).await,
            None => Ok(None),
        }
    }

    /// Live post referenced by a remote URI or a local note URI
    async fn find_post(&self, uri: &str) -> Result<Option<Post>, AppError> {
        let local_id = if uri.starts_with(&format!("{}/", self.identity.base_url())) {
            post_id_from_uri(uri)
        } else {
            None
        };
        self.db.find_post(uri, local_id.as_deref()).await
    }

    async fn handle_follow(&self, envelope: &ActivityEnvelope) -> Result<&'static str, AppError> {
        let target = envelope
            .object_id()
            .ok_or_else(|| AppError::Validation("Follow has no object".to_string()))?;
        let local_user = self
            .local_user_for(&target)
            .await?
            .ok_or(AppError::NotFound)?;

        let follower = self.resolver.resolve_actor_from_uri(&envelope.actor).await?;
        self.db
            .upsert_follow(
                &follower.actor_uri,
                &local_user.did,
                FollowStatus::Accepted,
                Some(&envelope.id),
            )
            .await?;
        tracing::info!(
            follower = %follower.actor_uri,
            following = %local_user.username,
            "Follow accepted"
        );

        let accept = builder::accept(
            self.identity.base_url(),
            &self.identity.actor_uri(&local_user.username),
            envelope.raw.clone(),
        );
        let delivery = self.delivery.clone();
        let inbox = follower.inbox_url;
        tokio::spawn(async move {
            if let Err(error) = delivery.deliver_activity(&accept, &inbox).await {
                tracing::warn!(%inbox, %error, "Failed to deliver Accept");
            }
        });

        Ok("accepted")
    }

    async fn handle_accept(&self, envelope: &ActivityEnvelope) -> Result<&'static str, AppError> {
        if let Some(follow_id) = envelope.object_id() {
            if self
                .db
                .accept_follow_by_activity(&follow_id, &envelope.actor)
                .await?
                > 0
            {
                tracing::info!(follow = %follow_id, "Follow confirmed");
                return Ok("accepted");
            }
        }

        // Fallback for peers that do not echo the original Follow id
        let follower = value_id(envelope.object.get("actor"))
            .filter(|uri| self.identity.is_local_actor(uri))
            .and_then(|uri| username_from_actor_uri(&uri));
        let Some(follower) = follower else {
            return Ok("ignored");
        };
        let updated = self
            .db
            .accept_follow_loosely(&follower, &envelope.actor)
            .await?;
        if updated == 0 {
            return Ok("ignored");
        }
        tracing::info!(%follower, following = %envelope.actor, updated, "Follow confirmed by username match");
        Ok("accepted")
    }

    async fn handle_create(&self, envelope: &ActivityEnvelope) -> Result<&'static str, AppError> {
        if envelope.object_type() != Some("Note") {
            return Ok("ignored");
        }
        let note = &envelope.object;
        let note_uri = envelope
            .object_id()
            .ok_or_else(|| AppError::Validation("Note has no id".to_string()))?;
        let content = sanitize_remote_html(note.get("content").and_then(Value::as_str).unwrap_or(""));

        if !envelope.is_public() {
            let mut recipients = audience(note);
            recipients.extend(audience(&envelope.raw));
            for recipient in recipients {
                let Some(local_user) = self.local_user_for(&recipient).await? else {
                    continue;
                };
                let sender = self.resolver.ensure_remote_user(&envelope.actor).await?;
                let thread = self
                    .db
                    .get_or_create_thread(&local_user.id, &sender.id)
                    .await?;
                self.db
                    .insert_message(&thread.id, &sender.id, &local_user.id, &content, Some(&envelope.id))
                    .await?;
                tracing::info!(
                    from = %envelope.actor,
                    to = %local_user.username,
                    "Direct message received"
                );
                return Ok("created");
            }
            return Ok("ignored");
        }

        let author = self.resolver.ensure_remote_user(&envelope.actor).await?;
        let inserted = self
            .db
            .insert_remote_post(&author.did, &content, "public", &note_uri)
            .await?;
        tracing::info!(note = %note_uri, inserted, "Remote post stored");
        Ok("created")
    }

    async fn handle_interaction(
        &self,
        envelope: &ActivityEnvelope,
        kind: InteractionKind,
        status: &'static str,
    ) -> Result<&'static str, AppError> {
        let Some(target) = envelope.object_id() else {
            return Ok("ignored");
        };
        let Some(post) = self.find_post(&target).await? else {
            tracing::debug!(%target, "Interaction with unknown post ignored");
            return Ok("ignored");
        };
        self.db
            .insert_interaction(&post.id, &envelope.actor, kind)
            .await?;
        Ok(status)
    }

    async fn handle_update(&self, envelope: &ActivityEnvelope) -> Result<&'static str, AppError> {
        if envelope.object_type() != Some("Person") {
            return Ok("ignored");
        }
        if envelope.object_id().as_deref() != Some(envelope.actor.as_str()) {
            self.guard.record_suspicious(
                &envelope.actor,
                "actor attempted to update another actor",
                json!({"object": envelope.object_id()}),
            );
            return Ok("ignored");
        }

        let person = &envelope.object;
        let field = |name: &str| person.get(name).and_then(Value::as_str).unwrap_or("").trim().to_string();
        let display_name = field("name");
        let bio = sanitize_remote_html(&field("summary"));
        let avatar_url = person
            .get("icon")
            .and_then(|icon| icon.get("url"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let public_key_pem = person
            .get("publicKey")
            .and_then(|key| key.get("publicKeyPem"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        self.db
            .patch_ghost_profile(&envelope.actor, &display_name, &bio, &avatar_url)
            .await?;
        self.db
            .patch_remote_actor(&envelope.actor, &display_name, &avatar_url, &public_key_pem)
            .await?;
        Ok("updated")
    }

    async fn handle_delete(&self, envelope: &ActivityEnvelope) -> Result<&'static str, AppError> {
        let Some(target) = envelope.object_id() else {
            return Ok("ignored");
        };

        if is_actor_uri(&target) {
            if target != envelope.actor {
                self.guard.record_suspicious(
                    &envelope.actor,
                    "actor attempted to delete another actor",
                    json!({"object": target}),
                );
                return Ok("ignored");
            }
            self.db.purge_remote_actor(&target).await?;
            tracing::info!(actor = %target, "Remote actor deleted");
            return Ok("deleted");
        }

        let Some(post) = self.find_post(&target).await? else {
            return Ok("ignored");
        };
        if post.author_did != envelope.actor {
            self.guard.record_suspicious(
                &envelope.actor,
                "actor attempted to delete a post it does not own",
                json!({"object": target}),
            );
            return Ok("ignored");
        }
        self.db.soft_delete_post(&target, Some(&post.id)).await?;
        Ok("deleted")
    }

    async fn handle_undo(&self, envelope: &ActivityEnvelope) -> Result<&'static str, AppError> {
        let inner = &envelope.object;
        if let Some(inner_actor) = value_id(inner.get("actor")) {
            if inner_actor != envelope.actor {
                return Ok("ignored");
            }
        }
        let Some(target) = value_id(inner.get("object")) else {
            return Ok("ignored");
        };

        match envelope.object_type() {
            Some("Follow") => {
                let Some(local_user) = self.local_user_for(&target).await? else {
                    return Ok("ignored");
                };
                self.db.delete_follow(&envelope.actor, &local_user.did).await?;
                tracing::info!(follower = %envelope.actor, following = %local_user.username, "Follow undone");
                Ok("undone")
            }
            Some("Like") => {
                if let Some(post) = self.find_post(&target).await? {
                    self.db
                        .delete_interaction(&post.id, &envelope.actor, InteractionKind::Like)
                        .await?;
                }
                Ok("undone")
            }
            _ => Ok("ignored"),
        }
    }
}
