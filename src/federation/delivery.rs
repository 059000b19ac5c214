//! Activity delivery
//!
//! Every outbound attempt is backed by an `outbox_activities` row so a
//! failed delivery can be retried by the background worker. Failures are
//! counted per target domain; enough consecutive failures open a circuit
//! that pauses delivery to that domain until the cooldown elapses.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::activity::{is_public, value_id};
use super::identity::InstanceIdentity;
use super::policy::{DeliveryPolicy, PolicyStore, PolicyUpdate, backoff_delay};
use super::resolver::ActorResolver;
use super::signature::sign_request;
use super::webfinger::ACTIVITY_JSON;
use crate::data::{Database, OutboxEntry, OutboxStatus, format_timestamp};
use crate::error::AppError;
use crate::metrics::{
    ACTIVITIES_SENT, CIRCUIT_OPENED_TOTAL, DELIVERIES_TOTAL, FEDERATION_REQUEST_DURATION_SECONDS,
    FEDERATION_REQUESTS_TOTAL,
};

/// Slack on top of the request timeout before an unfinished attempt's
/// entry becomes retryable again
const LEASE_MARGIN: Duration = Duration::from_secs(30);

/// Outcome counts of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub targets: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Outcome counts of one retry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub processed: usize,
    pub failed: usize,
}

/// Activity delivery service
///
/// Cheap to clone; fan-out hands a clone to each delivery task.
#[derive(Clone)]
pub struct DeliveryEngine {
    db: Arc<Database>,
    identity: Arc<InstanceIdentity>,
    resolver: Arc<ActorResolver>,
    http_client: reqwest::Client,
    policy: Arc<PolicyStore>,
    delivery_timeout: Duration,
    concurrency: usize,
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
///
/// First-seen order is preserved.
fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for inbox_uri in inbox_uris {
        if seen.contains(&inbox_uri) {
            continue;
        }
        seen.insert(inbox_uri.clone());
        targets.push(inbox_uri);
    }

    targets
}

/// Closed (never opened, or cooled down) before, open now
fn circuit_opened(
    before: Option<chrono::DateTime<Utc>>,
    after: Option<chrono::DateTime<Utc>>,
    now: chrono::DateTime<Utc>,
) -> bool {
    let open = |until: Option<chrono::DateTime<Utc>>| until.is_some_and(|until| until > now);
    !open(before) && open(after)
}

impl DeliveryEngine {
    pub fn new(
        db: Arc<Database>,
        identity: Arc<InstanceIdentity>,
        resolver: Arc<ActorResolver>,
        http_client: reqwest::Client,
        policy: DeliveryPolicy,
        delivery_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            identity,
            resolver,
            http_client,
            policy: Arc::new(PolicyStore::new(policy)),
            delivery_timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy.get()
    }

    /// Apply a runtime policy change
    pub fn configure(&self, update: &PolicyUpdate) -> DeliveryPolicy {
        let policy = self.policy.configure(update);
        tracing::info!(
            max_retries = policy.max_retries,
            circuit_failure_threshold = policy.circuit_failure_threshold,
            circuit_cooldown_seconds = policy.circuit_cooldown_seconds,
            "Delivery policy updated"
        );
        policy
    }

    /// Deliver activity to a single inbox
    ///
    /// # Arguments
    /// * `activity` - Activity JSON; must carry `id` and `type`
    /// * `target_inbox` - Target inbox URL
    ///
    /// # Errors
    /// `PolicyRejected` for a blocked domain or an open circuit; any
    /// network or remote failure is returned after it has been recorded
    /// for retry.
    pub async fn deliver_activity(&self, activity: &Value, target_inbox: &str) -> Result<(), AppError> {
        let activity_id = activity
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Activity has no id".to_string()))?;
        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Activity has no type".to_string()))?;
        let payload = serde_json::to_string(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;
        let target_domain = self
            .resolver
            .directory()
            .domain_for_url(target_inbox)
            .ok_or_else(|| AppError::Validation(format!("Invalid inbox URL: {}", target_inbox)))?;

        let entry = self
            .db
            .insert_outbox_entry(
                activity_id,
                activity_type,
                &payload,
                target_inbox,
                &target_domain,
                self.lease_until(),
            )
            .await?;

        self.attempt(&entry).await
    }

    /// Resolve an actor's inbox, then deliver
    pub async fn deliver_to_actor(&self, activity: &Value, actor_uri: &str) -> Result<(), AppError> {
        let actor = self.resolver.resolve_actor_from_uri(actor_uri).await?;
        self.deliver_activity(activity, &actor.inbox_url).await
    }

    /// Fan an activity out to the author's followers
    ///
    /// Public activities also go to every other known instance's shared
    /// inbox. Each target is delivered by its own task, bounded by the
    /// configured concurrency; individual failures are counted, not returned.
    pub async fn deliver_to_followers(
        &self,
        activity: &Value,
        author_did: &str,
    ) -> Result<FanOutReport, AppError> {
        let directory = self.resolver.directory();
        let own_domain = self.identity.domain();

        let mut inboxes = self.db.get_follower_inboxes(author_did).await?;
        if is_public(activity) {
            inboxes.extend(directory.shared_inboxes_except(own_domain));
        }

        let targets: Vec<String> = unique_inbox_targets(inboxes)
            .into_iter()
            .filter(|inbox| directory.domain_for_url(inbox).as_deref() != Some(own_domain))
            .collect();

        let mut report = FanOutReport {
            targets: targets.len(),
            ..FanOutReport::default()
        };
        if targets.is_empty() {
            return Ok(report);
        }

        let activity = Arc::new(activity.clone());
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for inbox in targets {
            let engine = self.clone();
            let activity = activity.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = engine.deliver_activity(&activity, &inbox).await;
                (inbox, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((inbox, Err(error))) => {
                    report.failed += 1;
                    tracing::warn!(%inbox, %error, "Fan-out delivery failed");
                }
                Err(error) => {
                    report.failed += 1;
                    tracing::error!(%error, "Fan-out delivery task panicked");
                }
            }
        }

        tracing::info!(
            author = %author_did,
            targets = report.targets,
            delivered = report.delivered,
            failed = report.failed,
            "Fan-out complete"
        );
        Ok(report)
    }

    /// Re-attempt one stored outbox entry, due or not
    ///
    /// # Errors
    /// `PolicyRejected` while another attempt holds the entry.
    pub async fn retry_outbox_activity(&self, id: &str) -> Result<(), AppError> {
        let entry = self.db.get_outbox_entry(id).await?.ok_or(AppError::NotFound)?;
        if entry.status == OutboxStatus::Sent.as_str() {
            tracing::debug!(entry = %id, "Outbox entry already sent");
            return Ok(());
        }
        if !self
            .db
            .claim_outbox_entry(id, Utc::now(), self.lease_until(), true)
            .await?
        {
            return Err(AppError::PolicyRejected(format!(
                "Outbox entry {} is already being delivered",
                id
            )));
        }
        self.attempt(&entry).await
    }

    /// Re-attempt up to `limit` due entries, oldest first
    pub async fn retry_outbox_batch(&self, limit: u32) -> Result<RetrySummary, AppError> {
        let policy = self.policy.get();
        let entries = self
            .db
            .list_retryable_outbox(policy.max_retries, Utc::now(), limit)
            .await?;

        let mut summary = RetrySummary::default();
        for entry in entries {
            if !self
                .db
                .claim_outbox_entry(&entry.id, Utc::now(), self.lease_until(), false)
                .await?
            {
                tracing::debug!(entry = %entry.id, "Outbox entry taken by another attempt");
                continue;
            }
            summary.processed += 1;
            if let Err(error) = self.attempt(&entry).await {
                summary.failed += 1;
                tracing::debug!(entry = %entry.id, %error, "Retry attempt failed");
            }
        }
        Ok(summary)
    }

    fn lease_until(&self) -> chrono::DateTime<Utc> {
        let lease = self.delivery_timeout + LEASE_MARGIN;
        Utc::now() + chrono::Duration::milliseconds(lease.as_millis() as i64)
    }

    /// Whether delivery to `domain` is currently paused
    pub async fn is_circuit_open(&self, domain: &str) -> Result<bool, AppError> {
        Ok(self.circuit_open_until(domain).await?.is_some())
    }

    async fn circuit_open_until(
        &self,
        domain: &str,
    ) -> Result<Option<chrono::DateTime<Utc>>, AppError> {
        if domain.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();
        Ok(self
            .db
            .get_domain_failure_state(domain)
            .await?
            .and_then(|state| state.circuit_open_until)
            .filter(|until| *until > now))
    }

    async fn attempt(&self, entry: &OutboxEntry) -> Result<(), AppError> {
        let domain = entry.target_domain.as_str();
        let policy = self.policy.get();

        if !domain.is_empty() && self.db.is_domain_blocked(domain).await? {
            let reason = format!("Domain {} is blocked", domain);
            self.db.mark_outbox_failed(&entry.id, &reason, None).await?;
            self.record_failure(domain, &reason, &policy).await?;
            DELIVERIES_TOTAL.with_label_values(&["blocked"]).inc();
            tracing::warn!(%domain, inbox = %entry.target_inbox, "Delivery refused: domain blocked");
            return Err(AppError::PolicyRejected(reason));
        }

        if let Some(until) = self.circuit_open_until(domain).await? {
            let reason = format!(
                "Circuit open for {} until {}",
                domain,
                format_timestamp(until)
            );
            self.db.defer_outbox_entry(&entry.id, &reason, until).await?;
            self.record_connection(domain, OutboxStatus::Failed).await;
            DELIVERIES_TOTAL.with_label_values(&["circuit_open"]).inc();
            tracing::debug!(%domain, inbox = %entry.target_inbox, "Delivery skipped: circuit open");
            return Err(AppError::PolicyRejected(reason));
        }

        match self.post_signed(entry).await {
            Ok(()) => {
                self.db.mark_outbox_sent(&entry.id).await?;
                if !domain.is_empty() {
                    self.db.record_domain_success(domain).await?;
                }
                self.record_connection(domain, OutboxStatus::Sent).await;
                ACTIVITIES_SENT
                    .with_label_values(&[entry.activity_type.as_str()])
                    .inc();
                DELIVERIES_TOTAL.with_label_values(&["sent"]).inc();
                tracing::debug!(
                    activity = %entry.activity_id,
                    inbox = %entry.target_inbox,
                    "Activity delivered"
                );
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                let attempts = u32::try_from(entry.retry_count + 1).unwrap_or(u32::MAX);
                let next_retry_at = (attempts < policy.max_retries).then(|| {
                    Utc::now() + chrono::Duration::seconds(backoff_delay(attempts).as_secs() as i64)
                });

                self.db
                    .mark_outbox_failed(&entry.id, &message, next_retry_at)
                    .await?;
                self.record_failure(domain, &message, &policy).await?;
                DELIVERIES_TOTAL.with_label_values(&["failed"]).inc();

                match next_retry_at {
                    Some(at) => tracing::warn!(
                        activity = %entry.activity_id,
                        inbox = %entry.target_inbox,
                        attempts,
                        next_retry_at = %format_timestamp(at),
                        %error,
                        "Delivery failed; retry scheduled"
                    ),
                    None => tracing::warn!(
                        activity = %entry.activity_id,
                        inbox = %entry.target_inbox,
                        attempts,
                        %error,
                        "Delivery failed; giving up"
                    ),
                }
                Err(error)
            }
        }
    }

    /// Count a failure against `domain`; returns whether it opened the circuit
    async fn record_failure(
        &self,
        domain: &str,
        reason: &str,
        policy: &DeliveryPolicy,
    ) -> Result<bool, AppError> {
        self.record_connection(domain, OutboxStatus::Failed).await;
        if domain.is_empty() {
            return Ok(false);
        }

        let now = Utc::now();
        let previously_open_until = self
            .db
            .get_domain_failure_state(domain)
            .await?
            .and_then(|state| state.circuit_open_until);
        let open_until = now + chrono::Duration::seconds(policy.circuit_cooldown_seconds as i64);
        let state = self
            .db
            .record_domain_failure(domain, reason, policy.circuit_failure_threshold, open_until)
            .await?;

        let opened = circuit_opened(previously_open_until, state.circuit_open_until, now);
        if opened {
            CIRCUIT_OPENED_TOTAL.inc();
            tracing::warn!(
                %domain,
                failures = state.failure_count,
                cooldown_seconds = policy.circuit_cooldown_seconds,
                "Circuit opened"
            );
        }
        Ok(opened)
    }

    async fn record_connection(&self, target_domain: &str, status: OutboxStatus) {
        let source_domain = self.identity.domain();
        if source_domain.is_empty() || target_domain.is_empty() || source_domain == target_domain {
            return;
        }
        if let Err(error) = self
            .db
            .record_connection(source_domain, target_domain, status)
            .await
        {
            tracing::warn!(%error, target = %target_domain, "Failed to update connection ledger");
        }
    }

    async fn post_signed(&self, entry: &OutboxEntry) -> Result<(), AppError> {
        let keys = self.identity.ensure_keys().await?;
        let actor = serde_json::from_str::<Value>(&entry.payload)
            .ok()
            .and_then(|payload| value_id(payload.get("actor")))
            .unwrap_or_default();
        let key_id = self.identity.key_id_for(&actor);

        let body = entry.payload.as_bytes();
        let sig_headers = sign_request(
            "POST",
            &entry.target_inbox,
            Some(body),
            &keys.private_key,
            &key_id,
        )?;

        let mut request = self
            .http_client
            .post(&entry.target_inbox)
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .header(reqwest::header::DATE, sig_headers.date)
            .header("Signature", sig_headers.signature)
            .timeout(self.delivery_timeout);
        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let started = Instant::now();
        let result = async {
            let response = request.body(entry.payload.clone()).send().await.map_err(|e| {
                AppError::Federation(format!("Failed to deliver to {}: {}", entry.target_inbox, e))
            })?;

            if !response.status().is_success() {
                return Err(AppError::Federation(format!(
                    "Inbox {} rejected activity: HTTP {}",
                    entry.target_inbox,
                    response.status()
                )));
            }
            Ok(())
        }
        .await;

        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", if result.is_ok() { "success" } else { "error" }])
            .inc();

        result
    }
}
