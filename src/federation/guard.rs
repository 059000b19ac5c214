//! Messaging abuse guard
//!
//! In-memory sliding-window limits for local message sends and remote inbox
//! traffic, plus a bounded log of security events for the admin API.
//! One mutex covers all state; check-and-record is atomic per call.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::AppError;
use crate::metrics::MESSAGING_THROTTLED_TOTAL;

pub const LOCAL_PER_MINUTE: usize = 20;
pub const LOCAL_PER_HOUR: usize = 120;
pub const REMOTE_ACTOR_PER_MINUTE: usize = 40;
pub const REMOTE_DOMAIN_PER_MINUTE: usize = 200;
/// Retained security events
pub const MAX_RECENT_EVENTS: usize = 200;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub action: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GuardMetrics {
    pub local_send_allowed: u64,
    pub local_send_throttled: u64,
    pub offline_sync_allowed: u64,
    pub offline_sync_throttled: u64,
    pub inbox_allowed: u64,
    pub inbox_throttled: u64,
    pub inbox_rejected: u64,
    pub suspicious_events_logged: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GuardLimits {
    pub local_per_minute: usize,
    pub local_per_hour: usize,
    pub remote_actor_per_minute: usize,
    pub remote_domain_per_minute: usize,
}

/// Point-in-time view for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct GuardSnapshot {
    pub limits: GuardLimits,
    pub metrics: GuardMetrics,
    pub recent_events: Vec<SecurityEvent>,
}

#[derive(Debug, Default)]
struct GuardState {
    local_sender_hits: HashMap<String, VecDeque<Instant>>,
    remote_actor_hits: HashMap<String, VecDeque<Instant>>,
    remote_domain_hits: HashMap<String, VecDeque<Instant>>,
    metrics: GuardMetrics,
    events: VecDeque<SecurityEvent>,
}

impl GuardState {
    fn push_event(&mut self, event: SecurityEvent) {
        self.events.push_back(event);
        while self.events.len() > MAX_RECENT_EVENTS {
            self.events.pop_front();
        }
    }
}

/// Drop hits at or before `now - window`
fn trim_window(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = hits.front() {
        if now.saturating_duration_since(*front) >= window {
            hits.pop_front();
        } else {
            break;
        }
    }
}

fn count_within(hits: &VecDeque<Instant>, now: Instant, window: Duration) -> usize {
    hits.iter()
        .filter(|hit| now.saturating_duration_since(**hit) < window)
        .count()
}

/// Keep a hit map bounded; expired keys go first, then the stalest key
fn bound_keys(map: &mut HashMap<String, VecDeque<Instant>>, key: &str, now: Instant, window: Duration) {
    if map.contains_key(key) || map.len() < DEFAULT_MAX_TRACKED_KEYS {
        return;
    }
    map.retain(|_, hits| {
        trim_window(hits, now, window);
        !hits.is_empty()
    });
    if map.len() >= DEFAULT_MAX_TRACKED_KEYS {
        let stalest = map
            .iter()
            .min_by_key(|(_, hits)| hits.back().copied())
            .map(|(key, _)| key.clone());
        if let Some(stalest) = stalest {
            map.remove(&stalest);
        }
    }
}

fn metadata(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[derive(Debug, Default)]
pub struct MessagingGuard {
    state: Mutex<GuardState>,
}

impl MessagingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admit `units` messages from a local sender
    ///
    /// A single unit is an interactive send; more than one is an offline
    /// sync batch and is counted separately.
    pub fn allow_local_send(&self, sender_id: &str, units: usize) -> Result<(), AppError> {
        self.allow_local_send_at(sender_id, units, Instant::now())
    }

    fn allow_local_send_at(&self, sender_id: &str, units: usize, now: Instant) -> Result<(), AppError> {
        let units = units.max(1);
        let mut state = self.lock();
        let state = &mut *state;

        bound_keys(&mut state.local_sender_hits, sender_id, now, HOUR);
        let hits = state
            .local_sender_hits
            .entry(sender_id.to_string())
            .or_default();
        trim_window(hits, now, HOUR);
        let last_hour = hits.len();
        let last_minute = count_within(hits, now, MINUTE);

        let breach = if last_minute + units > LOCAL_PER_MINUTE {
            Some(("1m", LOCAL_PER_MINUTE, "per-minute messaging rate limit exceeded"))
        } else if last_hour + units > LOCAL_PER_HOUR {
            Some(("1h", LOCAL_PER_HOUR, "per-hour messaging rate limit exceeded"))
        } else {
            None
        };

        if let Some((window, limit, reason)) = breach {
            if units == 1 {
                state.metrics.local_send_throttled += 1;
            } else {
                state.metrics.offline_sync_throttled += 1;
            }
            state.push_event(SecurityEvent {
                kind: "rate_limit".to_string(),
                source: sender_id.to_string(),
                action: "throttled".to_string(),
                reason: format!("local sender {} limit exceeded", window),
                timestamp: Utc::now(),
                metadata: metadata(json!({
                    "window": window,
                    "limit": limit,
                    "attempted_units": units,
                })),
            });
            MESSAGING_THROTTLED_TOTAL.with_label_values(&["local"]).inc();
            tracing::warn!(sender = %sender_id, units, window, "Local messaging throttled");
            return Err(AppError::RateLimited(reason.to_string()));
        }

        hits.extend(std::iter::repeat(now).take(units));
        if units == 1 {
            state.metrics.local_send_allowed += 1;
        } else {
            state.metrics.offline_sync_allowed += 1;
        }
        Ok(())
    }

    /// Admit one inbound activity from a remote actor
    pub fn allow_remote_inbound(&self, actor_uri: &str, domain: &str) -> Result<(), AppError> {
        self.allow_remote_inbound_at(actor_uri, domain, Instant::now())
    }

    fn allow_remote_inbound_at(
        &self,
        actor_uri: &str,
        domain: &str,
        now: Instant,
    ) -> Result<(), AppError> {
        let mut state = self.lock();
        let state = &mut *state;

        bound_keys(&mut state.remote_actor_hits, actor_uri, now, MINUTE);
        bound_keys(&mut state.remote_domain_hits, domain, now, MINUTE);
        let actor_hits = state
            .remote_actor_hits
            .entry(actor_uri.to_string())
            .or_default();
        trim_window(actor_hits, now, MINUTE);
        let domain_hits = state
            .remote_domain_hits
            .entry(domain.to_string())
            .or_default();
        trim_window(domain_hits, now, MINUTE);

        let breach = if actor_hits.len() + 1 > REMOTE_ACTOR_PER_MINUTE {
            Some((
                actor_uri,
                REMOTE_ACTOR_PER_MINUTE,
                "remote actor per-minute inbox limit exceeded",
                json!({"window": "1m", "limit": REMOTE_ACTOR_PER_MINUTE, "domain": domain}),
                "remote actor inbox rate limit exceeded",
                "remote_actor",
            ))
        } else if domain_hits.len() + 1 > REMOTE_DOMAIN_PER_MINUTE {
            Some((
                domain,
                REMOTE_DOMAIN_PER_MINUTE,
                "remote domain per-minute inbox limit exceeded",
                json!({"window": "1m", "limit": REMOTE_DOMAIN_PER_MINUTE, "actor": actor_uri}),
                "remote domain inbox rate limit exceeded",
                "remote_domain",
            ))
        } else {
            None
        };

        if let Some((source, limit, event_reason, meta, reason, scope)) = breach {
            state.metrics.inbox_throttled += 1;
            state.push_event(SecurityEvent {
                kind: "rate_limit".to_string(),
                source: source.to_string(),
                action: "throttled".to_string(),
                reason: event_reason.to_string(),
                timestamp: Utc::now(),
                metadata: metadata(meta),
            });
            MESSAGING_THROTTLED_TOTAL.with_label_values(&[scope]).inc();
            tracing::warn!(actor = %actor_uri, %domain, limit, "Remote inbox throttled");
            return Err(AppError::RateLimited(reason.to_string()));
        }

        actor_hits.push_back(now);
        domain_hits.push_back(now);
        state.metrics.inbox_allowed += 1;
        Ok(())
    }

    /// Log a suspicious but admitted event
    pub fn record_suspicious(&self, source: &str, reason: &str, meta: Value) {
        let mut state = self.lock();
        state.metrics.suspicious_events_logged += 1;
        state.push_event(SecurityEvent {
            kind: "suspicious".to_string(),
            source: source.to_string(),
            action: "flagged".to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
            metadata: metadata(meta),
        });
    }

    /// Log an inbound activity refused by the inbox
    pub fn record_inbox_rejected(&self, source: &str, reason: &str, meta: Value) {
        let mut state = self.lock();
        state.metrics.inbox_rejected += 1;
        state.metrics.suspicious_events_logged += 1;
        state.push_event(SecurityEvent {
            kind: "inbox_rejected".to_string(),
            source: source.to_string(),
            action: "rejected".to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
            metadata: metadata(meta),
        });
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        let state = self.lock();
        GuardSnapshot {
            limits: GuardLimits {
                local_per_minute: LOCAL_PER_MINUTE,
                local_per_hour: LOCAL_PER_HOUR,
                remote_actor_per_minute: REMOTE_ACTOR_PER_MINUTE,
                remote_domain_per_minute: REMOTE_DOMAIN_PER_MINUTE,
            },
            metrics: state.metrics,
            recent_events: state.events.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_first_local_send_in_a_minute_is_rejected() {
        let guard = MessagingGuard::new();
        let start = Instant::now();

        for i in 0..LOCAL_PER_MINUTE {
            guard
                .allow_local_send_at("alice", 1, start + Duration::from_millis(i as u64))
                .unwrap();
        }
        let result = guard.allow_local_send_at("alice", 1, start + Duration::from_secs(1));
        assert!(matches!(
            result,
            Err(AppError::RateLimited(reason)) if reason == "per-minute messaging rate limit exceeded"
        ));

        let snapshot = guard.snapshot();
        assert_eq!(snapshot.metrics.local_send_allowed, 20);
        assert_eq!(snapshot.metrics.local_send_throttled, 1);
        assert_eq!(snapshot.recent_events.len(), 1);
        assert_eq!(snapshot.recent_events[0].source, "alice");
    }

    #[test]
    fn local_window_slides() {
        let guard = MessagingGuard::new();
        let start = Instant::now();

        for _ in 0..LOCAL_PER_MINUTE {
            guard.allow_local_send_at("alice", 1, start).unwrap();
        }
        assert!(guard.allow_local_send_at("alice", 1, start + Duration::from_secs(30)).is_err());
        assert!(guard.allow_local_send_at("alice", 1, start + Duration::from_secs(61)).is_ok());
        // Other senders are independent
        assert!(guard.allow_local_send_at("bob", 1, start).is_ok());
    }

    #[test]
    fn hourly_limit_applies_across_minutes() {
        let guard = MessagingGuard::new();
        let start = Instant::now();

        for minute in 0..6u64 {
            let at = start + Duration::from_secs(minute * 61);
            guard.allow_local_send_at("alice", LOCAL_PER_MINUTE, at).unwrap();
        }
        let result = guard.allow_local_send_at("alice", 1, start + Duration::from_secs(7 * 61));
        assert!(matches!(
            result,
            Err(AppError::RateLimited(reason)) if reason == "per-hour messaging rate limit exceeded"
        ));
        assert_eq!(guard.snapshot().metrics.offline_sync_allowed, 6);
    }

    #[test]
    fn oversized_batch_counts_as_offline_sync_throttle() {
        let guard = MessagingGuard::new();
        assert!(guard.allow_local_send("alice", LOCAL_PER_MINUTE + 1).is_err());
        let metrics = guard.snapshot().metrics;
        assert_eq!(metrics.offline_sync_throttled, 1);
        assert_eq!(metrics.local_send_throttled, 0);
    }

    #[test]
    fn forty_first_remote_actor_request_is_rejected() {
        let guard = MessagingGuard::new();
        let now = Instant::now();
        let actor = "http://localhost:8001/ap/users/bob";

        for _ in 0..REMOTE_ACTOR_PER_MINUTE {
            guard.allow_remote_inbound_at(actor, "splitter-2", now).unwrap();
        }
        let result = guard.allow_remote_inbound_at(actor, "splitter-2", now);
        assert!(matches!(
            result,
            Err(AppError::RateLimited(reason)) if reason == "remote actor inbox rate limit exceeded"
        ));

        let metrics = guard.snapshot().metrics;
        assert_eq!(metrics.inbox_allowed, 40);
        assert_eq!(metrics.inbox_throttled, 1);
    }

    #[test]
    fn remote_domain_limit_spans_actors() {
        let guard = MessagingGuard::new();
        let now = Instant::now();

        for i in 0..REMOTE_DOMAIN_PER_MINUTE {
            let actor = format!("http://localhost:8001/ap/users/u{}", i);
            guard.allow_remote_inbound_at(&actor, "splitter-2", now).unwrap();
        }
        let result =
            guard.allow_remote_inbound_at("http://localhost:8001/ap/users/new", "splitter-2", now);
        assert!(matches!(
            result,
            Err(AppError::RateLimited(reason)) if reason == "remote domain inbox rate limit exceeded"
        ));
    }

    #[test]
    fn event_log_is_bounded() {
        let guard = MessagingGuard::new();
        for i in 0..(MAX_RECENT_EVENTS + 25) {
            guard.record_suspicious(&format!("source-{}", i), "odd payload", json!({"n": i}));
        }
        guard.record_inbox_rejected("mallory", "invalid signature", Value::Null);

        let snapshot = guard.snapshot();
        assert_eq!(snapshot.recent_events.len(), MAX_RECENT_EVENTS);
        assert_eq!(snapshot.recent_events.last().unwrap().kind, "inbox_rejected");
        assert_eq!(snapshot.metrics.inbox_rejected, 1);
        assert_eq!(
            snapshot.metrics.suspicious_events_logged,
            (MAX_RECENT_EVENTS + 26) as u64
        );
    }
}
