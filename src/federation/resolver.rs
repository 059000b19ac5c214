//! Remote actor discovery and caching
//!
//! `handle -> WebFinger -> actor document -> remote_actors` with a TTL cache,
//! plus the inverse path from an actor URI seen on an inbound activity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;

use super::webfinger::{ACTIVITY_JSON, Handle, WebFingerResponse};
use crate::data::{Database, RemoteActor, User};
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// Built-in domain -> base URL table for the local two-instance setup
const BUILTIN_INSTANCES: &[(&str, &str)] = &[
    ("splitter-1", "http://localhost:8000"),
    ("splitter-2", "http://localhost:8001"),
];

// =============================================================================
// Instance directory
// =============================================================================

#[derive(Debug, Clone)]
struct DirectoryEntry {
    domain: String,
    base_url: String,
    origin: Option<url::Url>,
}

/// Explicit domain <-> base URL lookup table
///
/// Domains not listed are assumed to be served over HTTPS at their own name.
#[derive(Debug, Clone)]
pub struct InstanceDirectory {
    entries: Vec<DirectoryEntry>,
}

impl InstanceDirectory {
    /// Built-in entries, overridden by `extra`, overridden by this instance
    pub fn new(extra: &HashMap<String, String>, own_domain: &str, own_base_url: &str) -> Self {
        let mut directory = Self {
            entries: Vec::new(),
        };
        for (domain, base_url) in BUILTIN_INSTANCES {
            directory.insert(domain, base_url);
        }
        let mut extra: Vec<_> = extra.iter().collect();
        extra.sort();
        for (domain, base_url) in extra {
            directory.insert(domain, base_url);
        }
        directory.insert(own_domain, own_base_url);
        directory
    }

    fn insert(&mut self, domain: &str, base_url: &str) {
        let domain = domain.to_ascii_lowercase();
        let base_url = base_url.trim_end_matches('/').to_string();
        let entry = DirectoryEntry {
            origin: url::Url::parse(&base_url).ok(),
            domain: domain.clone(),
            base_url,
        };
        match self.entries.iter_mut().find(|e| e.domain == domain) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn base_url(&self, domain: &str) -> String {
        let domain = domain.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|e| e.domain == domain)
            .map(|e| e.base_url.clone())
            .unwrap_or_else(|| format!("https://{}", domain))
    }

    /// Federation domain owning `uri`: a listed instance when the origin
    /// matches, else the URI host
    pub fn domain_for_url(&self, uri: &str) -> Option<String> {
        let parsed = url::Url::parse(uri).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();

        let listed = self.entries.iter().find(|entry| {
            entry.origin.as_ref().is_some_and(|origin| {
                origin.scheme() == parsed.scheme()
                    && origin.host_str().map(str::to_ascii_lowercase).as_deref() == Some(host.as_str())
                    && origin.port_or_known_default() == parsed.port_or_known_default()
            })
        });

        Some(listed.map(|e| e.domain.clone()).unwrap_or(host))
    }

    /// Shared inbox URLs of every listed instance except `own_domain`
    pub fn shared_inboxes_except(&self, own_domain: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.domain.eq_ignore_ascii_case(own_domain))
            .map(|e| format!("{}/ap/shared-inbox", e.base_url))
            .collect()
    }

    pub fn domains(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.domain.clone()).collect()
    }
}

/// Username from an actor URI shaped `/ap/users/{u}`, `/users/{u}` or `/@{u}`
pub fn username_from_actor_uri(uri: &str) -> Option<String> {
    let parsed = url::Url::parse(uri).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();

    let username = match segments.as_slice() {
        ["ap", "users", username, ..] | ["users", username, ..] => *username,
        [first, ..] if first.starts_with('@') && first.len() > 1 => &first[1..],
        _ => return None,
    };
    Some(
        urlencoding::decode(username)
            .map(|u| u.into_owned())
            .unwrap_or_else(|_| username.to_string()),
    )
}

// =============================================================================
// Actor documents
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorDocument {
    id: String,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
    inbox: String,
    #[serde(default)]
    outbox: Option<String>,
    #[serde(default)]
    icon: Option<ActorIcon>,
    #[serde(default)]
    public_key: Option<ActorPublicKey>,
    #[serde(default)]
    endpoints: Option<ActorEndpoints>,
}

#[derive(Debug, Deserialize)]
struct ActorIcon {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorPublicKey {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    public_key_pem: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorEndpoints {
    #[serde(default)]
    shared_inbox: Option<String>,
}

/// Parsed actor data
#[derive(Debug, Clone)]
pub struct ParsedActor {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: String,
    pub inbox: String,
    pub outbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
}

impl ParsedActor {
    fn into_remote_actor(self, domain: String) -> RemoteActor {
        let now = Utc::now();
        RemoteActor {
            actor_uri: self.id,
            username: self.username,
            domain,
            inbox_url: self.inbox,
            outbox_url: self.outbox,
            shared_inbox_url: self.shared_inbox,
            public_key_pem: self.public_key_pem,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
            last_fetched_at: now,
            created_at: now,
        }
    }
}

/// Extract relevant data from an actor document
pub fn parse_actor(value: serde_json::Value) -> Result<ParsedActor, AppError> {
    let document: ActorDocument = serde_json::from_value(value)
        .map_err(|e| AppError::Resolution(format!("Malformed actor document: {}", e)))?;

    if document.id.is_empty() || document.inbox.is_empty() {
        return Err(AppError::Resolution(
            "Actor document is missing id or inbox".to_string(),
        ));
    }

    if let Some(key) = &document.public_key {
        if key.owner.as_deref().is_some_and(|owner| owner != document.id) {
            return Err(AppError::Resolution(format!(
                "Public key of {} is owned by another actor",
                document.id
            )));
        }
        if key
            .id
            .as_deref()
            .is_some_and(|key_id| !key_belongs_to(key_id, &document.id))
        {
            return Err(AppError::Resolution(format!(
                "Public key id of {} points outside the actor",
                document.id
            )));
        }
    }

    let username = document
        .preferred_username
        .filter(|u| !u.is_empty())
        .or_else(|| username_from_actor_uri(&document.id))
        .unwrap_or_default();

    Ok(ParsedActor {
        display_name: document.name.unwrap_or_default(),
        avatar_url: document.icon.and_then(|i| i.url).unwrap_or_default(),
        shared_inbox: document.endpoints.and_then(|e| e.shared_inbox),
        public_key_id: document.public_key.as_ref().and_then(|k| k.id.clone()),
        public_key_pem: document
            .public_key
            .and_then(|k| k.public_key_pem)
            .filter(|pem| !pem.trim().is_empty()),
        id: document.id,
        username,
        inbox: document.inbox,
        outbox: document.outbox,
    })
}

/// `{actor}`, `{actor}#...` or `{actor}/...`
fn key_belongs_to(key_id: &str, actor_id: &str) -> bool {
    match key_id.strip_prefix(actor_id) {
        Some(rest) => rest.is_empty() || rest.starts_with('#') || rest.starts_with('/'),
        None => false,
    }
}

// =============================================================================
// Resolver
// =============================================================================

pub struct ActorResolver {
    db: Arc<Database>,
    http_client: reqwest::Client,
    directory: Arc<InstanceDirectory>,
    cache_ttl: Duration,
    fetch_timeout: Duration,
}

impl ActorResolver {
    pub fn new(
        db: Arc<Database>,
        http_client: reqwest::Client,
        directory: Arc<InstanceDirectory>,
        cache_ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            db,
            http_client,
            directory,
            cache_ttl,
            fetch_timeout,
        }
    }

    pub fn directory(&self) -> &InstanceDirectory {
        &self.directory
    }

    fn is_fresh(&self, actor: &RemoteActor) -> bool {
        let age = Utc::now().signed_duration_since(actor.last_fetched_at);
        age.to_std().map(|age| age < self.cache_ttl).unwrap_or(true)
    }

    /// Resolve `[@]username@domain` to a cached remote actor
    pub async fn resolve_remote_user(&self, handle: &str) -> Result<RemoteActor, AppError> {
        let handle = Handle::parse(handle)?;

        if let Some(cached) = self
            .db
            .get_remote_actor_by_handle(&handle.username, &handle.domain)
            .await?
        {
            if self.is_fresh(&cached) {
                tracing::debug!(handle = %handle, "Remote actor cache hit");
                return Ok(cached);
            }
        }

        let actor_uri = self.webfinger(&handle).await?;
        let parsed = self.fetch_actor(&actor_uri).await?;
        let actor = parsed.into_remote_actor(handle.domain.clone());

        self.db.upsert_remote_actor(&actor).await?;
        tracing::info!(handle = %handle, actor = %actor.actor_uri, "Resolved remote actor");

        Ok(actor)
    }

    /// Resolve an actor known only by URI
    ///
    /// Recognized URI shapes go through handle resolution; anything else is
    /// fetched directly.
    pub async fn resolve_actor_from_uri(&self, actor_uri: &str) -> Result<RemoteActor, AppError> {
        if let Some(cached) = self.db.get_remote_actor(actor_uri).await? {
            if self.is_fresh(&cached) {
                return Ok(cached);
            }
        }

        let domain = self
            .directory
            .domain_for_url(actor_uri)
            .ok_or_else(|| AppError::Resolution(format!("Invalid actor URI: {}", actor_uri)))?;

        if let Some(username) = username_from_actor_uri(actor_uri) {
            match self
                .resolve_remote_user(&format!("{}@{}", username, domain))
                .await
            {
                Ok(actor) if actor.actor_uri == actor_uri => return Ok(actor),
                Ok(actor) => {
                    tracing::debug!(
                        expected = %actor_uri,
                        resolved = %actor.actor_uri,
                        "Handle resolved to a different actor; fetching URI directly"
                    );
                }
                Err(error) => {
                    tracing::debug!(%error, actor = %actor_uri, "Handle resolution failed; fetching URI directly");
                }
            }
        }

        let actor = self.fetch_actor(actor_uri).await?.into_remote_actor(domain);
        self.db.upsert_remote_actor(&actor).await?;
        Ok(actor)
    }

    /// Get or create the local ghost user for a remote actor
    pub async fn ensure_remote_user(&self, actor_uri: &str) -> Result<User, AppError> {
        if let Some(user) = self.db.get_user_by_did(actor_uri).await? {
            return Ok(user);
        }
        let actor = self.resolve_actor_from_uri(actor_uri).await?;
        let user = self.db.ensure_ghost_user(&actor).await?;
        tracing::info!(username = %actor.username, domain = %actor.domain, "Created ghost user");
        Ok(user)
    }

    /// PEM public key for a signature keyId
    ///
    /// Uses the cached actor unless `refresh` is set or no key is cached.
    pub async fn public_key_for(&self, key_id: &str, refresh: bool) -> Result<String, AppError> {
        let actor_uri = key_id.split('#').next().unwrap_or(key_id);

        if !refresh {
            if let Some(pem) = self
                .db
                .get_remote_actor(actor_uri)
                .await?
                .and_then(|a| a.public_key_pem)
            {
                return Ok(pem);
            }
        }

        let parsed = self.fetch_actor(actor_uri).await?;
        if let Some(advertised) = parsed.public_key_id.as_deref() {
            if key_id.contains('#') && advertised != key_id {
                return Err(AppError::InvalidSignature(
                    "Signature keyId does not match actor public key id".to_string(),
                ));
            }
        }
        let pem = parsed
            .public_key_pem
            .clone()
            .ok_or_else(|| AppError::InvalidSignature("Actor has no public key".to_string()))?;

        let domain = self
            .directory
            .domain_for_url(actor_uri)
            .unwrap_or_default();
        self.db
            .upsert_remote_actor(&parsed.into_remote_actor(domain))
            .await?;
        Ok(pem)
    }

    async fn webfinger(&self, handle: &Handle) -> Result<String, AppError> {
        let url = format!(
            "{}/.well-known/webfinger?resource={}",
            self.directory.base_url(&handle.domain),
            urlencoding::encode(&handle.resource())
        );
        tracing::debug!(%url, "WebFinger lookup");

        let response = self
            .get_json(&url, "application/jrd+json, application/json")
            .await?;
        let jrd: WebFingerResponse = serde_json::from_value(response)
            .map_err(|e| AppError::Resolution(format!("Malformed WebFinger response: {}", e)))?;

        jrd.actor_uri().map(str::to_string).ok_or_else(|| {
            AppError::Resolution(format!("No actor link in WebFinger response for {}", handle))
        })
    }

    /// Fetch and parse an actor document
    ///
    /// The document must identify itself by the URI it was fetched from.
    pub async fn fetch_actor(&self, actor_uri: &str) -> Result<ParsedActor, AppError> {
        let value = self.get_json(actor_uri, ACTIVITY_JSON).await?;
        let parsed = parse_actor(value)?;
        if parsed.id != actor_uri {
            tracing::warn!(requested = %actor_uri, claimed = %parsed.id, "Actor document id mismatch");
            return Err(AppError::Resolution(format!(
                "Actor document at {} claims id {}",
                actor_uri, parsed.id
            )));
        }
        Ok(parsed)
    }

    async fn get_json(&self, url: &str, accept: &str) -> Result<serde_json::Value, AppError> {
        let started = Instant::now();
        let result = async {
            let response = self
                .http_client
                .get(url)
                .header(reqwest::header::ACCEPT, accept)
                .timeout(self.fetch_timeout)
                .send()
                .await
                .map_err(|e| AppError::Resolution(format!("GET {} failed: {}", url, e)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(AppError::Resolution(format!(
                    "GET {} returned HTTP {}",
                    url, status
                )));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| AppError::Resolution(format!("GET {} returned invalid JSON: {}", url, e)))
        }
        .await;

        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["fetch"])
            .observe(started.elapsed().as_secs_f64());
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["fetch", if result.is_ok() { "success" } else { "error" }])
            .inc();

        result
    }
}
