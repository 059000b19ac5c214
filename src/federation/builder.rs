//! Build ActivityPub activity JSON
//!
//! Activity IDs are instance-relative: `{base}/activities/{kind}-{suffix}`,
//! where the suffix is a nanosecond timestamp made strictly increasing
//! within the process.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use super::activity::{AS_CONTEXT, PUBLIC};

static LAST_SUFFIX: AtomicI64 = AtomicI64::new(0);

/// Nanosecond clock reading, bumped past the previous value on collision
pub fn next_suffix() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut previous = LAST_SUFFIX.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(previous + 1);
        match LAST_SUFFIX.compare_exchange_weak(
            previous,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => previous = actual,
        }
    }
}

fn activity_id(base_url: &str, kind: &str) -> String {
    format!(
        "{}/activities/{}-{}",
        base_url.trim_end_matches('/'),
        kind,
        next_suffix()
    )
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `to`/`cc` for a post visibility
fn audience_for_visibility(actor_uri: &str, visibility: &str) -> (Vec<String>, Vec<String>) {
    let followers_audience = format!("{}/followers", actor_uri);

    match visibility {
        "followers" | "private" => (vec![followers_audience], Vec::new()),
        "unlisted" => (vec![followers_audience], vec![PUBLIC.to_string()]),
        _ => (vec![PUBLIC.to_string()], vec![followers_audience]),
    }
}

/// Build a Create activity wrapping a Note for a local post
///
/// # Arguments
/// * `base_url` - Instance base URL
/// * `actor` - Author actor URI
/// * `post_id` - Local post ID; the note lives at `{base}/posts/{post_id}`
/// * `content` - HTML content
/// * `visibility` - `public`, `unlisted` or `followers`
/// * `published` - Post creation time
pub fn create_note(
    base_url: &str,
    actor: &str,
    post_id: &str,
    content: &str,
    visibility: &str,
    published: DateTime<Utc>,
) -> Value {
    let base_url = base_url.trim_end_matches('/');
    let (to, cc) = audience_for_visibility(actor, visibility);
    let published = rfc3339(published);

    json!({
        "@context": AS_CONTEXT,
        "id": format!("{}/activities/create-{}", base_url, post_id),
        "type": "Create",
        "actor": actor,
        "published": published,
        "to": to,
        "cc": cc,
        "object": {
            "id": format!("{}/posts/{}", base_url, post_id),
            "type": "Note",
            "attributedTo": actor,
            "content": content,
            "published": published,
            "to": to,
            "cc": cc
        }
    })
}

/// Build a Create activity wrapping a Note addressed to one actor
pub fn create_direct_message(base_url: &str, actor: &str, recipient: &str, content: &str) -> Value {
    let base_url = base_url.trim_end_matches('/');
    let suffix = next_suffix();
    let published = rfc3339(Utc::now());

    json!({
        "@context": AS_CONTEXT,
        "id": format!("{}/activities/create-{}", base_url, suffix),
        "type": "Create",
        "actor": actor,
        "published": published,
        "to": [recipient],
        "object": {
            "id": format!("{}/posts/{}", base_url, suffix),
            "type": "Note",
            "attributedTo": actor,
            "content": content,
            "published": published,
            "to": [recipient]
        }
    })
}

/// Build a Like activity
///
/// # Arguments
/// * `base_url` - Instance base URL
/// * `actor` - Actor URI (liker)
/// * `object` - Object URI being liked
pub fn like(base_url: &str, actor: &str, object: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": activity_id(base_url, "like"),
        "type": "Like",
        "actor": actor,
        "object": object
    })
}

/// Build an Announce activity (boost)
pub fn announce(base_url: &str, actor: &str, object: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": activity_id(base_url, "announce"),
        "type": "Announce",
        "actor": actor,
        "object": object,
        "to": [PUBLIC],
        "published": rfc3339(Utc::now())
    })
}

/// Build a Delete activity for a post or an actor
pub fn delete(base_url: &str, actor: &str, object: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": activity_id(base_url, "delete"),
        "type": "Delete",
        "actor": actor,
        "object": object,
        "to": [PUBLIC]
    })
}

/// Profile fields carried by an Update{Person}
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate<'a> {
    pub username: &'a str,
    pub display_name: &'a str,
    pub summary: &'a str,
    pub avatar_url: &'a str,
    pub public_key_pem: &'a str,
}

/// Build an Update activity carrying a Person
///
/// Relative avatar paths are resolved against `base_url`.
pub fn update_person(base_url: &str, actor: &str, profile: &ProfileUpdate<'_>) -> Value {
    let base_url = base_url.trim_end_matches('/');
    let mut person = json!({
        "id": actor,
        "type": "Person",
        "preferredUsername": profile.username,
        "name": profile.display_name,
        "summary": profile.summary,
        "inbox": format!("{}/ap/users/{}/inbox", base_url, profile.username),
        "outbox": format!("{}/ap/users/{}/outbox", base_url, profile.username),
        "publicKey": {
            "id": format!("{}#main-key", actor),
            "owner": actor,
            "publicKeyPem": profile.public_key_pem
        }
    });

    let avatar = profile.avatar_url.trim();
    if !avatar.is_empty() {
        let avatar = if avatar.starts_with('/') {
            format!("{}{}", base_url, avatar)
        } else {
            avatar.to_string()
        };
        person["icon"] = json!({"type": "Image", "mediaType": "image/jpeg", "url": avatar});
    }

    json!({
        "@context": AS_CONTEXT,
        "id": activity_id(base_url, "update"),
        "type": "Update",
        "actor": actor,
        "object": person,
        "to": [PUBLIC]
    })
}

/// Build a Follow activity
///
/// # Arguments
/// * `actor` - Actor URI (follower); the ID is scoped under it
/// * `object` - Object URI (followee)
pub fn follow(actor: &str, object: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": format!("{}/activities/follow-{}", actor, next_suffix()),
        "type": "Follow",
        "actor": actor,
        "object": object
    })
}

/// Build an Accept activity
///
/// # Arguments
/// * `base_url` - Instance base URL
/// * `actor` - Actor URI (accepter)
/// * `object` - Original activity being accepted (usually a Follow)
pub fn accept(base_url: &str, actor: &str, object: Value) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": activity_id(base_url, "accept"),
        "type": "Accept",
        "actor": actor,
        "object": object
    })
}

/// Build an Undo activity
pub fn undo(base_url: &str, actor: &str, object: Value) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": activity_id(base_url, "undo"),
        "type": "Undo",
        "actor": actor,
        "object": object
    })
}
