//! Activity envelope parsing and URI helpers

use serde_json::Value;

use crate::error::AppError;

/// ActivityStreams JSON-LD context
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
/// The public collection
pub const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// ActivityPub Activity types handled by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Undo,
    Like,
    Announce,
    /// Anything else; accepted and ignored
    Other(String),
}

impl ActivityType {
    /// Parse activity type from string
    pub fn parse(s: &str) -> Self {
        match s {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Undo" => Self::Undo,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Undo => "Undo",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Other(other) => other,
        }
    }
}

/// The fields every inbound activity must carry
#[derive(Debug, Clone)]
pub struct ActivityEnvelope {
    pub id: String,
    pub kind: ActivityType,
    pub actor: String,
    pub object: Value,
    pub raw: Value,
}

impl ActivityEnvelope {
    /// Parse raw JSON into an envelope
    ///
    /// `actor` may be a string or an object with `id`.
    pub fn parse(body: &[u8]) -> Result<Self, AppError> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Invalid activity JSON: {}", e)))?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> Result<Self, AppError> {
        if !raw.is_object() {
            return Err(AppError::Validation(
                "Activity must be a JSON object".to_string(),
            ));
        }

        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .map(ActivityType::parse)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;
        let actor = value_id(raw.get("actor"))
            .ok_or_else(|| AppError::Validation("Missing activity actor".to_string()))?;
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Validation("Missing activity id".to_string()))?
            .to_string();
        let object = raw.get("object").cloned().unwrap_or(Value::Null);

        Ok(Self {
            id,
            kind,
            actor,
            object,
            raw,
        })
    }

    /// The object's `id`, or the object itself when it is a bare URI
    pub fn object_id(&self) -> Option<String> {
        value_id(Some(&self.object))
    }

    /// `object.type` when the object is embedded
    pub fn object_type(&self) -> Option<&str> {
        self.object.get("type").and_then(Value::as_str)
    }

    /// Whether the activity or its object addresses the public collection
    pub fn is_public(&self) -> bool {
        is_public(&self.raw) || is_public(&self.object)
    }
}

/// `value` as a URI string, or its `id` field
pub fn value_id(value: Option<&Value>) -> Option<String> {
    let value = value?;
    value
        .as_str()
        .or_else(|| value.get("id").and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Addressing entries from `to` and `cc`, accepting a string or an array
pub fn audience(value: &Value) -> Vec<String> {
    let mut entries = Vec::new();
    for field in ["to", "cc"] {
        match value.get(field) {
            Some(Value::String(s)) => entries.push(s.clone()),
            Some(Value::Array(items)) => entries.extend(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            ),
            _ => {}
        }
    }
    entries
}

pub fn is_public(value: &Value) -> bool {
    audience(value)
        .iter()
        .any(|entry| entry == PUBLIC || entry == "as:Public" || entry == "Public")
}

/// Local post ID embedded in a post URI: the segment after `posts`
pub fn post_id_from_uri(uri: &str) -> Option<String> {
    let parsed = url::Url::parse(uri).ok()?;
    let mut segments = parsed.path_segments()?;
    segments.find(|segment| *segment == "posts")?;
    segments
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Whether a Delete target names an actor rather than a post
pub fn is_actor_uri(uri: &str) -> bool {
    uri.contains("/ap/users/") && !uri.contains("/posts/")
}

/// Strip remote HTML down to a safe subset
pub fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_accepts_embedded_actor() {
        let envelope = ActivityEnvelope::from_value(json!({
            "id": "http://localhost:8001/activities/like-1",
            "type": "Like",
            "actor": {"id": "http://localhost:8001/ap/users/bob"},
            "object": "http://localhost:8000/ap/users/alice/posts/01H"
        }))
        .expect("valid envelope");

        assert_eq!(envelope.kind, ActivityType::Like);
        assert_eq!(envelope.actor, "http://localhost:8001/ap/users/bob");
        assert_eq!(
            envelope.object_id().as_deref(),
            Some("http://localhost:8000/ap/users/alice/posts/01H")
        );
    }

    #[test]
    fn envelope_rejects_missing_fields() {
        assert!(ActivityEnvelope::parse(b"not json").is_err());
        assert!(ActivityEnvelope::parse(b"[]").is_err());
        assert!(ActivityEnvelope::from_value(json!({"type": "Like", "actor": "a"})).is_err());
        assert!(ActivityEnvelope::from_value(json!({"id": "x", "actor": "a"})).is_err());
    }

    #[test]
    fn unknown_types_are_preserved() {
        assert_eq!(
            ActivityType::parse("Move"),
            ActivityType::Other("Move".to_string())
        );
        assert_eq!(ActivityType::parse("Move").as_str(), "Move");
    }

    #[test]
    fn public_addressing_forms() {
        assert!(is_public(&json!({"to": [PUBLIC]})));
        assert!(is_public(&json!({"cc": "as:Public"})));
        assert!(!is_public(&json!({"to": ["http://localhost:8000/ap/users/alice"]})));
    }

    #[test]
    fn post_id_follows_posts_segment() {
        assert_eq!(
            post_id_from_uri("http://localhost:8000/ap/users/alice/posts/01HX").as_deref(),
            Some("01HX")
        );
        assert_eq!(
            post_id_from_uri("http://localhost:8000/posts/42").as_deref(),
            Some("42")
        );
        assert_eq!(post_id_from_uri("http://localhost:8000/ap/users/alice"), None);
    }

    #[test]
    fn actor_uri_detection() {
        assert!(is_actor_uri("http://localhost:8001/ap/users/bob"));
        assert!(!is_actor_uri("http://localhost:8001/ap/users/bob/posts/1"));
        assert!(!is_actor_uri("http://localhost:8001/posts/1"));
    }

    #[test]
    fn sanitize_strips_scripts() {
        let cleaned = sanitize_remote_html("<p>hi</p><script>alert(1)</script>");
        assert_eq!(cleaned, "<p>hi</p>");
    }
}
