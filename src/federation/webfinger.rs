//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from `user@domain` handles.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Media type of ActivityPub actor documents
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

impl WebFingerResponse {
    /// The actor URI from the `self` link typed as activity JSON
    pub fn actor_uri(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link
                        .link_type
                        .as_deref()
                        .is_some_and(|t| t.starts_with(ACTIVITY_JSON) || t.contains("activitystreams"))
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// A `user@domain` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub username: String,
    pub domain: String,
}

impl Handle {
    /// Parse `user@domain`, `@user@domain` or `acct:user@domain`
    pub fn parse(input: &str) -> Result<Self, AppError> {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix("acct:").unwrap_or(trimmed);
        let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed);

        match trimmed.split_once('@') {
            Some((username, domain))
                if !username.is_empty() && !domain.is_empty() && !domain.contains('@') =>
            {
                Ok(Self {
                    username: username.to_string(),
                    domain: domain.to_ascii_lowercase(),
                })
            }
            _ => Err(AppError::Validation(format!(
                "Invalid handle '{}', expected user@domain",
                input
            ))),
        }
    }

    pub fn resource(&self) -> String {
        format!("acct:{}@{}", self.username, self.domain)
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.username, self.domain)
    }
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `base_url` - Instance base URL (includes protocol)
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    base_url: &str,
) -> WebFingerResponse {
    let actor_url = format!("{}/ap/users/{}", base_url.trim_end_matches('/'), username);

    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.clone()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_url),
        }],
    }
}
