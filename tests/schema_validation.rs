//! Schema validation tests for public federation documents
//!
//! WebFinger JRDs and actor documents are what peers parse first; these
//! tests pin their shape with the JSON schemas in `tests/schemas/`.

mod common;

use common::schema_validator::{assert_matches_schema, load_test_schema, validate_against_schema};
use common::{ADMIN_TOKEN, TestServer};
use serde_json::{Value, json};

async fn get_actor(server: &TestServer, username: &str) -> Value {
    server
        .client
        .get(&server.url(&format!("/ap/users/{}", username)))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_webfinger_schema() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    for resource in ["acct:alice@splitter-1", "acct:admin@splitter-1"] {
        let json: Value = server
            .client
            .get(&server.url(&format!("/.well-known/webfinger?resource={}", resource)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_matches_schema(&json, "webfinger");
    }
}

#[tokio::test]
async fn test_instance_actor_schema() {
    let server = TestServer::new().await;

    let json = get_actor(&server, "admin").await;
    assert_matches_schema(&json, "actor");
}

#[tokio::test]
async fn test_actor_schema_after_profile_update() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let response = server
        .client
        .put(server.url("/api/federation/profile"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({
            "username": "alice",
            "bio": "Rust and fediverse",
            "avatar_url": "/media/alice.jpg",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let json = get_actor(&server, "alice").await;
    assert_matches_schema(&json, "actor");
    assert_eq!(json["summary"], "Rust and fediverse");
    assert_eq!(json["name"], "alice display");
    assert_eq!(json["icon"]["url"], server.url("/media/alice.jpg"));
}

#[tokio::test]
async fn test_schema_rejects_actor_without_key() {
    let schema = load_test_schema("actor");
    let actor = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "http://localhost:8000/ap/users/alice",
        "type": "Person",
        "preferredUsername": "alice",
        "inbox": "http://localhost:8000/ap/users/alice/inbox",
        "outbox": "http://localhost:8000/ap/users/alice/outbox",
        "endpoints": {"sharedInbox": "http://localhost:8000/ap/shared-inbox"}
    });

    let errors = validate_against_schema(&actor, &schema).unwrap_err();
    assert!(errors.iter().any(|e| e.contains("publicKey")));
}
