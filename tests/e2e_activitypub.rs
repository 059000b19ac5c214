//! E2E tests for ActivityPub endpoints: actors, inboxes and outboxes

mod common;

use common::schema_validator::assert_matches_schema;
use common::{TestServer, eventually};
use serde_json::{Value, json};
use splitter_federation::data::FollowStatus;
use splitter_federation::federation::sign_request;

fn follow(id: &str, actor: &str, object: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": id,
        "type": "Follow",
        "actor": actor,
        "object": object,
    })
}

// =============================================================================
// Actor documents
// =============================================================================

#[tokio::test]
async fn test_actor_document() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let response = server
        .client
        .get(&server.url("/ap/users/alice"))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("application/activity+json")
    );
    let json: Value = response.json().await.unwrap();
    assert_matches_schema(&json, "actor");
    assert_eq!(json["type"], "Person");
    assert_eq!(json["id"], server.actor("alice"));
    assert_eq!(json["inbox"], format!("{}/inbox", server.actor("alice")));
    assert_eq!(
        json["endpoints"]["sharedInbox"],
        server.url("/ap/shared-inbox")
    );
    assert_eq!(
        json["publicKey"]["id"],
        format!("{}#main-key", server.actor("alice"))
    );
}

#[tokio::test]
async fn test_instance_actor_is_served_without_user_row() {
    let server = TestServer::new().await;

    let json: Value = server
        .client
        .get(&server.url("/ap/users/admin"))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(json["type"], "Application");
    let instance_key = server.state.identity.public_key_pem().await.unwrap();
    assert_eq!(json["publicKey"]["publicKeyPem"], instance_key);
}

#[tokio::test]
async fn test_actor_requires_activity_json() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let response = server
        .client
        .get(&server.url("/ap/users/alice"))
        .header("Accept", "text/html")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 406);
}

#[tokio::test]
async fn test_unknown_actor() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/ap/users/nobody"))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

// =============================================================================
// Inbox
// =============================================================================

#[tokio::test]
async fn test_unsigned_follow_is_accepted_and_answered() {
    let (server, stub) = TestServer::with_stub().await;
    let alice = server.create_user("alice").await;
    let bob = stub.actor("bob");

    let response = server
        .client
        .post(&server.url("/ap/users/alice/inbox"))
        .header("Content-Type", "application/activity+json")
        .json(&follow(
            &format!("{}/follows/1", bob),
            &bob,
            &server.actor("alice"),
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["status"], "accepted");

    let edge = server
        .state
        .db
        .get_follow(&bob, &alice.did)
        .await
        .unwrap()
        .expect("follow edge");
    assert_eq!(edge.status, FollowStatus::Accepted.as_str());

    // Accept is signed and delivered to the follower's inbox
    let accept = stub
        .wait_for(|r| r.body["type"] == "Accept")
        .await
        .expect("Accept delivered");
    assert_eq!(accept.path, "/ap/users/bob/inbox");
    assert!(accept.signed);
    assert_eq!(accept.body["actor"], server.actor("alice"));
    assert_eq!(accept.body["object"]["id"], format!("{}/follows/1", bob));
}

#[tokio::test]
async fn test_signed_follow_is_verified() {
    let (server, stub) = TestServer::with_stub().await;
    server.create_user("alice").await;
    let bob = stub.actor("bob");

    let response = stub
        .send_signed(
            &server.url("/ap/users/alice/inbox"),
            &follow(
                &format!("{}/follows/signed", bob),
                &bob,
                &server.actor("alice"),
            ),
        )
        .await;

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["status"], "accepted");
}

#[tokio::test]
async fn test_tampered_body_fails_signature() {
    let (server, stub) = TestServer::with_stub().await;
    server.create_user("alice").await;
    let bob = stub.actor("bob");
    let inbox = server.url("/ap/users/alice/inbox");

    let signed_body = serde_json::to_vec(&follow(
        &format!("{}/follows/a", bob),
        &bob,
        &server.actor("alice"),
    ))
    .unwrap();
    let sent_body = serde_json::to_vec(&follow(
        &format!("{}/follows/b", bob),
        &bob,
        &server.actor("alice"),
    ))
    .unwrap();
    let headers = sign_request(
        "POST",
        &inbox,
        Some(&signed_body),
        &stub.private_key,
        &format!("{}#main-key", bob),
    )
    .unwrap();

    let response = server
        .client
        .post(&inbox)
        .header("Content-Type", "application/activity+json")
        .header("Date", headers.date)
        .header("Signature", headers.signature)
        .header("Digest", headers.digest.unwrap())
        .body(sent_body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);

    let snapshot: Value = server
        .admin_get("/api/admin/security/messaging")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["metrics"]["inbox_rejected"], 1);
    assert!(
        snapshot["recent_events"]
            .as_array()
            .unwrap()
            .iter()
            .any(|event| event["type"] == "inbox_rejected")
    );
}

#[tokio::test]
async fn test_foreign_signer_is_rejected() {
    let (server, stub) = TestServer::with_stub().await;
    server.create_user("alice").await;

    // Signed by mallory's key but claiming to come from bob
    let inbox = server.url("/ap/users/alice/inbox");
    let activity = follow(
        &format!("{}/follows/spoof", stub.actor("bob")),
        &stub.actor("bob"),
        &server.actor("alice"),
    );
    let body = serde_json::to_vec(&activity).unwrap();
    let headers = sign_request(
        "POST",
        &inbox,
        Some(&body),
        &stub.private_key,
        &format!("{}#main-key", stub.actor("mallory")),
    )
    .unwrap();

    let response = server
        .client
        .post(&inbox)
        .header("Date", headers.date)
        .header("Signature", headers.signature)
        .header("Digest", headers.digest.unwrap())
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_redelivery_is_idempotent() {
    let (server, stub) = TestServer::with_stub().await;
    let alice = server.create_user("alice").await;
    let bob = stub.actor("bob");
    let like_target = server
        .state
        .db
        .insert_local_post(&alice.did, "hello", "public")
        .await
        .unwrap();
    let like = json!({
        "id": format!("{}/likes/1", bob),
        "type": "Like",
        "actor": bob,
        "object": format!("{}/posts/{}", server.addr, like_target.id),
    });

    let mut statuses = Vec::new();
    for _ in 0..2 {
        let response = server
            .client
            .post(&server.url("/ap/shared-inbox"))
            .json(&like)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let json: Value = response.json().await.unwrap();
        statuses.push(json["status"].as_str().unwrap().to_string());
    }

    assert_eq!(statuses, vec!["liked", "already processed"]);
    let likes = server
        .state
        .db
        .count_interactions(&like_target.id, splitter_federation::data::InteractionKind::Like)
        .await
        .unwrap();
    assert_eq!(likes, 1);
}

#[tokio::test]
async fn test_malformed_activity_is_bad_request() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(&server.url("/ap/shared-inbox"))
        .header("Content-Type", "application/activity+json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_blocked_domain_is_forbidden() {
    let (server, stub) = TestServer::with_stub().await;
    server.create_user("alice").await;
    server
        .state
        .db
        .block_domain("splitter-2", Some("spam"))
        .await
        .unwrap();

    let response = server
        .client
        .post(&server.url("/ap/users/alice/inbox"))
        .json(&follow(
            &format!("{}/follows/blocked", stub.actor("bob")),
            &stub.actor("bob"),
            &server.actor("alice"),
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    assert!(stub.received().is_empty());
}

#[tokio::test]
async fn test_follow_of_unknown_user_is_not_found() {
    let (server, stub) = TestServer::with_stub().await;

    let response = server
        .client
        .post(&server.url("/ap/shared-inbox"))
        .json(&follow(
            &format!("{}/follows/ghost", stub.actor("bob")),
            &stub.actor("bob"),
            &server.actor("nobody"),
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

// =============================================================================
// Outbox
// =============================================================================

#[tokio::test]
async fn test_outbox_lists_delivered_activities() {
    let (server, stub) = TestServer::with_stub().await;
    server.create_user("alice").await;
    let bob = stub.actor("bob");

    server
        .client
        .post(&server.url("/ap/users/alice/inbox"))
        .json(&follow(
            &format!("{}/follows/outbox", bob),
            &bob,
            &server.actor("alice"),
        ))
        .send()
        .await
        .unwrap();
    stub.wait_for(|r| r.body["type"] == "Accept")
        .await
        .expect("Accept delivered");

    // The entry is marked sent right after the stub answers
    let db = server.state.db.clone();
    let actor = server.actor("alice");
    assert!(
        eventually(move || {
            let db = db.clone();
            let actor = actor.clone();
            async move { db.list_sent_activities(&actor, 20).await.unwrap().len() == 1 }
        })
        .await
    );

    let outbox: Value = server
        .client
        .get(&server.url("/ap/users/alice/outbox"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outbox["totalItems"], 1);
    assert_matches_schema(&outbox, "ordered_collection");
    assert_eq!(outbox["orderedItems"][0]["type"], "Accept");
}
