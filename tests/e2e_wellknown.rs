//! E2E tests for the WebFinger endpoint

mod common;

use common::TestServer;
use serde_json::Value;

#[tokio::test]
async fn test_webfinger_with_account() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:alice@splitter-1"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("application/jrd+json")
    );

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["subject"], "acct:alice@splitter-1");
    let self_link = json["links"]
        .as_array()
        .unwrap()
        .iter()
        .find(|link| link["rel"] == "self")
        .expect("self link");
    assert_eq!(self_link["type"], "application/activity+json");
    assert_eq!(self_link["href"], server.actor("alice"));
}

#[tokio::test]
async fn test_webfinger_serves_instance_actor() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:admin@splitter-1"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["links"][0]["href"], server.actor("admin"));
}

#[tokio::test]
async fn test_webfinger_unknown_user() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:nobody@splitter-1"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_webfinger_foreign_domain() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:alice@splitter-2"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_webfinger_requires_acct_resource() {
    let server = TestServer::new().await;

    for path in [
        "/.well-known/webfinger",
        "/.well-known/webfinger?resource=",
        "/.well-known/webfinger?resource=https://splitter-1/ap/users/alice",
    ] {
        let response = server.client.get(&server.url(path)).send().await.unwrap();
        assert_eq!(response.status(), 400, "{path}");
    }
}
