//! Database tests

use super::*;
use chrono::{Duration, Utc};
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn sample_actor(uri: &str, username: &str, domain: &str) -> RemoteActor {
    RemoteActor {
        actor_uri: uri.to_string(),
        username: username.to_string(),
        domain: domain.to_string(),
        inbox_url: format!("{}/inbox", uri),
        outbox_url: Some(format!("{}/outbox", uri)),
        shared_inbox_url: None,
        public_key_pem: None,
        display_name: username.to_string(),
        avatar_url: String::new(),
        last_fetched_at: Utc::now(),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
}

#[tokio::test]
async fn test_local_user_did() {
    let (db, _temp_dir) = create_test_db().await;

    let user = db
        .create_local_user("alice", "Alice", "splitter-1")
        .await
        .unwrap();
    assert_eq!(user.did, "did:web:splitter-1:alice");
    assert!(!user.is_remote);

    let found = db.get_local_user("alice").await.unwrap().unwrap();
    assert_eq!(found.id, user.id);
    assert!(db.get_local_user("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_local_profile_keeps_unset_fields() {
    let (db, _temp_dir) = create_test_db().await;
    db.create_local_user("alice", "Alice", "splitter-1")
        .await
        .unwrap();

    let updated = db
        .update_local_profile("alice", None, Some("hello"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.display_name, "Alice");
    assert_eq!(updated.bio, "hello");

    assert!(
        db.update_local_profile("nobody", Some("x"), None, None)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_ghost_user_is_reused() {
    let (db, _temp_dir) = create_test_db().await;
    let actor = sample_actor("http://localhost:8001/ap/users/bob", "bob", "splitter-2");

    let first = db.ensure_ghost_user(&actor).await.unwrap();
    let second = db.ensure_ghost_user(&actor).await.unwrap();
    assert_eq!(first.id, second.id);
    assert!(first.is_remote);
    assert_eq!(first.did, actor.actor_uri);

    db.patch_ghost_profile(&actor.actor_uri, "", "new bio", "")
        .await
        .unwrap();
    let patched = db.get_user_by_did(&actor.actor_uri).await.unwrap().unwrap();
    assert_eq!(patched.display_name, "bob");
    assert_eq!(patched.bio, "new bio");
}

#[tokio::test]
async fn test_remote_post_insert_is_idempotent() {
    let (db, _temp_dir) = create_test_db().await;
    let uri = "http://localhost:8001/ap/users/bob/posts/1";

    assert!(db.insert_remote_post("bob", "<p>hi</p>", "public", uri).await.unwrap());
    assert!(!db.insert_remote_post("bob", "<p>hi</p>", "public", uri).await.unwrap());

    let post = db.find_post(uri, None).await.unwrap().unwrap();
    assert!(post.is_remote);

    assert_eq!(db.soft_delete_post(uri, None).await.unwrap(), 1);
    assert!(db.find_post(uri, None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_interactions_are_unique() {
    let (db, _temp_dir) = create_test_db().await;
    let post = db
        .insert_local_post("did:web:splitter-1:alice", "hello", "public")
        .await
        .unwrap();

    assert!(db.insert_interaction(&post.id, "bob", InteractionKind::Like).await.unwrap());
    assert!(!db.insert_interaction(&post.id, "bob", InteractionKind::Like).await.unwrap());
    assert!(db.insert_interaction(&post.id, "bob", InteractionKind::Repost).await.unwrap());
    assert_eq!(db.count_interactions(&post.id, InteractionKind::Like).await.unwrap(), 1);

    db.delete_interaction(&post.id, "bob", InteractionKind::Like)
        .await
        .unwrap();
    assert_eq!(db.count_interactions(&post.id, InteractionKind::Like).await.unwrap(), 0);
}

#[tokio::test]
async fn test_follow_accept_by_activity_id() {
    let (db, _temp_dir) = create_test_db().await;

    db.upsert_follow(
        "did:web:splitter-1:alice",
        "http://localhost:8001/ap/users/bob",
        FollowStatus::Pending,
        Some("http://localhost:8000/activities/follow-1"),
    )
    .await
    .unwrap();

    let bob = "http://localhost:8001/ap/users/bob";
    assert_eq!(
        db.accept_follow_by_activity("http://localhost:8000/activities/other", bob)
            .await
            .unwrap(),
        0
    );
    // Only the followed actor can accept
    assert_eq!(
        db.accept_follow_by_activity(
            "http://localhost:8000/activities/follow-1",
            "http://evil.example/ap/users/bob",
        )
        .await
        .unwrap(),
        0
    );
    assert_eq!(
        db.accept_follow_by_activity("http://localhost:8000/activities/follow-1", bob)
            .await
            .unwrap(),
        1
    );

    let edge = db
        .get_follow("did:web:splitter-1:alice", "http://localhost:8001/ap/users/bob")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(edge.status, "accepted");
}

#[tokio::test]
async fn test_follow_accept_loosely() {
    let (db, _temp_dir) = create_test_db().await;

    db.upsert_follow(
        "did:web:splitter-1:alice",
        "http://localhost:8001/ap/users/bob",
        FollowStatus::Pending,
        None,
    )
    .await
    .unwrap();

    let bob = "http://localhost:8001/ap/users/bob";
    assert_eq!(db.accept_follow_loosely("alice", "http://localhost:8001/ap/users/carol").await.unwrap(), 0);
    assert_eq!(db.accept_follow_loosely("alice", bob).await.unwrap(), 1);
    assert_eq!(db.accept_follow_loosely("alice", bob).await.unwrap(), 0);
}

#[tokio::test]
async fn test_follow_accept_loosely_treats_wildcards_literally() {
    let (db, _temp_dir) = create_test_db().await;
    let bob = "http://localhost:8001/ap/users/bob";
    let carol = "http://localhost:8001/ap/users/carol";
    for following in [bob, carol] {
        db.upsert_follow("did:web:splitter-1:alice", following, FollowStatus::Pending, None)
            .await
            .unwrap();
    }

    for fragment in ["%", "_", "%%%", "a_ice", "\\"] {
        assert_eq!(db.accept_follow_loosely(fragment, bob).await.unwrap(), 0, "{fragment}");
    }
    assert_eq!(db.accept_follow_loosely("", bob).await.unwrap(), 0);

    for following in [bob, carol] {
        let edge = db
            .get_follow("did:web:splitter-1:alice", following)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(edge.status, "pending");
    }
}

#[tokio::test]
async fn test_follower_inboxes_require_accepted_edges() {
    let (db, _temp_dir) = create_test_db().await;
    let local = "did:web:splitter-1:alice";

    let bob = sample_actor("http://localhost:8001/ap/users/bob", "bob", "splitter-2");
    let carol = sample_actor("http://localhost:8001/ap/users/carol", "carol", "splitter-2");
    db.upsert_remote_actor(&bob).await.unwrap();
    db.upsert_remote_actor(&carol).await.unwrap();

    db.upsert_follow(&bob.actor_uri, local, FollowStatus::Accepted, None)
        .await
        .unwrap();
    db.upsert_follow(&carol.actor_uri, local, FollowStatus::Pending, None)
        .await
        .unwrap();

    let inboxes = db.get_follower_inboxes(local).await.unwrap();
    assert_eq!(inboxes, vec![bob.inbox_url.clone()]);
}

#[tokio::test]
async fn test_thread_is_order_independent() {
    let (db, _temp_dir) = create_test_db().await;

    let first = db.get_or_create_thread("u1", "u2").await.unwrap();
    let second = db.get_or_create_thread("u2", "u1").await.unwrap();
    assert_eq!(first.id, second.id);

    assert!(db
        .insert_message(&first.id, "u2", "u1", "hi", Some("act-1"))
        .await
        .unwrap());
    assert!(!db
        .insert_message(&first.id, "u2", "u1", "hi", Some("act-1"))
        .await
        .unwrap());
    assert_eq!(db.get_thread_messages(&first.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_instance_keys_first_writer_wins() {
    let (db, _temp_dir) = create_test_db().await;

    let stored = db
        .store_instance_keys("splitter-1", "pub-a", "priv-a")
        .await
        .unwrap();
    assert_eq!(stored.public_key_pem, "pub-a");

    let again = db
        .store_instance_keys("splitter-1", "pub-b", "priv-b")
        .await
        .unwrap();
    assert_eq!(again.public_key_pem, "pub-a");
}

#[tokio::test]
async fn test_remote_actor_upsert_refreshes() {
    let (db, _temp_dir) = create_test_db().await;
    let mut actor = sample_actor("http://localhost:8001/ap/users/bob", "bob", "splitter-2");
    db.upsert_remote_actor(&actor).await.unwrap();

    actor.display_name = "Bob B".to_string();
    db.upsert_remote_actor(&actor).await.unwrap();

    let cached = db
        .get_remote_actor_by_handle("bob", "splitter-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.display_name, "Bob B");
    assert_eq!(db.list_remote_actors().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_outbox_retry_selection() {
    let (db, _temp_dir) = create_test_db().await;

    let due = db
        .insert_outbox_entry("act-1", "Create", "{}", "http://a/inbox", "a", Utc::now())
        .await
        .unwrap();
    let later = db
        .insert_outbox_entry("act-2", "Create", "{}", "http://b/inbox", "b", Utc::now())
        .await
        .unwrap();
    let abandoned = db
        .insert_outbox_entry("act-3", "Create", "{}", "http://c/inbox", "c", Utc::now())
        .await
        .unwrap();
    let sent = db
        .insert_outbox_entry("act-4", "Create", "{}", "http://d/inbox", "d", Utc::now())
        .await
        .unwrap();

    db.mark_outbox_failed(&later.id, "timeout", Some(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();
    db.mark_outbox_failed(&abandoned.id, "blocked", None)
        .await
        .unwrap();
    db.mark_outbox_sent(&sent.id).await.unwrap();
    db.insert_outbox_entry(
        "act-5",
        "Create",
        "{}",
        "http://e/inbox",
        "e",
        Utc::now() + Duration::minutes(1),
    )
    .await
    .unwrap();

    let retryable = db
        .list_retryable_outbox(6, Utc::now() + Duration::seconds(1), 10)
        .await
        .unwrap();
    let ids: Vec<_> = retryable.iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec![due.id]);

    let failed = db.get_outbox_entry(&later.id).await.unwrap().unwrap();
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.last_error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_outbox_claim_respects_leases() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();
    let lease = now + Duration::minutes(1);

    let in_flight = db
        .insert_outbox_entry("act-1", "Create", "{}", "http://a/inbox", "a", lease)
        .await
        .unwrap();
    assert!(!db.claim_outbox_entry(&in_flight.id, now, lease, false).await.unwrap());
    assert!(!db.claim_outbox_entry(&in_flight.id, now, lease, true).await.unwrap());
    // An attempt that never reported back is reclaimed once its lease runs out
    assert!(
        db.claim_outbox_entry(&in_flight.id, lease + Duration::seconds(1), lease, false)
            .await
            .unwrap()
    );

    let deferred = db
        .insert_outbox_entry("act-2", "Create", "{}", "http://b/inbox", "b", now)
        .await
        .unwrap();
    db.mark_outbox_failed(&deferred.id, "timeout", Some(now + Duration::hours(1)))
        .await
        .unwrap();
    assert!(!db.claim_outbox_entry(&deferred.id, now, lease, false).await.unwrap());
    assert!(db.claim_outbox_entry(&deferred.id, now, lease, true).await.unwrap());
    // Claimed entries are in flight again
    assert!(!db.claim_outbox_entry(&deferred.id, now, lease, true).await.unwrap());
    assert!(db.list_retryable_outbox(6, now, 10).await.unwrap().is_empty());

    let sent = db
        .insert_outbox_entry("act-3", "Create", "{}", "http://c/inbox", "c", now)
        .await
        .unwrap();
    db.mark_outbox_sent(&sent.id).await.unwrap();
    assert!(!db.claim_outbox_entry(&sent.id, now, lease, true).await.unwrap());
}

#[tokio::test]
async fn test_outbox_error_is_truncated() {
    let (db, _temp_dir) = create_test_db().await;
    let entry = db
        .insert_outbox_entry("act-1", "Create", "{}", "http://a/inbox", "a", Utc::now())
        .await
        .unwrap();

    db.mark_outbox_failed(&entry.id, &"x".repeat(2000), None)
        .await
        .unwrap();
    let stored = db.get_outbox_entry(&entry.id).await.unwrap().unwrap();
    assert_eq!(stored.last_error.unwrap().len(), 512);
}

#[tokio::test]
async fn test_dedup_expiry() {
    let (db, _temp_dir) = create_test_db().await;

    assert!(db.claim_activity("live", Utc::now() + Duration::days(7)).await.unwrap());
    assert!(db.claim_activity("stale", Utc::now() - Duration::seconds(1)).await.unwrap());

    assert!(db.is_activity_processed("live").await.unwrap());
    assert!(!db.is_activity_processed("stale").await.unwrap());
    assert_eq!(db.purge_expired_dedup(Utc::now()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_activity_claim_is_exclusive_until_expiry_or_release() {
    let (db, _temp_dir) = create_test_db().await;
    let week = Utc::now() + Duration::days(7);

    assert!(db.claim_activity("act", week).await.unwrap());
    assert!(!db.claim_activity("act", week).await.unwrap());

    db.release_activity("act").await.unwrap();
    assert!(!db.is_activity_processed("act").await.unwrap());
    assert!(db.claim_activity("act", week).await.unwrap());

    // An expired claim is taken over in place
    assert!(db.claim_activity("old", Utc::now() - Duration::seconds(1)).await.unwrap());
    assert!(db.claim_activity("old", week).await.unwrap());
    assert!(db.is_activity_processed("old").await.unwrap());
}

#[tokio::test]
async fn test_circuit_opens_at_threshold_and_resets() {
    let (db, _temp_dir) = create_test_db().await;
    let open_until = Utc::now() + Duration::seconds(300);

    for _ in 0..2 {
        let state = db
            .record_domain_failure("slow.example", "timeout", 3, open_until)
            .await
            .unwrap();
        assert!(state.circuit_open_until.is_none());
    }
    let state = db
        .record_domain_failure("slow.example", "timeout", 3, open_until)
        .await
        .unwrap();
    assert_eq!(state.failure_count, 3);
    assert!(state.circuit_open_until.is_some());

    db.record_domain_success("slow.example").await.unwrap();
    let state = db
        .get_domain_failure_state("slow.example")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.failure_count, 0);
    assert!(state.circuit_open_until.is_none());
    assert!(state.last_failure_at.is_none());
}

#[tokio::test]
async fn test_connection_ledger_counts() {
    let (db, _temp_dir) = create_test_db().await;

    db.record_connection("splitter-1", "splitter-2", OutboxStatus::Sent)
        .await
        .unwrap();
    db.record_connection("splitter-1", "splitter-2", OutboxStatus::Failed)
        .await
        .unwrap();

    let rows = db.list_connections().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].success_count, 1);
    assert_eq!(rows[0].failure_count, 1);
    assert_eq!(rows[0].last_status, "failed");
}

#[tokio::test]
async fn test_domain_block_operations() {
    let (db, _temp_dir) = create_test_db().await;

    db.block_domain("spam.example", Some("Spam wave")).await.unwrap();
    assert!(db.is_domain_blocked("spam.example").await.unwrap());
    assert_eq!(
        db.count_spam_signals("spam.example", Utc::now() - Duration::days(30))
            .await
            .unwrap(),
        1
    );
    assert!(db
        .list_known_domains()
        .await
        .unwrap()
        .contains(&"spam.example".to_string()));

    assert!(db.unblock_domain("spam.example").await.unwrap());
    assert!(!db.is_domain_blocked("spam.example").await.unwrap());
    assert!(!db.unblock_domain("spam.example").await.unwrap());
}

#[tokio::test]
async fn test_purge_remote_actor() {
    let (db, _temp_dir) = create_test_db().await;
    let actor = sample_actor("http://localhost:8001/ap/users/bob", "bob", "splitter-2");
    db.upsert_remote_actor(&actor).await.unwrap();
    db.ensure_ghost_user(&actor).await.unwrap();
    db.insert_remote_post(&actor.actor_uri, "x", "public", "http://localhost:8001/ap/users/bob/posts/1")
        .await
        .unwrap();
    db.upsert_follow(&actor.actor_uri, "did:web:splitter-1:alice", FollowStatus::Accepted, None)
        .await
        .unwrap();

    db.purge_remote_actor(&actor.actor_uri).await.unwrap();

    assert!(db.get_remote_actor(&actor.actor_uri).await.unwrap().is_none());
    assert!(db.get_user_by_did(&actor.actor_uri).await.unwrap().is_none());
    assert!(db
        .get_follower_inboxes("did:web:splitter-1:alice")
        .await
        .unwrap()
        .is_empty());
}
