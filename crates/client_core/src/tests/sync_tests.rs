use std::sync::Arc;

use chrono::Duration;
use shared::domain::{truncate_to_millis, Actor, ActorId, ConversationKey, MessageId};
use storage::Storage;

use super::*;
use crate::test_support::{direct_message, memory_cache, room_message, FailingCache};

fn synchronizer(cache: Arc<Storage>) -> MessageSynchronizer {
    MessageSynchronizer::new(cache, Duration::hours(3), 100)
}

fn general() -> ConversationKey {
    ConversationKey::room("general")
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

#[test]
fn view_orders_by_timestamp_then_id() {
    let mut view = ConversationView::default();
    let late = room_message("b", "general", "u1", "late", 10);
    let early = room_message("z", "general", "u1", "early", 60);
    let mut tie = room_message("a", "general", "u1", "tie", 0);
    tie.timestamp = late.timestamp;

    assert!(view.insert(late.clone()));
    assert!(view.insert(early));
    assert!(view.insert(tie));
    assert!(!view.insert(late));
    assert_eq!(ids(view.messages()), vec!["z", "a", "b"]);
}

#[tokio::test]
async fn duplicate_delivery_is_shown_once() {
    let cache = memory_cache().await;
    let mut sync = synchronizer(cache.clone());
    let message = room_message("m1", "general", "u2", "hey", 5);

    assert!(sync.on_message_received(&general(), message.clone()).await);
    for _ in 0..4 {
        assert!(!sync.on_message_received(&general(), message.clone()).await);
    }
    assert_eq!(sync.messages(&general()).len(), 1);
    assert_eq!(
        cache.query(&general(), Duration::hours(3), 100).await.expect("query").len(),
        1
    );
}

#[tokio::test]
async fn optimistic_send_then_echo() {
    let cache = memory_cache().await;
    let mut sync = synchronizer(cache.clone());
    let me = Actor::anonymous(ActorId::new("u1"), "Ana");

    let sent = sync
        .send(&general(), &me, None, "  hello  ", None)
        .await
        .expect("send");
    assert_eq!(sent.text, "hello");
    assert!(sync.is_pending(&sent.id));
    assert_eq!(sync.messages(&general()), vec![sent.clone()]);
    assert_eq!(
        cache.query(&general(), Duration::hours(3), 100).await.expect("query"),
        vec![sent.clone()]
    );

    assert!(!sync.on_message_received(&general(), sent.clone()).await);
    assert!(!sync.is_pending(&sent.id));
    assert_eq!(sync.messages(&general()).len(), 1);
}

#[tokio::test]
async fn blank_text_without_image_is_rejected() {
    let cache = memory_cache().await;
    let mut sync = synchronizer(cache);
    let me = Actor::anonymous(ActorId::new("u1"), "Ana");

    let err = sync.send(&general(), &me, None, "   ", None).await;
    assert!(matches!(err, Err(SyncError::Validation(_))));
    assert!(sync.messages(&general()).is_empty());

    let image_only = sync
        .send(&general(), &me, None, "", Some("uploads/cat.png".into()))
        .await
        .expect("image send");
    assert_eq!(image_only.image_ref.as_deref(), Some("uploads/cat.png"));
}

#[tokio::test]
async fn cache_failure_does_not_block_display() {
    let mut sync = MessageSynchronizer::new(Arc::new(FailingCache), Duration::hours(3), 100);
    let me = Actor::anonymous(ActorId::new("u1"), "Ana");

    let sent = sync
        .send(&general(), &me, None, "still here", None)
        .await
        .expect("send");
    assert_eq!(sync.messages(&general()), vec![sent]);

    let incoming = room_message("m2", "general", "u2", "me too", 0);
    assert!(sync.on_message_received(&general(), incoming).await);
    assert_eq!(sync.messages(&general()).len(), 2);
    assert!(sync.load(&ConversationKey::room("lobby")).await.is_empty());
}

#[tokio::test]
async fn delete_without_key_searches_every_view() {
    let cache = memory_cache().await;
    let mut sync = synchronizer(cache.clone());
    let dm = ConversationKey::direct("u2");
    sync.on_message_received(&general(), room_message("r1", "general", "u2", "a", 5))
        .await;
    sync.on_message_received(&dm, direct_message("d1", "u2", "u1", "b", 5))
        .await;

    assert_eq!(
        sync.on_message_deleted(&MessageId::new("d1"), None).await,
        Some(dm.clone())
    );
    assert!(sync.messages(&dm).is_empty());
    assert_eq!(sync.messages(&general()).len(), 1);

    assert_eq!(
        sync.on_message_deleted(&MessageId::new("r1"), Some(&general())).await,
        Some(general())
    );
    assert_eq!(sync.on_message_deleted(&MessageId::new("gone"), None).await, None);
    assert!(cache
        .query(&general(), Duration::hours(3), 100)
        .await
        .expect("query")
        .is_empty());
}

#[tokio::test]
async fn load_seeds_view_from_cache() {
    let cache = memory_cache().await;
    cache
        .save(&room_message("m1", "general", "u2", "cached", 30), true)
        .await
        .expect("seed");
    let mut sync = synchronizer(cache);

    assert!(!sync.is_loaded(&general()));
    let view = sync.load(&general()).await;
    assert_eq!(ids(&view), vec!["m1"]);
    assert!(sync.is_loaded(&general()));
}

#[tokio::test]
async fn reconcile_inserts_missing_and_drops_deleted() {
    let cache = memory_cache().await;
    for message in [
        room_message("old", "general", "u2", "before window", 600),
        room_message("kept", "general", "u2", "in both", 300),
        room_message("removed", "general", "u2", "deleted upstream", 200),
    ] {
        cache.save(&message, true).await.expect("seed");
    }
    let mut sync = synchronizer(cache.clone());
    sync.load(&general()).await;
    let me = Actor::anonymous(ActorId::new("u1"), "Ana");
    let pending = sync
        .send(&general(), &me, None, "not echoed yet", None)
        .await
        .expect("send");

    let history = vec![
        room_message("kept", "general", "u2", "in both", 300),
        room_message("fresh", "general", "u3", "only on server", 100),
    ];
    let report = sync.reconcile_history(&general(), history).await;

    assert_eq!(report, ReconcileReport { inserted: 1, removed: 1 });
    let view = sync.messages(&general());
    assert_eq!(
        ids(&view),
        vec!["old", "kept", "fresh", pending.id.as_str()]
    );
    let cached = cache
        .query(&general(), Duration::hours(3), 100)
        .await
        .expect("query");
    assert!(cached.iter().all(|m| m.id.as_str() != "removed"));
    assert!(cached.iter().any(|m| m.id.as_str() == "fresh"));
}

#[tokio::test]
async fn messages_arriving_during_history_fetch_are_kept() {
    let cache = memory_cache().await;
    let mut sync = synchronizer(cache.clone());
    let me = Actor::anonymous(ActorId::new("u1"), "Ana");
    sync.load(&general()).await;
    sync.begin_history_fetch(&general());

    // A broadcast that postdates the snapshot, one delivered late with an
    // older timestamp, and an own send already echoed back.
    sync.on_message_received(&general(), room_message("live", "general", "u2", "now", 5))
        .await;
    sync.on_message_received(&general(), room_message("late", "general", "u3", "slow", 45))
        .await;
    let mine = sync
        .send(&general(), &me, None, "mine", None)
        .await
        .expect("send");
    sync.on_message_received(&general(), mine.clone()).await;
    assert!(!sync.is_pending(&mine.id));

    let history = vec![
        room_message("h1", "general", "u2", "older", 60),
        room_message("h2", "general", "u2", "old", 30),
    ];
    let report = sync.reconcile_history(&general(), history).await;

    assert_eq!(report, ReconcileReport { inserted: 2, removed: 0 });
    let expected = vec!["h1", "late", "h2", "live", mine.id.as_str()];
    assert_eq!(ids(&sync.messages(&general())), expected);
    let cached = cache
        .query(&general(), Duration::hours(3), 100)
        .await
        .expect("query");
    assert_eq!(ids(&cached), expected);
}

#[tokio::test]
async fn messages_newer_than_history_are_kept_without_a_tracked_fetch() {
    let cache = memory_cache().await;
    let mut sync = synchronizer(cache);
    sync.on_message_received(&general(), room_message("live", "general", "u2", "now", 5))
        .await;

    let report = sync
        .reconcile_history(
            &general(),
            vec![room_message("h1", "general", "u2", "older", 60)],
        )
        .await;
    assert_eq!(report, ReconcileReport { inserted: 1, removed: 0 });
    assert_eq!(ids(&sync.messages(&general())), vec!["h1", "live"]);
}

#[tokio::test]
async fn view_matches_cache_row_for_row() {
    let cache = memory_cache().await;
    let mut sync = synchronizer(cache.clone());
    let me = Actor::anonymous(ActorId::new("u1"), "Ana");
    let base = truncate_to_millis(chrono::Utc::now() - Duration::seconds(10));

    // Same millisecond; only the sub-millisecond part would order "b" first.
    let mut b = room_message("b", "general", "u2", "first", 0);
    b.timestamp = base + Duration::microseconds(100);
    let mut a = room_message("a", "general", "u3", "second", 0);
    a.timestamp = base + Duration::microseconds(600);
    sync.on_message_received(&general(), b).await;
    sync.on_message_received(&general(), a).await;
    sync.send(&general(), &me, None, "hello", None)
        .await
        .expect("send");

    let cached = cache
        .query(&general(), Duration::hours(3), 100)
        .await
        .expect("query");
    assert_eq!(sync.messages(&general()), cached);
    assert_eq!(&ids(&cached)[..2], &["a", "b"]);
    assert!(cached.iter().all(|m| m.timestamp.timestamp_subsec_nanos() % 1_000_000 == 0));
}

#[tokio::test]
async fn empty_history_deletes_nothing() {
    let cache = memory_cache().await;
    let mut sync = synchronizer(cache);
    sync.on_message_received(&general(), room_message("m1", "general", "u2", "a", 5))
        .await;

    let report = sync.reconcile_history(&general(), Vec::new()).await;
    assert!(!report.changed());
    assert_eq!(sync.messages(&general()).len(), 1);
}

#[tokio::test]
async fn sweep_drops_expired_messages_everywhere() {
    let cache = memory_cache().await;
    let mut sync = MessageSynchronizer::new(cache.clone(), Duration::minutes(5), 100);
    sync.on_message_received(&general(), room_message("fresh", "general", "u2", "a", 60))
        .await;
    sync.on_message_received(&general(), room_message("stale", "general", "u2", "b", 600))
        .await;

    let report = sync.sweep().await;
    assert_eq!(report.purged, 1);
    assert_eq!(report.changed, vec![general()]);
    assert_eq!(ids(&sync.messages(&general())), vec!["fresh"]);
}

#[tokio::test]
async fn hide_removes_view_and_cached_rows() {
    let cache = memory_cache().await;
    let mut sync = synchronizer(cache.clone());
    let dm = ConversationKey::direct("u2");
    sync.on_message_received(&dm, direct_message("d1", "u2", "u1", "psst", 5))
        .await;

    sync.hide(&dm).await;
    assert!(sync.view(&dm).is_none());
    assert!(cache
        .query(&dm, Duration::hours(3), 100)
        .await
        .expect("query")
        .is_empty());
}

#[tokio::test]
async fn restore_direct_groups_by_peer() {
    let cache = memory_cache().await;
    cache
        .save(&direct_message("d1", "u1", "u2", "hi bo", 50), false)
        .await
        .expect("seed");
    cache
        .save(&direct_message("d2", "u2", "u1", "hi ana", 40), false)
        .await
        .expect("seed");
    cache
        .save(&direct_message("d3", "u1", "u3", "hi cy", 30), false)
        .await
        .expect("seed");
    let mut sync = synchronizer(cache);

    let peers = sync.restore_direct(&ActorId::new("u1")).await;
    let peer_ids: Vec<_> = peers.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(peer_ids, vec!["u2", "u3"]);
    assert_eq!(
        peers[0].1.as_ref().map(|s| s.display_name.as_str()),
        Some("u2")
    );
    assert!(peers[1].1.is_none());
    assert_eq!(sync.messages(&ConversationKey::direct("u2")).len(), 2);
}
