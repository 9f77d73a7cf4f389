mod common;

use common::Harness;
use realtime_messaging_service::models::PresenceStatus;
use realtime_messaging_service::store::ChatStore;
use realtime_messaging_service::websocket::events::ClientEvent;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[tokio::test]
async fn test_presence_follows_connections() {
    let h = Harness::new();
    let alice = h.store.add_user("alice").await;
    let bob = h.store.add_user("bob").await;
    h.store.find_or_create_direct(alice.id, bob.id).await.unwrap();

    let mut alice_client = h.connect(&alice).await;
    let phone = h.connect(&bob).await;
    let online = alice_client.expect("presence:update").await;
    assert_eq!(online["user_id"], bob.id.to_string());
    assert_eq!(online["status"], "online");

    let laptop = h.connect(&bob).await;
    alice_client.assert_no("presence:update").await;

    phone.send(ClientEvent::PresenceSet {
        status: PresenceStatus::Away,
    });
    let away = alice_client.expect("presence:update").await;
    assert_eq!(away["status"], "away");

    // one device left: still connected
    drop(phone);
    alice_client.assert_no("presence:update").await;
    assert!(h.gateway.presence().is_online(bob.id));

    drop(laptop);
    let offline = alice_client.expect("presence:update").await;
    assert_eq!(offline["user_id"], bob.id.to_string());
    assert_eq!(offline["status"], "offline");
    assert!(!h.gateway.presence().is_online(bob.id));
}

#[tokio::test(start_paused = true)]
async fn test_typing_expires_without_renewal() {
    let h = Harness::new();
    let alice = h.store.add_user("alice").await;
    let bob = h.store.add_user("bob").await;
    let conv = h.store.find_or_create_direct(alice.id, bob.id).await.unwrap();

    let mut alice_client = h.connect(&alice).await;
    let bob_client = h.connect(&bob).await;

    let started = Instant::now();
    bob_client.send(ClientEvent::TypingStart {
        conversation_id: conv.id,
    });
    let typing = alice_client.expect("typing:start").await;
    assert_eq!(typing["user_id"], bob.id.to_string());
    assert_eq!(typing["display_name"], "bob");

    let stop = alice_client
        .expect_within("typing:stop", Duration::from_secs(10))
        .await;
    assert_eq!(stop["user_id"], bob.id.to_string());
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(h.gateway.typing().typing_users(conv.id).await.is_empty());
}

#[tokio::test]
async fn test_sending_clears_typing() {
    let h = Harness::new();
    let alice = h.store.add_user("alice").await;
    let bob = h.store.add_user("bob").await;
    let conv = h.store.find_or_create_direct(alice.id, bob.id).await.unwrap();

    let mut alice_client = h.connect(&alice).await;
    let bob_client = h.connect(&bob).await;

    bob_client.send(ClientEvent::TypingStart {
        conversation_id: conv.id,
    });
    alice_client.expect("typing:start").await;

    bob_client.send_text(conv.id, "done typing", None);
    alice_client.expect("typing:stop").await;
    alice_client.expect("message:received").await;
    assert!(h.gateway.typing().typing_users(conv.id).await.is_empty());
}

#[tokio::test]
async fn test_disconnect_clears_typing() {
    let h = Harness::new();
    let alice = h.store.add_user("alice").await;
    let bob = h.store.add_user("bob").await;
    let conv = h.store.find_or_create_direct(alice.id, bob.id).await.unwrap();

    let mut alice_client = h.connect(&alice).await;
    let bob_client = h.connect(&bob).await;

    bob_client.send(ClientEvent::TypingStart {
        conversation_id: conv.id,
    });
    alice_client.expect("typing:start").await;

    drop(bob_client);
    alice_client.expect("typing:stop").await;
    assert_eq!(h.gateway.typing().tracked_conversations().await, 0);
}

#[tokio::test]
async fn test_typing_reaches_participant_outside_room() {
    let h = Harness::new();
    let alice = h.store.add_user("alice").await;
    let bob = h.store.add_user("bob").await;

    // bob connects before the conversation exists, so he never auto-joins it
    let mut bob_client = h.connect(&bob).await;
    let mut alice_client = h.connect(&alice).await;

    alice_client.send(ClientEvent::OpenDirect { user_id: bob.id });
    let opened = alice_client.expect("conversation:opened").await;
    let conv_id: Uuid = serde_json::from_value(opened["conversation"]["id"].clone()).unwrap();

    alice_client.send(ClientEvent::TypingStart {
        conversation_id: conv_id,
    });
    let typing = bob_client.expect("typing:start").await;
    assert_eq!(typing["conversation_id"], conv_id.to_string());
    assert_eq!(typing["user_id"], alice.id.to_string());

    alice_client.send(ClientEvent::TypingStop {
        conversation_id: conv_id,
    });
    let stop = bob_client.expect("typing:stop").await;
    assert_eq!(stop["user_id"], alice.id.to_string());

    alice_client.send_text(conv_id, "hi bob", None);
    bob_client.expect("message:received").await;
}
