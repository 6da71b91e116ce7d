//! Broadcast, private routing, presence and logout against a live server

mod common;

use std::sync::Arc;

use common::{eventually, next_line, start_server, stays_silent, WAIT};
use securechat_core::{ChatMessage, ClientId, Recipient};
use securechat_server::HandlerId;
use tokio::time::timeout;

#[tokio::test]
async fn test_broadcast_reaches_everyone_including_sender() {
    let mut server = start_server(4).await;
    let mut alice = server.login("alice").await;
    let mut bob = server.login("bob").await;
    let mut carol = server.login("carol").await;

    alice.send_chat("hi all").await.unwrap();

    for client in [&mut alice, &mut bob, &mut carol] {
        assert_eq!(next_line(client).await, "alice: hi all");
    }
    assert_eq!(server.chat_lines(), vec!["alice: hi all".to_string()]);

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_survives_a_vanished_recipient() {
    let mut server = start_server(4).await;
    let mut alice = server.login("alice").await;
    let mut bob = server.login("bob").await;
    let dave = server.login("dave").await;
    drop(dave);

    alice.send_chat("still here?").await.unwrap();
    assert_eq!(next_line(&mut alice).await, "alice: still here?");
    assert_eq!(next_line(&mut bob).await, "alice: still here?");

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_private_message_by_port_reaches_only_target() {
    let mut server = start_server(4).await;
    let mut alice = server.login("alice").await;
    let mut bob = server.login("bob").await;
    let mut carol = server.login("carol").await;

    // The server sees bob's local port as the remote port of his connection
    let bob_port = bob.local_addr().port();
    alice
        .send_private(Recipient::Port(bob_port), "Hello")
        .await
        .unwrap();

    assert_eq!(next_line(&mut bob).await, "Hello");
    assert!(stays_silent(&mut carol).await);
    assert!(stays_silent(&mut alice).await);
    assert_eq!(server.handle.engine().stats().private_delivered, 1);

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_private_message_by_name_and_unknown_target() {
    let mut server = start_server(3).await;
    let mut alice = server.login("alice").await;
    let mut bob = server.login("bob").await;
    let engine = Arc::clone(server.handle.engine());

    alice
        .send_private(Recipient::Client("nobody".into()), "lost")
        .await
        .unwrap();
    eventually(|| engine.stats().private_dropped == 1).await;

    alice
        .send_private(Recipient::Client("bob".into()), "psst, a,b")
        .await
        .unwrap();
    assert_eq!(next_line(&mut bob).await, "psst, a,b");

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_who_is_in_lists_connected_clients() {
    let mut server = start_server(3).await;
    let mut alice = server.login("alice").await;
    let _bob = server.login("bob").await;

    alice.who_is_in().await.unwrap();
    let mut lines = vec![next_line(&mut alice).await, next_line(&mut alice).await];
    lines.sort();
    assert!(lines.iter().any(|line| line.contains(" alice remote=")));
    assert!(lines.iter().any(|line| line.contains(" bob remote=")));

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logout_returns_handler_to_pool() {
    let mut server = start_server(2).await;
    let engine = Arc::clone(server.handle.engine());
    let mut alice = server.login("alice").await;
    let alice_id = ClientId::from("alice");

    alice.logout().await.unwrap();
    eventually(|| !engine.registry().contains(&alice_id)).await;
    eventually(|| engine.pool_counts().idle == 2).await;
    assert_eq!(engine.stats().sessions_closed, 1);

    // Stale releases and removals are no-ops
    for n in 0..2 {
        let id = HandlerId::new(format!("handler-{}", n));
        assert!(!engine.release(&id));
        assert!(!engine.remove_occupancy(&id));
    }
    assert_eq!(engine.pool_counts().total(), 2);

    // The released handler serves again
    let mut bob = server.login("bob").await;
    let mut again = server.login("alice").await;
    bob.send_chat("welcome back").await.unwrap();
    assert_eq!(next_line(&mut again).await, "bob: welcome back");

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_messages_do_not_end_session() {
    let mut server = start_server(2).await;
    let mut alice = server.login("alice").await;

    // Undecryptable chat text, a private payload with an empty target, an unknown tag
    alice
        .send(&ChatMessage::Message("not base64".into()))
        .await
        .unwrap();
    alice
        .send(&ChatMessage::PrivateMessage {
            target: Recipient::Client(String::new()),
            ciphertext: "anything".into(),
        })
        .await
        .unwrap();
    alice.send(&ChatMessage::Unknown(42)).await.unwrap();
    alice.send_chat("still talking").await.unwrap();

    assert_eq!(next_line(&mut alice).await, "alice: still talking");
    assert!(server
        .handle
        .engine()
        .registry()
        .contains(&ClientId::from("alice")));

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeat_login_supersedes_earlier_session() {
    let mut server = start_server(3).await;
    let mut first = server.login("alice").await;
    let engine = Arc::clone(server.handle.engine());
    let first_key = engine
        .registry()
        .get(&ClientId::from("alice"))
        .unwrap()
        .session_id;

    let mut second = server.connect("alice").await.unwrap();
    eventually(|| {
        engine
            .registry()
            .get(&ClientId::from("alice"))
            .map_or(false, |entry| entry.session_id != first_key)
    })
    .await;
    assert_eq!(engine.registry().len(), 1);

    let mut bob = server.login("bob").await;
    bob.send_chat("hello alice").await.unwrap();
    assert_eq!(next_line(&mut second).await, "bob: hello alice");
    assert_eq!(next_line(&mut bob).await, "bob: hello alice");

    // The earlier connection is closed and its handler back in the pool
    let closed = timeout(WAIT, first.receive()).await.expect("Earlier session left open");
    assert!(closed.unwrap_err().is_transport());
    eventually(|| engine.occupied_count() == 2).await;

    server.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_private_by_name_reaches_latest_login() {
    let mut server = start_server(3).await;
    let engine = Arc::clone(server.handle.engine());
    let mut bob = server.login("bob").await;
    let _earliest = server.login("alice").await;

    for round in 0..3 {
        let previous = engine
            .registry()
            .get(&ClientId::from("alice"))
            .unwrap()
            .session_id;
        let mut alice = server.connect("alice").await.unwrap();
        eventually(|| {
            engine
                .registry()
                .get(&ClientId::from("alice"))
                .map_or(false, |entry| entry.session_id != previous)
        })
        .await;
        // Only bob and the newest alice hold handlers
        eventually(|| engine.occupied_count() == 2).await;

        let text = format!("ping {}", round);
        bob.send_private(Recipient::Client("alice".into()), &text)
            .await
            .unwrap();
        assert_eq!(next_line(&mut alice).await, text);
    }
    assert_eq!(engine.stats().private_dropped, 0);

    bob.who_is_in().await.unwrap();
    let listing = [next_line(&mut bob).await, next_line(&mut bob).await];
    assert_eq!(listing.iter().filter(|line| line.contains("alice")).count(), 1);
    assert!(stays_silent(&mut bob).await);

    server.handle.shutdown().await.unwrap();
}
