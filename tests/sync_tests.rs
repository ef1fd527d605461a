// Conversation synchronizer behavior against an in-memory backend. Gateway
// events are fed straight into `handle_event`, the way the event loop would.

mod common;
use common::*;

use std::time::Duration;

use portal_chat::transport::events::{
    BusEvent, ConnectionEvent, InboundEvent, ReadReceiptEvent, TypingEvent,
};
use portal_chat::{ChatError, ConnectionState, Conversation, ConversationRef, ErrorKind, MessageStatus};

fn texts(snapshot: &portal_chat::ChatSnapshot) -> Vec<String> {
    snapshot.messages.iter().map(|m| m.text.clone()).collect()
}

async fn open_chat_with(sync: &portal_chat::ChatSynchronizer, participant: &str) {
    sync.select_conversation(ConversationRef::with_participant(participant))
        .await
        .unwrap();
}

//------------------------------------------------------------------------------
// Inbound delivery
//------------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_delivery_renders_once() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    let c = conv(ME, ORG);
    let event = message_event(Some("m-1"), Some(&c), ORG, ME, "Hello", at(10));
    sync.handle_event(inbound(event.clone())).await;
    sync.handle_event(inbound(event)).await;

    let snapshot = sync.snapshot();
    assert_eq!(texts(&snapshot), vec!["Hello"]);
}

#[tokio::test]
async fn test_identical_texts_with_distinct_ids_both_render() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    let c = conv(ME, ORG);
    sync.handle_event(inbound(message_event(Some("m-1"), Some(&c), ORG, ME, "ok", at(10))))
        .await;
    sync.handle_event(inbound(message_event(Some("m-2"), Some(&c), ORG, ME, "ok", at(11))))
        .await;

    assert_eq!(sync.snapshot().messages.len(), 2);
}

#[tokio::test]
async fn test_messages_are_ordered_by_timestamp() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    let c = conv(ME, ORG);
    for (id, seconds) in [("m-3", 30), ("m-1", 10), ("m-2", 20)] {
        let text = format!("at {}", seconds);
        sync.handle_event(inbound(message_event(Some(id), Some(&c), ORG, ME, &text, at(seconds))))
            .await;
    }

    assert_eq!(texts(&sync.snapshot()), vec!["at 10", "at 20", "at 30"]);
}

#[tokio::test]
async fn test_conversation_id_variants_reach_the_open_chat() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    // canonical id is conv_org7_seeker42
    sync.handle_event(inbound(message_event(
        Some("m-1"),
        Some("Conv_Org7_Seeker42"),
        ORG,
        ME,
        "upper case",
        at(1),
    )))
    .await;
    sync.handle_event(inbound(message_event(
        Some("m-2"),
        Some("conv_seeker42_org7"),
        ORG,
        ME,
        "swapped",
        at(2),
    )))
    .await;
    sync.handle_event(inbound(message_event(Some("m-3"), None, ORG, ME, "no id", at(3))))
        .await;

    // a different pair only touches its own summary
    let elsewhere = conv(ME, OTHER_ORG);
    sync.handle_event(inbound(message_event(
        Some("m-4"),
        Some(&elsewhere),
        OTHER_ORG,
        ME,
        "elsewhere",
        at(4),
    )))
    .await;

    let snapshot = sync.snapshot();
    assert_eq!(texts(&snapshot), vec!["upper case", "swapped", "no id"]);
    let other = snapshot
        .conversations
        .iter()
        .find(|c| c.other_participant_id == OTHER_ORG)
        .expect("summary entry for the other conversation");
    assert_eq!(other.last_message_text.as_deref(), Some("elsewhere"));
}

#[tokio::test]
async fn test_blocked_sender_is_discarded_and_unread_unchanged() {
    let api = MockChatApi::new();
    api.set_blocked(OTHER_ORG);
    api.add_conversation(Conversation::new_local(ME, OTHER_ORG, Some("Globex")));
    let sync = synchronizer(api.clone());
    sync.initialize().await.unwrap();
    open_chat_with(&sync, ORG).await;

    let blocked_conv = conv(ME, OTHER_ORG);
    sync.handle_event(inbound(message_event(
        Some("m-1"),
        Some(&blocked_conv),
        OTHER_ORG,
        ME,
        "let me in",
        at(5),
    )))
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = sync.snapshot();
    assert!(snapshot.messages.is_empty());
    let globex = snapshot
        .conversations
        .iter()
        .find(|c| c.other_participant_id == OTHER_ORG)
        .unwrap();
    assert!(globex.is_blocked);
    assert_eq!(globex.unread_count, 0);
    assert_eq!(globex.last_message_text, None);
}

#[tokio::test]
async fn test_message_in_open_chat_is_marked_read() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;
    let c = conv(ME, ORG);
    assert_eq!(api.count(|call| *call == Call::MarkRead(c.clone())), 1);

    sync.handle_event(inbound(message_event(Some("m-1"), Some(&c), ORG, ME, "ping", at(1))))
        .await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while api.count(|call| *call == Call::MarkRead(c.clone())) < 2 {
        assert!(tokio::time::Instant::now() < deadline, "mark-read never repeated");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_unread_refresh_is_debounced_and_backend_sourced() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    sync.initialize().await.unwrap();
    open_chat_with(&sync, ORG).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let elsewhere = conv(ME, OTHER_ORG);
    api.set_unread(&elsewhere, 5);
    let before = api.count(|c| *c == Call::UnreadCounts);

    for i in 0..5 {
        let id = format!("m-{}", i);
        sync.handle_event(inbound(message_event(
            Some(&id),
            Some(&elsewhere),
            OTHER_ORG,
            ME,
            "burst",
            at(i),
        )))
        .await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(api.count(|c| *c == Call::UnreadCounts) - before, 1);
    let snapshot = sync.snapshot();
    let other = snapshot
        .conversations
        .iter()
        .find(|c| c.other_participant_id == OTHER_ORG)
        .unwrap();
    assert_eq!(other.unread_count, 5);
}

#[tokio::test]
async fn test_remote_edit_and_read_receipt() {
    let api = MockChatApi::new();
    let c = conv(ME, ORG);
    api.set_history(
        &c,
        vec![
            stored("srv-1", &c, ME, ORG, "first", at(1)),
            stored("srv-2", &c, ORG, ME, "reply", at(2)),
        ],
    );
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    sync.handle_event(BusEvent::Inbound(InboundEvent::Edited(
        portal_chat::transport::events::EditEvent {
            message_id: "srv-2".to_string(),
            conversation_id: Some(c.clone()),
            text: "reply (fixed)".to_string(),
        },
    )))
    .await;
    sync.handle_event(BusEvent::Inbound(InboundEvent::ReadReceipt(ReadReceiptEvent {
        conversation_id: Some(c.clone()),
        reader_id: Some(ORG.to_string()),
        message_ids: Vec::new(),
    })))
    .await;

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.messages[0].status, MessageStatus::Read);
    assert_eq!(snapshot.messages[1].text, "reply (fixed)");
    assert!(snapshot.messages[1].is_edited);
}

#[tokio::test]
async fn test_typing_indicator_expires() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    sync.handle_event(BusEvent::Inbound(InboundEvent::Typing(TypingEvent {
        conversation_id: Some(conv(ME, ORG)),
        user_id: ORG.to_string(),
        receiver_id: Some(ME.to_string()),
        is_typing: true,
    })))
    .await;
    assert_eq!(sync.snapshot().typing_users, vec![ORG.to_string()]);

    wait_for_snapshot(&sync, |s| s.typing_users.is_empty()).await;
}

#[tokio::test]
async fn test_message_after_typing_clears_the_indicator() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    sync.spawn_event_loop().await;
    open_chat_with(&sync, ORG).await;

    let c = conv(ME, ORG);
    let bus = sync.transport().events();
    bus.publish(InboundEvent::Typing(TypingEvent {
        conversation_id: Some(c.clone()),
        user_id: ORG.to_string(),
        receiver_id: Some(ME.to_string()),
        is_typing: true,
    }));
    bus.publish(InboundEvent::Message(message_event(Some("m-1"), Some(&c), ORG, ME, "hi", at(10))));

    // the event loop handles them in arrival order
    let snapshot = wait_for_snapshot(&sync, |s| !s.messages.is_empty()).await;
    assert_eq!(texts(&snapshot), vec!["hi"]);
    assert!(snapshot.typing_users.is_empty(), "{:?}", snapshot.typing_users);
}

//------------------------------------------------------------------------------
// Sending
//------------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_message_is_rejected_without_backend_calls() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());

    assert!(matches!(sync.send("hello").await, Err(ChatError::NoConversation)));

    open_chat_with(&sync, ORG).await;
    let err = sync.send("   \n ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_eq!(api.count(|c| matches!(c, Call::SendMessage(_))), 0);
    let snapshot = sync.snapshot();
    assert!(snapshot.messages.is_empty());
    assert_eq!(snapshot.error, None);
}

#[tokio::test]
async fn test_echo_before_confirmation_converges() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;
    let c = conv(ME, ORG);

    let gate = api.gate_sends();
    let sending = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.send("Thanks for the interview").await })
    };
    let snapshot = wait_for_snapshot(&sync, |s| {
        s.messages.len() == 1 && s.messages[0].status == MessageStatus::Sending
    })
    .await;
    assert!(snapshot.messages[0].is_optimistic());
    let sent_at = snapshot.messages[0].timestamp;

    // the gateway echo beats the REST response
    sync.handle_event(inbound(message_event(
        Some("srv-1"),
        Some(&c),
        ME,
        ORG,
        "Thanks for the interview",
        sent_at,
    )))
    .await;
    gate.notify_one();
    sending.await.unwrap().unwrap();

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].canonical_id(), "srv-1");
    assert_eq!(snapshot.messages[0].status, MessageStatus::Delivered);
}

#[tokio::test]
async fn test_confirmation_before_echo_converges() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;
    let c = conv(ME, ORG);

    sync.send("See you Monday").await.unwrap();
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].status, MessageStatus::Delivered);
    assert_eq!(snapshot.messages[0].canonical_id(), "srv-1");
    let stored_at = snapshot.messages[0].timestamp;

    sync.handle_event(inbound(message_event(
        Some("srv-1"),
        Some(&c),
        ME,
        ORG,
        "See you Monday",
        stored_at,
    )))
    .await;

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(
        snapshot.conversations[0].last_message_text.as_deref(),
        Some("See you Monday")
    );
}

#[tokio::test]
async fn test_failed_send_can_be_retried() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    api.fail_sends(true);
    let err = sync.send("Hi").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Request);

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].status, MessageStatus::Failed);
    assert!(snapshot.error.is_some());
    let temp_id = snapshot.messages[0].message_id.clone();

    api.fail_sends(false);
    sync.clear_error().await;
    sync.retry_send(&temp_id).await.unwrap();

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].status, MessageStatus::Delivered);
    assert_eq!(snapshot.error, None);
    assert_eq!(api.count(|c| matches!(c, Call::SendMessage(_))), 2);
}

#[tokio::test]
async fn test_unsent_message_is_deleted_locally() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    api.fail_sends(true);
    let _ = sync.send("typo").await;
    let temp_id = sync.snapshot().messages[0].message_id.clone();

    sync.delete_message(&temp_id).await.unwrap();
    assert!(sync.snapshot().messages.is_empty());
    assert_eq!(api.count(|c| matches!(c, Call::DeleteMessage { .. })), 0);
}

#[tokio::test]
async fn test_blocked_conversation_rejects_sends() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    sync.block(ORG).await.unwrap();
    assert_eq!(api.count(|c| *c == Call::BlockUser(ORG.to_string())), 1);
    assert!(matches!(sync.send("hello?").await, Err(ChatError::Blocked(_))));
    assert!(sync.snapshot().selected.unwrap().is_blocked);

    sync.unblock(ORG).await.unwrap();
    assert_eq!(api.count(|c| *c == Call::UnblockUser(ORG.to_string())), 1);
    assert!(!sync.snapshot().selected.unwrap().is_blocked);
}

//------------------------------------------------------------------------------
// Selection, history, delete and edit
//------------------------------------------------------------------------------

#[tokio::test]
async fn test_stale_history_never_overwrites_newer_selection() {
    let api = MockChatApi::new();
    let conv_a = conv(ME, ORG);
    let conv_b = conv(ME, OTHER_ORG);
    api.set_history(&conv_a, vec![stored("a-1", &conv_a, ORG, ME, "from A", at(1))]);
    api.set_history(&conv_b, vec![stored("b-1", &conv_b, OTHER_ORG, ME, "from B", at(2))]);
    let sync = synchronizer(api.clone());

    let gate = api.gate_history(&conv_a);
    let first = {
        let sync = sync.clone();
        tokio::spawn(async move {
            sync.select_conversation(ConversationRef::with_participant(ORG))
                .await
        })
    };
    let target = conv_a.clone();
    wait_for_call(&api, |c| {
        matches!(c, Call::FetchMessages { conversation_id, .. } if *conversation_id == target)
    })
    .await;

    open_chat_with(&sync, OTHER_ORG).await;
    gate.notify_one();
    first.await.unwrap().unwrap();

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.selected.as_ref().unwrap().other_participant_id, OTHER_ORG);
    assert_eq!(texts(&snapshot), vec!["from B"]);
    assert!(!snapshot.loading);
    assert_eq!(api.count(|c| *c == Call::MarkRead(conv_a.clone())), 0);
}

#[tokio::test]
async fn test_older_history_is_prepended() {
    let api = MockChatApi::new();
    let c = conv(ME, ORG);
    api.set_history(
        &c,
        vec![
            stored("m-10", &c, ORG, ME, "ten", at(10)),
            stored("m-11", &c, ME, ORG, "eleven", at(11)),
        ],
    );
    api.set_older_page(&c, "m-10", vec![stored("m-1", &c, ORG, ME, "one", at(1))]);
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;
    assert!(sync.snapshot().has_older);

    sync.load_older_messages().await.unwrap();

    let snapshot = sync.snapshot();
    assert_eq!(texts(&snapshot), vec!["one", "ten", "eleven"]);
    assert!(!snapshot.has_older);
    assert_eq!(
        api.count(|call| matches!(call, Call::FetchMessages { cursor: Some(cursor), .. } if cursor == "m-10")),
        1
    );
}

#[tokio::test]
async fn test_refetch_after_delete_keeps_older_pages() {
    let api = MockChatApi::new();
    let c = conv(ME, ORG);
    api.set_history(
        &c,
        vec![
            stored("m-10", &c, ORG, ME, "ten", at(10)),
            stored("m-11", &c, ME, ORG, "eleven", at(11)),
        ],
    );
    api.set_older_page(&c, "m-10", vec![stored("m-1", &c, ORG, ME, "one", at(1))]);
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;
    sync.load_older_messages().await.unwrap();
    assert_eq!(texts(&sync.snapshot()), vec!["one", "ten", "eleven"]);
    let fetches = api.count(|call| matches!(call, Call::FetchMessages { .. }));

    sync.delete_message("m-11").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while api.count(|call| matches!(call, Call::FetchMessages { .. })) == fetches {
        assert!(tokio::time::Instant::now() < deadline, "no refetch after delete");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let snapshot = sync.snapshot();
    assert_eq!(texts(&snapshot), vec!["one", "ten"]);
    assert!(!snapshot.has_older);
}

#[tokio::test]
async fn test_failed_delete_restores_message() {
    let api = MockChatApi::new();
    let c = conv(ME, ORG);
    api.set_history(&c, vec![stored("srv-9", &c, ME, ORG, "keep me", at(1))]);
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    api.fail_deletes(true);
    let err = sync.delete_message("srv-9").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Request);

    let snapshot = sync.snapshot();
    assert_eq!(texts(&snapshot), vec!["keep me"]);
    assert!(snapshot.error.is_some());
    assert_eq!(
        api.count(|call| matches!(call, Call::DeleteMessage { message_id, .. } if message_id == "srv-9")),
        1
    );
}

#[tokio::test]
async fn test_delete_removes_message_and_refetches() {
    let api = MockChatApi::new();
    let c = conv(ME, ORG);
    api.set_history(
        &c,
        vec![
            stored("srv-8", &c, ORG, ME, "hello", at(1)),
            stored("srv-9", &c, ME, ORG, "oops", at(2)),
        ],
    );
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;
    let fetches = api.count(|call| matches!(call, Call::FetchMessages { .. }));

    sync.delete_message("srv-9").await.unwrap();
    assert_eq!(texts(&sync.snapshot()), vec!["hello"]);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while api.count(|call| matches!(call, Call::FetchMessages { .. })) == fetches {
        assert!(tokio::time::Instant::now() < deadline, "no refetch after delete");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(texts(&sync.snapshot()), vec!["hello"]);
}

#[tokio::test]
async fn test_edit_own_message() {
    let api = MockChatApi::new();
    let c = conv(ME, ORG);
    api.set_history(
        &c,
        vec![
            stored("srv-1", &c, ORG, ME, "theirs", at(1)),
            stored("srv-2", &c, ME, ORG, "mine", at(2)),
        ],
    );
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    sync.edit_message("srv-2", "mine, revised").await.unwrap();
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.messages[1].text, "mine, revised");
    assert!(snapshot.messages[1].is_edited);
    assert_eq!(
        api.count(|call| matches!(call, Call::EditMessage { text, .. } if text == "mine, revised")),
        1
    );

    let err = sync.edit_message("srv-1", "not yours").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(api.count(|call| matches!(call, Call::EditMessage { .. })), 1);
}

#[tokio::test]
async fn test_failed_edit_reverts() {
    let api = MockChatApi::new();
    let c = conv(ME, ORG);
    api.set_history(&c, vec![stored("srv-2", &c, ME, ORG, "original", at(2))]);
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    api.fail_edits(true);
    assert!(sync.edit_message("srv-2", "changed").await.is_err());

    let snapshot = sync.snapshot();
    assert_eq!(texts(&snapshot), vec!["original"]);
    assert!(!snapshot.messages[0].is_edited);
    assert!(snapshot.error.is_some());
}

//------------------------------------------------------------------------------
// Session bootstrap and connection changes
//------------------------------------------------------------------------------

#[tokio::test]
async fn test_placeholder_names_are_resolved_once() {
    let api = MockChatApi::new();
    api.add_conversation(Conversation::new_local(ME, "org1", None));
    api.add_conversation(Conversation::new_local(ME, "org2", None));
    api.set_name("org1", "Acme Recruiting");
    api.set_name("org2", "Globex");
    let sync = synchronizer(api.clone());

    sync.initialize().await.unwrap();
    let mut names: Vec<String> = sync
        .snapshot()
        .conversations
        .iter()
        .map(|c| c.display_name.clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["Acme Recruiting", "Globex"]);

    sync.load_conversations().await.unwrap();
    assert_eq!(api.count(|c| *c == Call::LookupName("org1".to_string())), 1);
    assert_eq!(api.count(|c| *c == Call::LookupName("org2".to_string())), 1);
}

#[tokio::test]
async fn test_reconnect_triggers_catch_up() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());

    sync.handle_event(BusEvent::Connection(ConnectionEvent::Connected)).await;
    assert_eq!(sync.snapshot().connection, ConnectionState::Open);
    open_chat_with(&sync, ORG).await;
    let lists = api.count(|c| *c == Call::ListConversations);
    let fetches = api.count(|c| matches!(c, Call::FetchMessages { .. }));

    sync.handle_event(BusEvent::Connection(ConnectionEvent::Disconnected { clean: false }))
        .await;
    assert_eq!(sync.snapshot().connection, ConnectionState::Error);
    assert!(!sync.snapshot().can_compose());

    sync.handle_event(BusEvent::Connection(ConnectionEvent::Connected)).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while api.count(|c| *c == Call::ListConversations) == lists
        || api.count(|c| matches!(c, Call::FetchMessages { .. })) == fetches
    {
        assert!(tokio::time::Instant::now() < deadline, "no catch-up after reconnect");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_exhausted_reconnects_surface_an_error() {
    let api = MockChatApi::new();
    let sync = synchronizer(api.clone());
    open_chat_with(&sync, ORG).await;

    sync.handle_event(BusEvent::Connection(ConnectionEvent::ReconnectFailed { attempts: 5 }))
        .await;

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.connection, ConnectionState::Failed);
    assert!(snapshot.error.as_deref().unwrap_or_default().contains("5"));
    assert!(!snapshot.can_compose());
}
