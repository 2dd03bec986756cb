//! End-to-end scenarios: REST-side services and realtime gateway clients
//! running against one in-memory backend.

use std::{sync::Arc, time::Duration};

use tokio::sync::broadcast;
use tokio_test::assert_ok;
use uuid::Uuid;

use rider_chat_backend::{
    config::Config,
    error::AppError,
    models::{PageRequest, Role},
    realtime::{
        ConnectionState, GatewayClient, GatewayEvent, GatewayHandle, LocalTransport, RoomHub,
        ServerEvent,
    },
    storage::memory::MemoryChatStore,
    AppState,
};

async fn backend() -> AppState {
    let state = AppState::new(
        Arc::new(MemoryChatStore::new()),
        Arc::new(RoomHub::new(None)),
        Config::default(),
    );
    assert_ok!(state.groups.ensure_bootstrapped().await);
    state
}

fn gateway(state: &AppState) -> GatewayHandle {
    let transport = Arc::new(LocalTransport::new(state.session()));
    GatewayClient::spawn(transport, state.config.realtime.clone())
}

async fn next_matching(
    events: &mut broadcast::Receiver<GatewayEvent>,
    predicate: impl Fn(&GatewayEvent) -> bool,
) -> GatewayEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("gateway stopped");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for gateway event")
}

async fn online(state: &AppState, user_id: Uuid, role: Role) -> (GatewayHandle, broadcast::Receiver<GatewayEvent>) {
    let handle = gateway(state);
    let mut events = handle.subscribe();
    let token = state.auth.issue_access_token(user_id, role).unwrap();
    handle.connect(token).unwrap();
    next_matching(&mut events, |e| {
        *e == GatewayEvent::StateChanged(ConnectionState::Authenticated)
    })
    .await;
    (handle, events)
}

#[tokio::test]
async fn rider_asks_police_for_help() {
    let state = backend().await;
    let (rider, police) = (Uuid::new_v4(), Uuid::new_v4());

    let conversation = state
        .chat
        .create_conversation(rider, "direct", None, vec![police], None)
        .await
        .unwrap();
    let conversation_id = conversation.conversation.id;

    let (police_gateway, mut police_events) = online(&state, police, Role::Police).await;
    police_gateway.join(conversation_id).await.unwrap();
    next_matching(&mut police_events, |e| {
        matches!(e, GatewayEvent::Server(ServerEvent::ConversationJoined(_)))
    })
    .await;

    let sent = state
        .chat
        .send_message(conversation_id, rider, "need help".to_string(), None, None)
        .await
        .unwrap();

    match next_matching(&mut police_events, |e| {
        matches!(e, GatewayEvent::Server(ServerEvent::MessageNew(_)))
    })
    .await
    {
        GatewayEvent::Server(ServerEvent::MessageNew(message)) => {
            assert_eq!(message.id, sent.id);
            assert_eq!(message.conversation_id, conversation_id);
            assert_eq!(message.content, "need help");
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(
        state
            .unread
            .for_conversation(conversation_id, police)
            .await
            .unwrap(),
        1
    );

    police_gateway.mark_read(conversation_id).await.unwrap();
    next_matching(&mut police_events, |e| {
        matches!(e, GatewayEvent::Server(ServerEvent::MessageRead(r)) if r.user_id == police)
    })
    .await;

    for user in [rider, police] {
        assert_eq!(
            state
                .unread
                .for_conversation(conversation_id, user)
                .await
                .unwrap(),
            0
        );
    }
}

#[tokio::test]
async fn sender_sees_its_own_message_once() {
    let state = backend().await;
    let (rider, volunteer) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation_id = state
        .chat
        .create_conversation(rider, "group", Some("Convoy".to_string()), vec![volunteer], None)
        .await
        .unwrap()
        .conversation
        .id;

    let (rider_gateway, mut rider_events) = online(&state, rider, Role::Rider).await;
    rider_gateway.join(conversation_id).await.unwrap();
    rider_gateway
        .send_message(conversation_id, "leaving now", None, None)
        .await
        .unwrap();
    next_matching(&mut rider_events, |e| {
        matches!(e, GatewayEvent::Server(ServerEvent::MessageNew(_)))
    })
    .await;

    // Same message through REST: the app registers it and the echo is dropped.
    let sent = state
        .chat
        .send_message(conversation_id, rider, "arrived".to_string(), None, None)
        .await
        .unwrap();
    rider_gateway.mark_seen(sent.id).unwrap();
    rider_gateway.start_typing(conversation_id).await.unwrap();
    rider_gateway.mark_read(conversation_id).await.unwrap();

    let mut echoes = 0;
    loop {
        match next_matching(&mut rider_events, |_| true).await {
            GatewayEvent::Server(ServerEvent::MessageNew(m)) if m.id == sent.id => echoes += 1,
            GatewayEvent::Server(ServerEvent::MessageRead(_)) => break,
            _ => {}
        }
    }
    // The fan-out may land before mark_seen is processed; never twice.
    assert!(echoes <= 1);
}

#[tokio::test]
async fn police_group_membership_follows_role_level() {
    let state = backend().await;
    let police_group = state
        .groups
        .list_accessible(Uuid::new_v4(), Role::Police)
        .await
        .unwrap()
        .into_iter()
        .find(|g| g.conversation.minimum_role == Some(Role::Police))
        .unwrap();
    let before = police_group.participant_count;

    let err = state
        .groups
        .join(police_group.conversation.id, Uuid::new_v4(), Role::Volunteer)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InsufficientRole));
    assert_eq!(err.code(), "INSUFFICIENT_ROLE");

    let commander = Uuid::new_v4();
    assert_ok!(
        state
            .groups
            .join(police_group.conversation.id, commander, Role::Commander)
            .await
    );

    let after = state
        .groups
        .list_accessible(commander, Role::Commander)
        .await
        .unwrap()
        .into_iter()
        .find(|g| g.conversation.id == police_group.conversation.id)
        .unwrap();
    assert_eq!(after.participant_count, before + 1);
    assert!(after.is_joined);
}

#[tokio::test]
async fn invalid_credential_never_flushes_the_queue() {
    let state = backend().await;
    let owner = Uuid::new_v4();
    let conversation_id = state
        .chat
        .create_conversation(owner, "group", None, vec![Uuid::new_v4()], None)
        .await
        .unwrap()
        .conversation
        .id;

    let handle = gateway(&state);
    let mut events = handle.subscribe();
    handle.join(conversation_id).await.unwrap();
    handle
        .send_message(conversation_id, "should never arrive", None, None)
        .await
        .unwrap();
    handle.connect("not-a-jwt").unwrap();

    match next_matching(&mut events, |e| {
        matches!(e, GatewayEvent::Server(ServerEvent::AuthError(_)))
    })
    .await
    {
        GatewayEvent::Server(ServerEvent::AuthError(payload)) => {
            assert_eq!(payload.code, "INVALID_TOKEN")
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(handle.state(), ConnectionState::Error);

    let history = state
        .chat
        .list_messages(conversation_id, owner, PageRequest { page: 1, limit: 20 }, None, None)
        .await
        .unwrap();
    assert_eq!(history.pagination.total, 0);
}

#[tokio::test]
async fn auto_join_is_idempotent() {
    let state = backend().await;
    let user = Uuid::new_v4();

    assert_eq!(state.groups.auto_join_all(user, Role::Admin).await.unwrap(), 5);
    assert_eq!(state.groups.auto_join_all(user, Role::Admin).await.unwrap(), 0);

    let groups = state.groups.list_accessible(user, Role::Admin).await.unwrap();
    assert_eq!(groups.len(), 5);
    assert!(groups.iter().all(|g| g.is_joined && g.participant_count == 1));
}

#[tokio::test]
async fn leaving_stops_room_delivery() {
    let state = backend().await;
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation_id = state
        .chat
        .create_conversation(a, "group", None, vec![b], None)
        .await
        .unwrap()
        .conversation
        .id;

    let (b_gateway, mut b_events) = online(&state, b, Role::Volunteer).await;
    b_gateway.join(conversation_id).await.unwrap();
    next_matching(&mut b_events, |e| {
        matches!(e, GatewayEvent::Server(ServerEvent::ConversationJoined(_)))
    })
    .await;

    state.chat.leave_conversation(conversation_id, b).await.unwrap();
    next_matching(&mut b_events, |e| {
        matches!(e, GatewayEvent::Server(ServerEvent::ConversationLeft(_)))
    })
    .await;
    assert_eq!(state.chat.hub().room_size(conversation_id).await, 0);

    // Rejoining over the socket is refused now.
    b_gateway.join(conversation_id).await.unwrap();
    match next_matching(&mut b_events, |e| matches!(e, GatewayEvent::Server(ServerEvent::Error(_)))).await {
        GatewayEvent::Server(ServerEvent::Error(payload)) => assert_eq!(payload.code, "ACCESS_DENIED"),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(b_gateway.state(), ConnectionState::Authenticated);
}
