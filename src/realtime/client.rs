//! Client side of the realtime channel.
//!
//! [`GatewayClient::spawn`] starts one actor task that owns the connection
//! state machine; every transition happens inside that task. Callers talk
//! to it through a cloneable [`GatewayHandle`].

use std::{
    collections::{BTreeSet, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
};

use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::Instant,
};
use uuid::Uuid;

use super::{
    backoff::Backoff,
    dedup::SeenMessages,
    events::{AuthenticatePayload, ClientEvent, OutgoingMessage, RoomPayload, ServerEvent},
    transport::{Transport, TransportError, TransportLink},
    typing::TypingTracker,
};
use crate::config::RealtimeConfig;

const EVENT_CAPACITY: usize = 256;

/// Connection attempt in flight. Dropping it cancels the attempt.
type PendingOpen =
    Pin<Box<dyn Future<Output = Result<Box<dyn TransportLink>, TransportError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Error,
}

impl ConnectionState {
    /// Edges of the connection state machine. `Error` and `Disconnected`
    /// are reachable from anywhere.
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, to) {
            (_, Error) | (_, Disconnected) => true,
            (Disconnected | Error, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Authenticated) => true,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("an access token is required to connect")]
    MissingCredential,

    #[error("gateway task has stopped")]
    Closed,

    #[error("outbound queue is full ({0} events waiting for authentication)")]
    QueueFull(usize),
}

/// Notifications published to subscribers of a gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    StateChanged(ConnectionState),
    /// Server event, after `message:new` de-duplication.
    Server(ServerEvent),
    TypingExpired {
        conversation_id: Uuid,
        user_id: Uuid,
    },
    /// An automatic reconnection attempt is starting.
    ReconnectAttempt(u32),
    /// Authenticated again after this many attempts.
    Reconnect(u32),
    /// The attempt ceiling was exceeded; retrying stops until `reconnect()`.
    ReconnectFailed,
}

enum Command {
    Connect(String),
    Reconnect,
    Disconnect,
    Emit(ClientEvent, oneshot::Sender<Result<(), GatewayError>>),
    MarkSeen(Uuid),
    TypingIn(Uuid, oneshot::Sender<Vec<Uuid>>),
}

pub struct GatewayClient;

impl GatewayClient {
    /// Starts the connection actor. It stops when every handle is dropped.
    pub fn spawn(transport: Arc<dyn Transport>, config: RealtimeConfig) -> GatewayHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let gateway = Gateway {
            transport,
            backoff: Backoff::from_config(&config),
            seen: SeenMessages::new(config.seen_message_capacity),
            typing: TypingTracker::new(config.typing_timeout),
            config,
            state: ConnectionState::Disconnected,
            state_tx,
            events: events.clone(),
            token: None,
            link: None,
            pending_open: None,
            queue: VecDeque::new(),
            rooms: BTreeSet::new(),
            retry_at: None,
            auth_deadline: None,
            reconnecting: false,
        };
        tokio::spawn(gateway.run(command_rx));

        GatewayHandle {
            commands,
            state: state_rx,
            events,
        }
    }
}

#[derive(Clone)]
pub struct GatewayHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<GatewayEvent>,
}

impl GatewayHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Waits until the gateway settles in `target`. Only the latest state is
    /// observed, so short-lived states may be skipped.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), GatewayError> {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == target {
                return Ok(());
            }
            state.changed().await.map_err(|_| GatewayError::Closed)?;
        }
    }

    pub fn connect(&self, token: impl Into<String>) -> Result<(), GatewayError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(GatewayError::MissingCredential);
        }
        self.send(Command::Connect(token))
    }

    /// Reconnects with the last credential, including after the attempt
    /// ceiling was exceeded.
    pub fn reconnect(&self) -> Result<(), GatewayError> {
        self.send(Command::Reconnect)
    }

    /// Tears down the link and drops queued events and room subscriptions.
    pub fn disconnect(&self) -> Result<(), GatewayError> {
        self.send(Command::Disconnect)
    }

    /// Sends an application event now if authenticated, otherwise queues it.
    /// Fails with [`GatewayError::QueueFull`] when the queue is at capacity;
    /// events already accepted are never dropped to make room.
    pub async fn emit(&self, event: ClientEvent) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Emit(event, tx))?;
        rx.await.map_err(|_| GatewayError::Closed)?
    }

    pub async fn join(&self, conversation_id: Uuid) -> Result<(), GatewayError> {
        self.emit(ClientEvent::JoinConversation(RoomPayload { conversation_id }))
            .await
    }

    pub async fn leave(&self, conversation_id: Uuid) -> Result<(), GatewayError> {
        self.emit(ClientEvent::LeaveConversation(RoomPayload { conversation_id }))
            .await
    }

    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        content: impl Into<String>,
        message_type: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), GatewayError> {
        self.emit(ClientEvent::SendMessage(OutgoingMessage {
            conversation_id,
            content: content.into(),
            message_type,
            metadata,
        }))
        .await
    }

    pub async fn start_typing(&self, conversation_id: Uuid) -> Result<(), GatewayError> {
        self.emit(ClientEvent::TypingStart(RoomPayload { conversation_id }))
            .await
    }

    pub async fn stop_typing(&self, conversation_id: Uuid) -> Result<(), GatewayError> {
        self.emit(ClientEvent::TypingStop(RoomPayload { conversation_id }))
            .await
    }

    pub async fn mark_read(&self, conversation_id: Uuid) -> Result<(), GatewayError> {
        self.emit(ClientEvent::MarkRead(RoomPayload { conversation_id }))
            .await
    }

    /// Registers a message id already known to the app, e.g. from a REST
    /// response, so its fan-out echo is suppressed.
    pub fn mark_seen(&self, message_id: Uuid) -> Result<(), GatewayError> {
        self.send(Command::MarkSeen(message_id))
    }

    /// Users currently typing in a conversation.
    pub async fn typing_in(&self, conversation_id: Uuid) -> Result<Vec<Uuid>, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::TypingIn(conversation_id, tx))?;
        rx.await.map_err(|_| GatewayError::Closed)
    }

    fn send(&self, command: Command) -> Result<(), GatewayError> {
        self.commands.send(command).map_err(|_| GatewayError::Closed)
    }
}

struct Gateway {
    transport: Arc<dyn Transport>,
    config: RealtimeConfig,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<GatewayEvent>,
    token: Option<String>,
    link: Option<Box<dyn TransportLink>>,
    pending_open: Option<PendingOpen>,
    /// Application events waiting for authentication, in submission order.
    queue: VecDeque<ClientEvent>,
    /// Rooms the server acknowledged joining; rejoined after reconnecting.
    rooms: BTreeSet<Uuid>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    auth_deadline: Option<Instant>,
    reconnecting: bool,
    seen: SeenMessages,
    typing: TypingTracker,
}

impl Gateway {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let retry_at = self.retry_at;
            let auth_deadline = self.auth_deadline;
            let typing_deadline = self.typing.next_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                opened = poll_open(&mut self.pending_open) => {
                    self.pending_open = None;
                    self.opened(opened).await;
                }
                incoming = recv_from(&mut self.link) => self.handle_incoming(incoming).await,
                _ = sleep_until(retry_at) => {
                    self.retry_at = None;
                    let attempt = self.backoff.attempt();
                    tracing::info!("Reconnection attempt {}", attempt);
                    self.publish(GatewayEvent::ReconnectAttempt(attempt));
                    self.open();
                }
                _ = sleep_until(auth_deadline) => {
                    self.auth_deadline = None;
                    tracing::warn!("No authentication response within {:?}", self.config.auth_timeout);
                    self.connection_lost().await;
                }
                _ = sleep_until(typing_deadline) => {
                    for (conversation_id, user_id) in self.typing.expire(Instant::now()) {
                        self.publish(GatewayEvent::TypingExpired { conversation_id, user_id });
                    }
                }
            }
        }

        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        tracing::debug!("Gateway stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(token) => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Authenticated
                ) {
                    tracing::debug!("connect() ignored in state {:?}", self.state);
                    return;
                }
                self.token = Some(token);
                self.retry_at = None;
                self.reconnecting = false;
                self.backoff.reset();
                self.open();
            }
            Command::Reconnect => {
                if self.token.is_none() {
                    tracing::warn!("reconnect() before connect()");
                    return;
                }
                self.close_link().await;
                if matches!(
                    self.state,
                    ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Authenticated
                ) {
                    self.transition(ConnectionState::Disconnected);
                }
                self.retry_at = None;
                self.reconnecting = true;
                self.backoff.reset();
                self.open();
            }
            Command::Disconnect => {
                self.close_link().await;
                self.queue.clear();
                self.rooms.clear();
                self.typing.clear();
                self.retry_at = None;
                self.reconnecting = false;
                self.backoff.reset();
                self.transition(ConnectionState::Disconnected);
            }
            Command::Emit(ClientEvent::Authenticate(_), reply) => {
                tracing::warn!("authenticate is sent by the gateway itself");
                let _ = reply.send(Ok(()));
            }
            Command::Emit(event, reply) => {
                let accepted =
                    if self.state == ConnectionState::Authenticated && self.queue.is_empty() {
                        self.transmit(event, true).await;
                        Ok(())
                    } else {
                        self.enqueue(event)
                    };
                let _ = reply.send(accepted);
            }
            Command::MarkSeen(message_id) => {
                self.seen.insert(message_id);
            }
            Command::TypingIn(conversation_id, reply) => {
                let _ = reply.send(self.typing.typing_in(conversation_id));
            }
        }
    }

    async fn handle_incoming(&mut self, incoming: Option<Result<ServerEvent, TransportError>>) {
        match incoming {
            Some(Ok(event)) => self.handle_server_event(event).await,
            Some(Err(TransportError::Protocol(e))) => {
                tracing::warn!("Ignoring malformed server frame: {}", e);
            }
            Some(Err(e)) => {
                tracing::warn!("Connection lost: {}", e);
                self.connection_lost().await;
            }
            None => {
                tracing::info!("Server closed the connection");
                self.connection_lost().await;
            }
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match &event {
            ServerEvent::Authenticated(payload) => {
                self.auth_deadline = None;
                if !self.transition(ConnectionState::Authenticated) {
                    return;
                }
                tracing::info!("Authenticated as {} ({})", payload.user_id, payload.role);

                let attempts = self.backoff.attempt();
                self.backoff.reset();
                self.publish(GatewayEvent::Server(event));
                if self.reconnecting {
                    self.reconnecting = false;
                    self.publish(GatewayEvent::Reconnect(attempts));
                }
                self.resume().await;
            }
            ServerEvent::AuthError(payload) => {
                tracing::warn!("Authentication rejected: {}", payload.code);
                self.auth_deadline = None;
                self.retry_at = None;
                self.reconnecting = false;
                self.queue.clear();
                self.rooms.clear();
                self.close_link().await;
                self.transition(ConnectionState::Error);
                self.publish(GatewayEvent::Server(event));
            }
            ServerEvent::MessageNew(message) => {
                if !self.seen.insert(message.id) {
                    tracing::debug!(
                        "Dropping duplicate message {} ({} ids remembered)",
                        message.id,
                        self.seen.len()
                    );
                    return;
                }
                self.publish(GatewayEvent::Server(event));
            }
            ServerEvent::TypingStart(payload) => {
                self.typing.start(payload.conversation_id, payload.user_id);
                self.publish(GatewayEvent::Server(event));
            }
            ServerEvent::TypingStop(payload) => {
                self.typing.stop(payload.conversation_id, payload.user_id);
                self.publish(GatewayEvent::Server(event));
            }
            ServerEvent::ConversationJoined(payload) => {
                self.rooms.insert(payload.conversation_id);
                self.publish(GatewayEvent::Server(event));
            }
            ServerEvent::ConversationLeft(payload) => {
                self.rooms.remove(&payload.conversation_id);
                self.publish(GatewayEvent::Server(event));
            }
            _ => self.publish(GatewayEvent::Server(event)),
        }
    }

    /// Starts a connection attempt. The run loop polls it, so commands such
    /// as `disconnect()` are still handled while it is in flight.
    fn open(&mut self) {
        if self.token.is_none() || !self.transition(ConnectionState::Connecting) {
            return;
        }

        let transport = self.transport.clone();
        let timeout = self.config.auth_timeout;
        self.pending_open = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, transport.open()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Connect(format!("timed out after {:?}", timeout))),
            }
        }));
    }

    /// Completes a connection attempt by sending `authenticate`.
    async fn opened(&mut self, result: Result<Box<dyn TransportLink>, TransportError>) {
        let mut link = match result {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!("Connect failed: {}", e);
                self.connection_lost().await;
                return;
            }
        };
        let Some(token) = self.token.clone() else {
            link.close().await;
            return;
        };

        self.transition(ConnectionState::Connected);
        if let Err(e) = link
            .send(&ClientEvent::Authenticate(AuthenticatePayload { token }))
            .await
        {
            tracing::warn!("Failed to send authenticate: {}", e);
            link.close().await;
            self.connection_lost().await;
            return;
        }

        self.link = Some(link);
        self.auth_deadline = Some(Instant::now() + self.config.auth_timeout);
    }

    /// Network failure: drop the link and schedule the next attempt, or give
    /// up once the ceiling is reached.
    async fn connection_lost(&mut self) {
        self.close_link().await;
        self.transition(ConnectionState::Disconnected);
        self.reconnecting = true;

        match self.backoff.next_delay() {
            Some(delay) => {
                tracing::info!(
                    "Reconnecting in {:?} (attempt {})",
                    delay,
                    self.backoff.attempt()
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            None => {
                tracing::error!(
                    "Giving up after {} reconnection attempts",
                    self.backoff.attempt()
                );
                self.retry_at = None;
                self.transition(ConnectionState::Error);
                self.publish(GatewayEvent::ReconnectFailed);
            }
        }
    }

    /// Rejoins known rooms, then flushes the queue in order.
    async fn resume(&mut self) {
        let rooms: Vec<Uuid> = self.rooms.iter().copied().collect();
        for conversation_id in rooms {
            let rejoin = ClientEvent::JoinConversation(RoomPayload { conversation_id });
            if !self.transmit(rejoin, false).await {
                return;
            }
        }

        if !self.queue.is_empty() {
            tracing::debug!("Flushing {} queued events", self.queue.len());
        }
        while let Some(event) = self.queue.pop_front() {
            if !self.transmit(event, true).await {
                return;
            }
        }
    }

    /// Sends on the current link. On failure the event goes back to the
    /// front of the queue when `requeue` is set and the link is dropped.
    async fn transmit(&mut self, event: ClientEvent, requeue: bool) -> bool {
        let Some(link) = self.link.as_mut() else {
            if requeue {
                self.queue.push_front(event);
            }
            return false;
        };

        match link.send(&event).await {
            Ok(()) => {
                if let ClientEvent::LeaveConversation(room) = &event {
                    self.rooms.remove(&room.conversation_id);
                }
                true
            }
            Err(e) => {
                tracing::warn!("Failed to send {}: {}", event.name(), e);
                if requeue {
                    self.queue.push_front(event);
                }
                self.connection_lost().await;
                false
            }
        }
    }

    fn enqueue(&mut self, event: ClientEvent) -> Result<(), GatewayError> {
        if self.queue.len() >= self.config.max_queued_events {
            tracing::warn!("Outbound queue full, refusing {}", event.name());
            return Err(GatewayError::QueueFull(self.queue.len()));
        }
        self.queue.push_back(event);
        Ok(())
    }

    async fn close_link(&mut self) {
        self.auth_deadline = None;
        self.pending_open = None;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
    }

    /// The single place the connection state changes.
    fn transition(&mut self, to: ConnectionState) -> bool {
        let from = self.state;
        if from == to {
            return true;
        }
        if !from.can_transition(to) {
            tracing::warn!("Refusing state transition {:?} -> {:?}", from, to);
            return false;
        }

        self.state = to;
        tracing::info!("Gateway state {:?} -> {:?}", from, to);
        self.state_tx.send_replace(to);
        self.publish(GatewayEvent::StateChanged(to));
        true
    }

    fn publish(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }
}

async fn recv_from(
    link: &mut Option<Box<dyn TransportLink>>,
) -> Option<Result<ServerEvent, TransportError>> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn poll_open(
    pending: &mut Option<PendingOpen>,
) -> Result<Box<dyn TransportLink>, TransportError> {
    match pending {
        Some(open) => open.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        models::{Message, MessageType, Role},
        realtime::events::{AuthenticatedPayload, ErrorPayload, TypingPayload},
    };

    /// Server end of one mock link.
    struct ServerSide {
        from_client: mpsc::UnboundedReceiver<ClientEvent>,
        to_client: mpsc::UnboundedSender<ServerEvent>,
    }

    impl ServerSide {
        async fn expect(&mut self) -> ClientEvent {
            self.from_client.recv().await.expect("client closed the link")
        }

        async fn accept(&mut self, token: &str) {
            assert_eq!(
                self.expect().await,
                ClientEvent::Authenticate(AuthenticatePayload {
                    token: token.to_string()
                })
            );
            self.to_client
                .send(ServerEvent::Authenticated(AuthenticatedPayload {
                    user_id: Uuid::new_v4(),
                    role: Role::Rider,
                }))
                .unwrap();
        }
    }

    struct MockTransport {
        failures_left: Mutex<u32>,
        opened: mpsc::UnboundedSender<ServerSide>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&self) -> Result<Box<dyn TransportLink>, TransportError> {
            let mut failures = self.failures_left.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Connect("refused".to_string()));
            }

            let (client_tx, from_client) = mpsc::unbounded_channel();
            let (to_client, client_rx) = mpsc::unbounded_channel();
            let _ = self.opened.send(ServerSide {
                from_client,
                to_client,
            });
            Ok(Box::new(MockLink {
                tx: Some(client_tx),
                rx: client_rx,
            }))
        }
    }

    struct MockLink {
        tx: Option<mpsc::UnboundedSender<ClientEvent>>,
        rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    #[async_trait]
    impl TransportLink for MockLink {
        async fn send(&mut self, event: &ClientEvent) -> Result<(), TransportError> {
            let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
            tx.send(event.clone()).map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Option<Result<ServerEvent, TransportError>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.tx = None;
        }
    }

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(5),
            reconnect_attempts: 2,
            reconnect_jitter: 0.0,
            auth_timeout: Duration::from_secs(10),
            typing_timeout: Duration::from_secs(3),
            max_queued_events: 16,
            seen_message_capacity: 64,
        }
    }

    fn start(failures: u32) -> (GatewayHandle, mpsc::UnboundedReceiver<ServerSide>) {
        start_with(failures, config())
    }

    fn start_with(
        failures: u32,
        config: RealtimeConfig,
    ) -> (GatewayHandle, mpsc::UnboundedReceiver<ServerSide>) {
        let (opened, links) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            failures_left: Mutex::new(failures),
            opened,
        });
        (GatewayClient::spawn(transport, config), links)
    }

    /// Transport whose connection attempts never complete.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn open(&self) -> Result<Box<dyn TransportLink>, TransportError> {
            std::future::pending().await
        }
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<GatewayEvent>,
        predicate: impl Fn(&GatewayEvent) -> bool,
    ) -> GatewayEvent {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    }

    fn message(id: Uuid) -> Message {
        Message {
            id,
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            content: "hi".to_string(),
            message_type: MessageType::Text,
            metadata: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn transition_table() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition(Connecting));
        assert!(Connecting.can_transition(Connected));
        assert!(Connected.can_transition(Authenticated));
        assert!(Error.can_transition(Connecting));
        for state in [Disconnected, Connecting, Connected, Authenticated, Error] {
            assert!(state.can_transition(Error));
            assert!(state.can_transition(Disconnected));
        }

        assert!(!Disconnected.can_transition(Authenticated));
        assert!(!Connecting.can_transition(Authenticated));
        assert!(!Authenticated.can_transition(Connecting));
        assert!(!Disconnected.can_transition(Connected));
    }

    #[tokio::test]
    async fn connect_requires_a_credential() {
        let (gateway, _links) = start(0);
        assert!(matches!(
            gateway.connect("  "),
            Err(GatewayError::MissingCredential)
        ));
        assert_eq!(gateway.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn queued_events_flush_in_submission_order() {
        let (gateway, mut links) = start(0);
        let room = Uuid::new_v4();

        gateway.send_message(room, "first", None, None).await.unwrap();
        gateway.connect("token-a").unwrap();
        gateway.join(room).await.unwrap();
        gateway.send_message(room, "second", None, None).await.unwrap();

        let mut server = links.recv().await.unwrap();
        server.accept("token-a").await;

        assert!(matches!(server.expect().await, ClientEvent::SendMessage(m) if m.content == "first"));
        assert_eq!(
            server.expect().await,
            ClientEvent::JoinConversation(RoomPayload {
                conversation_id: room
            })
        );
        assert!(matches!(server.expect().await, ClientEvent::SendMessage(m) if m.content == "second"));

        gateway
            .wait_for_state(ConnectionState::Authenticated)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn auth_error_is_terminal_and_flushes_nothing() {
        let (gateway, mut links) = start(0);
        let mut events = gateway.subscribe();
        let room = Uuid::new_v4();

        gateway.connect("expired").unwrap();
        gateway.send_message(room, "queued", None, None).await.unwrap();

        let mut server = links.recv().await.unwrap();
        assert!(matches!(server.expect().await, ClientEvent::Authenticate(_)));
        server
            .to_client
            .send(ServerEvent::AuthError(ErrorPayload {
                code: "INVALID_TOKEN".to_string(),
                message: "Invalid token".to_string(),
            }))
            .unwrap();

        gateway.wait_for_state(ConnectionState::Error).await.unwrap();
        assert!(server.from_client.recv().await.is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(!seen.contains(&GatewayEvent::StateChanged(ConnectionState::Authenticated)));
        assert!(!seen
            .iter()
            .any(|e| matches!(e, GatewayEvent::ReconnectAttempt(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_and_rejoins_rooms() {
        let (gateway, mut links) = start(0);
        let mut events = gateway.subscribe();
        let room = Uuid::new_v4();

        gateway.connect("token").unwrap();
        let mut server = links.recv().await.unwrap();
        server.accept("token").await;
        gateway.join(room).await.unwrap();
        assert!(matches!(server.expect().await, ClientEvent::JoinConversation(_)));
        server
            .to_client
            .send(ServerEvent::ConversationJoined(RoomPayload {
                conversation_id: room,
            }))
            .unwrap();
        next_matching(&mut events, |e| {
            matches!(e, GatewayEvent::Server(ServerEvent::ConversationJoined(_)))
        })
        .await;

        drop(server);
        next_matching(&mut events, |e| {
            *e == GatewayEvent::StateChanged(ConnectionState::Disconnected)
        })
        .await;
        gateway.send_message(room, "while offline", None, None).await.unwrap();

        let mut server = links.recv().await.unwrap();
        server.accept("token").await;
        assert_eq!(
            server.expect().await,
            ClientEvent::JoinConversation(RoomPayload {
                conversation_id: room
            })
        );
        assert!(matches!(server.expect().await, ClientEvent::SendMessage(m) if m.content == "while offline"));

        assert_eq!(
            next_matching(&mut events, |e| matches!(e, GatewayEvent::ReconnectAttempt(_))).await,
            GatewayEvent::ReconnectAttempt(1)
        );
        assert_eq!(
            next_matching(&mut events, |e| matches!(e, GatewayEvent::Reconnect(_))).await,
            GatewayEvent::Reconnect(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_attempt_ceiling() {
        let (gateway, mut links) = start(3);
        let mut events = gateway.subscribe();
        let started = Instant::now();

        gateway.connect("token").unwrap();
        next_matching(&mut events, |e| *e == GatewayEvent::ReconnectFailed).await;
        assert_eq!(gateway.state(), ConnectionState::Error);
        // Two retries: one second, then two.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));

        // No more automatic attempts.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(links.try_recv().is_err());

        gateway.reconnect().unwrap();
        let mut server = links.recv().await.unwrap();
        server.accept("token").await;
        gateway
            .wait_for_state(ConnectionState::Authenticated)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disconnect_drops_queue_and_rooms() {
        let (gateway, mut links) = start(0);
        let room = Uuid::new_v4();

        gateway.connect("token").unwrap();
        let mut server = links.recv().await.unwrap();
        server.accept("token").await;
        gateway.join(room).await.unwrap();
        server.expect().await;

        gateway.disconnect().unwrap();
        gateway.send_message(room, "discarded?", None, None).await.unwrap();
        gateway.disconnect().unwrap();
        gateway
            .wait_for_state(ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(server.from_client.recv().await.is_none());

        gateway.connect("token").unwrap();
        let mut server = links.recv().await.unwrap();
        server.accept("token").await;
        gateway.mark_read(room).await.unwrap();
        assert_eq!(
            server.expect().await,
            ClientEvent::MarkRead(RoomPayload {
                conversation_id: room
            })
        );
    }

    #[tokio::test]
    async fn duplicate_messages_are_suppressed() {
        let (gateway, mut links) = start(0);
        let mut events = gateway.subscribe();
        gateway.connect("token").unwrap();
        let mut server = links.recv().await.unwrap();
        server.accept("token").await;

        let (echoed, from_rest) = (Uuid::new_v4(), Uuid::new_v4());
        gateway.mark_seen(from_rest).unwrap();
        gateway
            .wait_for_state(ConnectionState::Authenticated)
            .await
            .unwrap();

        let marker = TypingPayload {
            conversation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        };
        for event in [
            ServerEvent::MessageNew(message(echoed)),
            ServerEvent::MessageNew(message(echoed)),
            ServerEvent::MessageNew(message(from_rest)),
            ServerEvent::TypingStart(marker),
        ] {
            server.to_client.send(event).unwrap();
        }

        let mut delivered = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                GatewayEvent::Server(ServerEvent::MessageNew(m)) => delivered.push(m.id),
                GatewayEvent::Server(ServerEvent::TypingStart(_)) => break,
                _ => {}
            }
        }
        assert_eq!(delivered, vec![echoed]);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_indicators_expire() {
        let (gateway, mut links) = start(0);
        let mut events = gateway.subscribe();
        gateway.connect("token").unwrap();
        let mut server = links.recv().await.unwrap();
        server.accept("token").await;

        let typing = TypingPayload {
            conversation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        };
        server
            .to_client
            .send(ServerEvent::TypingStart(typing))
            .unwrap();
        next_matching(&mut events, |e| {
            matches!(e, GatewayEvent::Server(ServerEvent::TypingStart(_)))
        })
        .await;
        assert_eq!(
            gateway.typing_in(typing.conversation_id).await.unwrap(),
            vec![typing.user_id]
        );

        let started = Instant::now();
        assert_eq!(
            next_matching(&mut events, |e| matches!(e, GatewayEvent::TypingExpired { .. })).await,
            GatewayEvent::TypingExpired {
                conversation_id: typing.conversation_id,
                user_id: typing.user_id,
            }
        );
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(gateway
            .typing_in(typing.conversation_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_counts_as_network_failure() {
        let (gateway, mut links) = start(0);
        let mut events = gateway.subscribe();
        gateway.connect("token").unwrap();

        let mut first = links.recv().await.unwrap();
        assert!(matches!(first.expect().await, ClientEvent::Authenticate(_)));

        next_matching(&mut events, |e| {
            *e == GatewayEvent::StateChanged(ConnectionState::Disconnected)
        })
        .await;
        assert!(first.from_client.recv().await.is_none());

        let mut second = links.recv().await.unwrap();
        second.accept("token").await;
        gateway
            .wait_for_state(ConnectionState::Authenticated)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn full_queue_refuses_new_events_and_keeps_accepted_ones() {
        let (gateway, mut links) = start_with(
            0,
            RealtimeConfig {
                max_queued_events: 4,
                ..config()
            },
        );
        let room = Uuid::new_v4();

        gateway.join(room).await.unwrap();
        for n in 1..=3 {
            gateway
                .send_message(room, format!("m{}", n), None, None)
                .await
                .unwrap();
        }
        assert!(matches!(
            gateway.send_message(room, "m4", None, None).await,
            Err(GatewayError::QueueFull(4))
        ));

        gateway.connect("token").unwrap();
        let mut server = links.recv().await.unwrap();
        server.accept("token").await;

        assert_eq!(
            server.expect().await,
            ClientEvent::JoinConversation(RoomPayload {
                conversation_id: room
            })
        );
        for n in 1..=3 {
            let expected = format!("m{}", n);
            assert!(matches!(server.expect().await, ClientEvent::SendMessage(m) if m.content == expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_a_scheduled_retry() {
        let (opened, _links) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            failures_left: Mutex::new(100),
            opened,
        });
        let gateway = GatewayClient::spawn(transport.clone(), config());
        let mut events = gateway.subscribe();

        gateway.connect("token").unwrap();
        next_matching(&mut events, |e| {
            *e == GatewayEvent::StateChanged(ConnectionState::Disconnected)
        })
        .await;
        assert_eq!(*transport.failures_left.lock().await, 99);

        gateway.disconnect().unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(gateway.state(), ConnectionState::Disconnected);
        assert_eq!(*transport.failures_left.lock().await, 99);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, GatewayEvent::ReconnectAttempt(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_a_connect_in_progress() {
        let gateway = GatewayClient::spawn(Arc::new(StalledTransport), config());
        let started = Instant::now();

        gateway.connect("token").unwrap();
        gateway
            .wait_for_state(ConnectionState::Connecting)
            .await
            .unwrap();
        gateway.disconnect().unwrap();
        gateway
            .wait_for_state(ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        // The abandoned attempt never resurfaces as a retry.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_join_is_not_repeated_after_reconnect() {
        let (gateway, mut links) = start(0);
        let mut events = gateway.subscribe();
        let (refused, marker) = (Uuid::new_v4(), Uuid::new_v4());

        gateway.connect("token").unwrap();
        let mut server = links.recv().await.unwrap();
        server.accept("token").await;
        gateway.join(refused).await.unwrap();
        assert!(matches!(server.expect().await, ClientEvent::JoinConversation(_)));
        server
            .to_client
            .send(ServerEvent::Error(ErrorPayload {
                code: "ACCESS_DENIED".to_string(),
                message: "Access denied".to_string(),
            }))
            .unwrap();
        next_matching(&mut events, |e| {
            matches!(e, GatewayEvent::Server(ServerEvent::Error(_)))
        })
        .await;

        drop(server);
        let mut server = links.recv().await.unwrap();
        server.accept("token").await;
        gateway
            .wait_for_state(ConnectionState::Authenticated)
            .await
            .unwrap();
        gateway.mark_read(marker).await.unwrap();
        assert_eq!(
            server.expect().await,
            ClientEvent::MarkRead(RoomPayload {
                conversation_id: marker
            })
        );
    }
}
