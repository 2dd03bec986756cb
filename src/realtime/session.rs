use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    events::{
        AuthenticatedPayload, ClientEvent, ErrorPayload, OutgoingMessage, RoomPayload,
        ServerEvent, TypingPayload,
    },
    hub::ConnectionId,
};
use crate::{
    error::AppError,
    models::Role,
    services::{AuthService, MessagingService},
};

/// Server side of one realtime connection, independent of the wire.
///
/// The first event must be `authenticate`. A bad token ends the session
/// with `auth_error`; business errors afterwards are reported to this
/// connection only and never end it.
#[derive(Clone)]
pub struct Session {
    chat: Arc<MessagingService>,
    auth: Arc<AuthService>,
    auth_timeout: Duration,
}

impl Session {
    pub fn new(chat: Arc<MessagingService>, auth: Arc<AuthService>, auth_timeout: Duration) -> Self {
        Self {
            chat,
            auth,
            auth_timeout,
        }
    }

    /// Runs until the inbound side closes or authentication fails.
    pub async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<ClientEvent>,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let authenticated =
            tokio::time::timeout(self.auth_timeout, self.authenticate(&mut inbound, &outbound)).await;
        let (user_id, role) = match authenticated {
            Ok(Some(identity)) => identity,
            Ok(None) => return,
            Err(_) => {
                tracing::debug!("Closing connection that never authenticated");
                return;
            }
        };

        let hub = self.chat.hub().clone();
        let connection_id = hub.register(user_id, outbound.clone()).await;
        let _ = outbound.send(ServerEvent::Authenticated(AuthenticatedPayload { user_id, role }));

        while let Some(event) = inbound.recv().await {
            tracing::debug!("{} from user {}", event.name(), user_id);
            if let Err(e) = self.dispatch(connection_id, user_id, event).await {
                tracing::warn!("Rejected realtime event from {}: {}", user_id, e.code());
                let _ = outbound.send(ServerEvent::Error(ErrorPayload::from(&e)));
            }
        }

        hub.unregister(connection_id).await;
    }

    async fn authenticate(
        &self,
        inbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
        outbound: &mpsc::UnboundedSender<ServerEvent>,
    ) -> Option<(Uuid, Role)> {
        loop {
            match inbound.recv().await? {
                ClientEvent::Authenticate(payload) => {
                    let identity = self
                        .auth
                        .validate_token(&payload.token)
                        .and_then(|claims| Ok((claims.user_id()?, claims.role)));
                    return match identity {
                        Ok(identity) => Some(identity),
                        Err(e) => {
                            tracing::info!("Realtime authentication failed: {}", e);
                            let _ = outbound
                                .send(ServerEvent::AuthError(ErrorPayload::from(&AppError::InvalidToken)));
                            None
                        }
                    };
                }
                other => {
                    tracing::warn!("{} before authenticate", other.name());
                    let _ = outbound.send(ServerEvent::Error(ErrorPayload::from(&AppError::Unauthorized)));
                }
            }
        }
    }

    async fn dispatch(
        &self,
        connection_id: ConnectionId,
        user_id: Uuid,
        event: ClientEvent,
    ) -> Result<(), AppError> {
        let hub = self.chat.hub();

        match event {
            ClientEvent::Authenticate(_) => {
                tracing::debug!("Ignoring repeated authenticate from {}", user_id);
            }
            ClientEvent::JoinConversation(RoomPayload { conversation_id }) => {
                self.chat.ensure_access(conversation_id, user_id).await?;
                hub.join(connection_id, conversation_id).await;
            }
            ClientEvent::LeaveConversation(RoomPayload { conversation_id }) => {
                hub.leave(connection_id, conversation_id).await;
            }
            ClientEvent::SendMessage(OutgoingMessage {
                conversation_id,
                content,
                message_type,
                metadata,
            }) => {
                self.chat
                    .send_message(
                        conversation_id,
                        user_id,
                        content,
                        message_type.as_deref(),
                        metadata,
                    )
                    .await?;
            }
            ClientEvent::TypingStart(RoomPayload { conversation_id }) => {
                if hub.is_member(connection_id, conversation_id).await {
                    let payload = TypingPayload {
                        conversation_id,
                        user_id,
                    };
                    hub.broadcast_except(conversation_id, connection_id, ServerEvent::TypingStart(payload))
                        .await;
                }
            }
            ClientEvent::TypingStop(RoomPayload { conversation_id }) => {
                if hub.is_member(connection_id, conversation_id).await {
                    let payload = TypingPayload {
                        conversation_id,
                        user_id,
                    };
                    hub.broadcast_except(conversation_id, connection_id, ServerEvent::TypingStop(payload))
                        .await;
                }
            }
            ClientEvent::MarkRead(RoomPayload { conversation_id }) => {
                self.chat.mark_read(conversation_id, user_id).await?;
            }
        }

        Ok(())
    }
}
