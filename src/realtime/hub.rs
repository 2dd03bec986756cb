use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::events::{RoomPayload, ServerEvent};
use crate::storage::redis::RedisClient;

pub type ConnectionId = Uuid;

const PRESENCE_TTL: Duration = Duration::from_secs(300);

struct Connection {
    user_id: Uuid,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<Uuid, HashSet<ConnectionId>>,
}

impl HubState {
    fn deliver(&self, conversation_id: Uuid, except: Option<ConnectionId>, event: &ServerEvent) {
        let Some(members) = self.rooms.get(&conversation_id) else {
            return;
        };
        for connection_id in members {
            if Some(*connection_id) == except {
                continue;
            }
            if let Some(connection) = self.connections.get(connection_id) {
                let _ = connection.sender.send(event.clone());
            }
        }
    }
}

/// Fan-out envelope exchanged between server instances.
#[derive(Debug, Serialize, Deserialize)]
struct RelayEnvelope {
    origin: Uuid,
    conversation_id: Uuid,
    except: Option<ConnectionId>,
    event: ServerEvent,
}

/// Registry of authenticated connections and the conversation rooms they
/// are subscribed to.
///
/// Every event for a connection goes through that connection's single
/// queue, and room membership only changes under the write lock, so a join
/// acknowledgment is always queued before any fan-out the new member sees.
pub struct RoomHub {
    state: RwLock<HubState>,
    relay: Option<RedisClient>,
    instance_id: Uuid,
}

impl RoomHub {
    pub fn new(relay: Option<RedisClient>) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            relay,
            instance_id: Uuid::new_v4(),
        }
    }

    pub async fn register(
        &self,
        user_id: Uuid,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        {
            let mut state = self.state.write().await;
            state
                .connections
                .insert(connection_id, Connection { user_id, sender });
        }
        tracing::info!("Connection registered: {} (user {})", connection_id, user_id);

        self.set_presence(user_id, "online", PRESENCE_TTL).await;
        connection_id
    }

    pub async fn unregister(&self, connection_id: ConnectionId) {
        let removed = {
            let mut state = self.state.write().await;
            for members in state.rooms.values_mut() {
                members.remove(&connection_id);
            }
            state.rooms.retain(|_, members| !members.is_empty());
            state.connections.remove(&connection_id)
        };

        if let Some(connection) = removed {
            tracing::info!("Connection unregistered: {}", connection_id);
            self.set_presence(connection.user_id, "offline", Duration::from_secs(1))
                .await;
        }
    }

    /// Subscribes a connection to a room and queues `conversation:joined`
    /// for it. Returns false for unknown connections.
    pub async fn join(&self, connection_id: ConnectionId, conversation_id: Uuid) -> bool {
        let mut state = self.state.write().await;
        let Some(connection) = state.connections.get(&connection_id) else {
            return false;
        };
        let _ = connection
            .sender
            .send(ServerEvent::ConversationJoined(RoomPayload { conversation_id }));
        state
            .rooms
            .entry(conversation_id)
            .or_default()
            .insert(connection_id);
        tracing::debug!("Connection {} joined room {}", connection_id, conversation_id);
        true
    }

    pub async fn leave(&self, connection_id: ConnectionId, conversation_id: Uuid) {
        let mut state = self.state.write().await;
        if let Some(members) = state.rooms.get_mut(&conversation_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                state.rooms.remove(&conversation_id);
            }
        }
        if let Some(connection) = state.connections.get(&connection_id) {
            let _ = connection
                .sender
                .send(ServerEvent::ConversationLeft(RoomPayload { conversation_id }));
        }
    }

    /// Removes every connection of `user_id` from a room, e.g. after the user
    /// left the conversation.
    pub async fn evict_user(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut state = self.state.write().await;
        let HubState { connections, rooms } = &mut *state;
        if let Some(members) = rooms.get_mut(&conversation_id) {
            members.retain(|id| match connections.get(id) {
                Some(connection) if connection.user_id == user_id => {
                    let _ = connection
                        .sender
                        .send(ServerEvent::ConversationLeft(RoomPayload { conversation_id }));
                    false
                }
                _ => true,
            });
        }
    }

    pub async fn is_member(&self, connection_id: ConnectionId, conversation_id: Uuid) -> bool {
        let state = self.state.read().await;
        state
            .rooms
            .get(&conversation_id)
            .map_or(false, |members| members.contains(&connection_id))
    }

    pub async fn room_size(&self, conversation_id: Uuid) -> usize {
        let state = self.state.read().await;
        state.rooms.get(&conversation_id).map_or(0, HashSet::len)
    }

    /// Sends an event to every connection in the room, the originator
    /// included.
    pub async fn broadcast(&self, conversation_id: Uuid, event: ServerEvent) {
        self.fan_out(conversation_id, None, event).await;
    }

    /// Sends an event to every connection in the room except `except`.
    pub async fn broadcast_except(
        &self,
        conversation_id: Uuid,
        except: ConnectionId,
        event: ServerEvent,
    ) {
        self.fan_out(conversation_id, Some(except), event).await;
    }

    async fn fan_out(&self, conversation_id: Uuid, except: Option<ConnectionId>, event: ServerEvent) {
        {
            let state = self.state.read().await;
            state.deliver(conversation_id, except, &event);
        }

        // Also publish to Redis for other server instances
        if let Some(redis) = &self.relay {
            let envelope = RelayEnvelope {
                origin: self.instance_id,
                conversation_id,
                except,
                event,
            };
            match serde_json::to_string(&envelope) {
                Ok(payload) => {
                    if let Err(e) = redis.publish_fanout(&payload).await {
                        tracing::warn!("Failed to relay fan-out for {}: {}", conversation_id, e);
                    }
                }
                Err(e) => tracing::warn!("Failed to encode fan-out envelope: {}", e),
            }
        }
    }

    /// Delivers fan-out published by other instances to local room members.
    /// Runs until the subscription ends.
    pub async fn run_relay(self: Arc<Self>) {
        let Some(redis) = self.relay.clone() else {
            return;
        };

        let mut pubsub = match redis.subscribe_fanout().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::error!("Fan-out relay subscription failed: {}", e);
                return;
            }
        };
        tracing::info!("Fan-out relay subscribed");

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let Ok(payload) = msg.get_payload::<String>() else {
                continue;
            };
            match serde_json::from_str::<RelayEnvelope>(&payload) {
                Ok(envelope) if envelope.origin != self.instance_id => {
                    let state = self.state.read().await;
                    state.deliver(envelope.conversation_id, envelope.except, &envelope.event);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Dropping malformed fan-out envelope: {}", e),
            }
        }
        tracing::warn!("Fan-out relay subscription ended");
    }

    async fn set_presence(&self, user_id: Uuid, status: &str, ttl: Duration) {
        if let Some(redis) = &self.relay {
            if let Err(e) = redis.set_user_presence(&user_id.to_string(), status, ttl).await {
                tracing::warn!("Failed to set presence for {}: {}", user_id, e);
            }
        }
    }
}
