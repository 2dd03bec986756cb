use std::sync::Arc;

use uuid::Uuid;

use crate::{
    error::AppResult,
    models::UnreadOverview,
    storage::ChatStore,
};

/// Read-only view of unread counts derived from participant read cursors.
pub struct UnreadTracker {
    store: Arc<dyn ChatStore>,
}

impl UnreadTracker {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Global total plus the conversations that have anything unread.
    pub async fn overview(&self, user_id: Uuid) -> AppResult<UnreadOverview> {
        let mut conversations = self.store.unread_per_conversation(user_id).await?;
        conversations.retain(|c| c.count > 0);
        let total = conversations.iter().map(|c| c.count).sum();

        Ok(UnreadOverview {
            total,
            conversations,
        })
    }

    pub async fn total(&self, user_id: Uuid) -> AppResult<i64> {
        self.store.unread_total_for_user(user_id).await
    }

    pub async fn for_conversation(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        self.store.unread_count(conversation_id, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{ConversationType, MessageType, NewConversation, NewMessage},
        storage::{memory::MemoryChatStore, ConversationStore, MessageStore},
    };

    async fn direct(store: &MemoryChatStore, a: Uuid, b: Uuid) -> Uuid {
        store
            .create_conversation(NewConversation {
                conversation_type: ConversationType::Direct,
                title: None,
                incident_id: None,
                minimum_role: None,
                created_by: a,
                member_ids: vec![b],
            })
            .await
            .unwrap()
            .id
    }

    async fn say(store: &MemoryChatStore, conversation_id: Uuid, sender_id: Uuid, text: &str) {
        store
            .send(NewMessage {
                conversation_id,
                sender_id,
                content: text.to_string(),
                message_type: MessageType::Text,
                metadata: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn overview_sums_conversations_and_skips_read_ones() {
        let store = Arc::new(MemoryChatStore::new());
        let (me, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let with_a = direct(&store, me, a).await;
        let with_b = direct(&store, me, b).await;

        say(&store, with_a, a, "one").await;
        say(&store, with_a, a, "two").await;
        say(&store, with_b, b, "three").await;
        say(&store, with_b, me, "mine").await;

        let tracker = UnreadTracker::new(store.clone());
        let overview = tracker.overview(me).await.unwrap();
        assert_eq!(overview.total, 2);
        assert_eq!(overview.conversations.len(), 1);
        assert_eq!(overview.conversations[0].conversation_id, with_a);
        assert_eq!(tracker.total(me).await.unwrap(), 2);

        store.update_last_read(with_a, me).await.unwrap();
        assert_eq!(tracker.for_conversation(with_a, me).await.unwrap(), 0);
        assert_eq!(tracker.overview(me).await.unwrap().total, 0);
    }
}
