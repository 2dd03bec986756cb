use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{ordered_pair, ConversationStore, MessageStore};
use crate::{
    error::{AppError, AppResult},
    models::{
        Conversation, ConversationStatus, ConversationSummary, ConversationType, Membership,
        Message, MessageQuery, MessageType, NewConversation, NewMessage, PageRequest, Participant,
        ParticipantRole, Role, UnreadCount, DELETED_MESSAGE_TOMBSTONE,
    },
};

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: Uuid,
    #[sqlx(rename = "type")]
    conversation_type: ConversationType,
    title: Option<String>,
    incident_id: Option<Uuid>,
    minimum_role: Option<Role>,
    status: ConversationStatus,
    created_by: Uuid,
    last_message_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            conversation_type: row.conversation_type,
            title: row.title,
            incident_id: row.incident_id,
            minimum_role: row.minimum_role,
            status: row.status,
            created_by: row.created_by,
            last_message_at: row.last_message_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ParticipantRow {
    id: Uuid,
    conversation_id: Uuid,
    user_id: Uuid,
    role: ParticipantRole,
    joined_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
    last_read_at: Option<DateTime<Utc>>,
}

impl From<ParticipantRow> for Participant {
    fn from(row: ParticipantRow) -> Self {
        Participant {
            id: row.id,
            conversation_id: row.conversation_id,
            user_id: row.user_id,
            role: row.role,
            joined_at: row.joined_at,
            membership: Membership::from_left_at(row.left_at),
            last_read_at: row.last_read_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: String,
    message_type: MessageType,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content: row.content,
            message_type: row.message_type,
            metadata: row.metadata,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(Clone)]
pub struct PgChatStore {
    db: PgPool,
}

impl PgChatStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn insert_participant<'e, E>(
        executor: E,
        conversation_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
    ) -> AppResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO participants (id, conversation_id, user_id, role, joined_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (conversation_id, user_id) WHERE left_at IS NULL DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(user_id)
        .bind(role)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for PgChatStore {
    async fn create_conversation(&self, new: NewConversation) -> AppResult<Conversation> {
        let mut tx = self.db.begin().await?;

        if new.conversation_type == ConversationType::Direct {
            let other = *new
                .member_ids
                .first()
                .ok_or(AppError::DirectRequiresOneParticipant)?;

            // Serialize check-and-create per unordered user pair.
            let (low, high) = ordered_pair(new.created_by, other);
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(format!("direct:{}:{}", low, high))
                .execute(&mut *tx)
                .await?;

            let existing: Option<ConversationRow> = sqlx::query_as(
                r#"
                SELECT c.* FROM conversations c
                JOIN participants p1 ON p1.conversation_id = c.id
                    AND p1.user_id = $1 AND p1.left_at IS NULL
                JOIN participants p2 ON p2.conversation_id = c.id
                    AND p2.user_id = $2 AND p2.left_at IS NULL
                WHERE c.type = 'direct' AND c.status = 'active'
                AND (
                    SELECT COUNT(*) FROM participants p
                    WHERE p.conversation_id = c.id AND p.left_at IS NULL
                ) = 2
                LIMIT 1
                "#,
            )
            .bind(new.created_by)
            .bind(other)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                tx.commit().await?;
                return Ok(row.into());
            }
        }

        let row: ConversationRow = sqlx::query_as(
            r#"
            INSERT INTO conversations (id, type, title, incident_id, minimum_role, created_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.conversation_type)
        .bind(&new.title)
        .bind(new.incident_id)
        .bind(new.minimum_role)
        .bind(new.created_by)
        .fetch_one(&mut *tx)
        .await?;

        Self::insert_participant(&mut *tx, row.id, new.created_by, ParticipantRole::Admin).await?;
        for member_id in &new.member_ids {
            if *member_id != new.created_by {
                Self::insert_participant(&mut *tx, row.id, *member_id, ParticipantRole::Member)
                    .await?;
            }
        }

        tx.commit().await?;

        Ok(row.into())
    }

    async fn ensure_role_group(&self, role: Role) -> AppResult<Conversation> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, type, title, minimum_role, created_by)
            VALUES ($1, 'role_group', $2, $3, $4)
            ON CONFLICT (minimum_role) WHERE type = 'role_group' DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(role.group_title())
        .bind(role)
        .bind(Uuid::nil())
        .execute(&self.db)
        .await?;

        let row: ConversationRow = sqlx::query_as(
            "SELECT * FROM conversations WHERE type = 'role_group' AND minimum_role = $1",
        )
        .bind(role)
        .fetch_one(&self.db)
        .await?;

        Ok(row.into())
    }

    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        let row: Option<ConversationRow> =
            sqlx::query_as("SELECT * FROM conversations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(Into::into))
    }

    async fn list_by_type(
        &self,
        conversation_type: ConversationType,
    ) -> AppResult<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(
            "SELECT * FROM conversations WHERE type = $1 ORDER BY minimum_role, created_at",
        )
        .bind(conversation_type)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        page: PageRequest,
        type_filter: Option<ConversationType>,
    ) -> AppResult<(Vec<ConversationSummary>, i64)> {
        let total: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM conversations c
            JOIN participants p ON c.id = p.conversation_id
            WHERE p.user_id = $1 AND p.left_at IS NULL
            AND ($2::conversation_type IS NULL OR c.type = $2)
            "#,
        )
        .bind(user_id)
        .bind(type_filter)
        .fetch_one(&self.db)
        .await?;

        let rows: Vec<ConversationRow> = sqlx::query_as(
            r#"
            SELECT c.* FROM conversations c
            JOIN participants p ON c.id = p.conversation_id
            WHERE p.user_id = $1 AND p.left_at IS NULL
            AND ($2::conversation_type IS NULL OR c.type = $2)
            ORDER BY COALESCE(c.last_message_at, c.created_at) DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(type_filter)
        .bind(page.limit as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.db)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation: Conversation = row.into();
            let last_message = self.last_message(conversation.id).await?;
            let unread_count = self.unread_count(conversation.id, user_id).await?;
            let participant_count = self.count_active_participants(conversation.id).await?;
            items.push(ConversationSummary {
                conversation,
                last_message,
                unread_count,
                participant_count,
            });
        }

        Ok((items, total.0))
    }

    async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Participant>> {
        let rows: Vec<ParticipantRow> = sqlx::query_as(
            "SELECT * FROM participants WHERE conversation_id = $1 AND left_at IS NULL ORDER BY joined_at",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>> {
        let row: Option<ParticipantRow> = sqlx::query_as(
            "SELECT * FROM participants WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn add_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
    ) -> AppResult<(Participant, bool)> {
        if self.get_conversation(conversation_id).await?.is_none() {
            return Err(AppError::ConversationNotFound);
        }

        let inserted: Option<ParticipantRow> = sqlx::query_as(
            r#"
            INSERT INTO participants (id, conversation_id, user_id, role, joined_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (conversation_id, user_id) WHERE left_at IS NULL DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(user_id)
        .bind(role)
        .fetch_optional(&self.db)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = self
            .get_participant(conversation_id, user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("participant row vanished after conflict"))?;
        Ok((existing, false))
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE participants SET left_at = NOW() WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM participants WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.is_some())
    }

    async fn count_active_participants(&self, conversation_id: Uuid) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM participants WHERE conversation_id = $1 AND left_at IS NULL",
        )
        .bind(conversation_id)
        .fetch_one(&self.db)
        .await?;
        Ok(count.0)
    }

    async fn update_last_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<DateTime<Utc>>> {
        // GREATEST skips NULL, so a fresh cursor becomes now().
        let cursor: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            UPDATE participants SET last_read_at = GREATEST(last_read_at, clock_timestamp())
            WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL
            RETURNING last_read_at
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(cursor.map(|c| c.0))
    }

    async fn incident_exists(&self, incident_id: Uuid) -> AppResult<bool> {
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM incidents WHERE id = $1)")
            .bind(incident_id)
            .fetch_one(&self.db)
            .await?;
        Ok(exists.0)
    }
}

#[async_trait]
impl MessageStore for PgChatStore {
    async fn send(&self, new: NewMessage) -> AppResult<Message> {
        let mut tx = self.db.begin().await?;

        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM conversations WHERE id = $1 FOR UPDATE")
                .bind(new.conversation_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(AppError::ConversationNotFound);
        }

        let row: MessageRow = sqlx::query_as(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, content, message_type, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, clock_timestamp())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.conversation_id)
        .bind(new.sender_id)
        .bind(&new.content)
        .bind(new.message_type)
        .bind(&new.metadata)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET last_message_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(new.conversation_id)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE participants SET last_read_at = GREATEST(last_read_at, $3)
            WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL
            "#,
        )
        .bind(new.conversation_id)
        .bind(new.sender_id)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(row.into())
    }

    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        query: MessageQuery,
    ) -> AppResult<(Vec<Message>, i64)> {
        let total: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE conversation_id = $1
            AND ($2::timestamptz IS NULL OR created_at < $2)
            AND ($3::timestamptz IS NULL OR created_at > $3)
            "#,
        )
        .bind(conversation_id)
        .bind(query.before)
        .bind(query.after)
        .fetch_one(&self.db)
        .await?;

        let offset = (query.page.max(1) as i64 - 1) * query.limit as i64;
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = $1
            AND ($2::timestamptz IS NULL OR created_at < $2)
            AND ($3::timestamptz IS NULL OR created_at > $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(conversation_id)
        .bind(query.before)
        .bind(query.after)
        .bind(query.limit as i64)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        let mut messages: Vec<Message> = rows.into_iter().map(Into::into).collect();
        messages.reverse();
        Ok((messages, total.0))
    }

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT * FROM messages WHERE conversation_id = $1 AND deleted_at IS NULL ORDER BY created_at DESC LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn soft_delete(&self, id: Uuid) -> AppResult<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            UPDATE messages SET content = $2, metadata = NULL, deleted_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(DELETED_MESSAGE_TOMBSTONE)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages m
            JOIN participants p ON p.conversation_id = m.conversation_id
                AND p.user_id = $2 AND p.left_at IS NULL
            WHERE m.conversation_id = $1 AND m.sender_id != $2 AND m.deleted_at IS NULL
            AND m.created_at > COALESCE(p.last_read_at, 'epoch'::timestamptz)
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.db)
        .await?;
        Ok(count.0)
    }

    async fn unread_per_conversation(&self, user_id: Uuid) -> AppResult<Vec<UnreadCount>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT m.conversation_id, COUNT(*) FROM messages m
            JOIN participants p ON p.conversation_id = m.conversation_id
                AND p.user_id = $1 AND p.left_at IS NULL
            WHERE m.sender_id != $1 AND m.deleted_at IS NULL
            AND m.created_at > COALESCE(p.last_read_at, 'epoch'::timestamptz)
            GROUP BY m.conversation_id
            ORDER BY m.conversation_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(conversation_id, count)| UnreadCount {
                conversation_id,
                count,
            })
            .collect())
    }
}
