//! PostgreSQL row store.
//!
//! Every committed write is followed by a change event on Redis so that subscribed
//! clients (including the writer's own other devices) converge. Publishing happens
//! after commit and its failure is logged only: the row is already durable and
//! clients re-fetch on resync.

use super::RemoteStore;
use crate::error::{AppError, AppResult, ValidationError};
use crate::models::{
    Attachment, Conversation, ConversationKind, ConversationSnapshot, MemberFlags, MemberState,
    Message, MessageKind, MessagePatch, NewMessage, Participant,
};
use crate::realtime::pubsub::publish_event;
use crate::realtime::ChangeEvent;
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::collections::HashMap;
use tokio_postgres::types::Json;
use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, body, kind, reply_to, attachments, \
     client_token, created_at, edited_at, is_deleted, is_pinned";

const CONVERSATION_COLUMNS: &str = "id, kind, business_id, name, last_message_id, \
     last_message_preview, last_message_at, created_at";

#[derive(Clone)]
pub struct PgRemoteStore {
    pool: Pool,
    publisher: Option<RedisClient>,
}

impl PgRemoteStore {
    pub fn new(pool: Pool, publisher: Option<RedisClient>) -> Self {
        Self { pool, publisher }
    }

    async fn publish(&self, event: ChangeEvent) {
        let Some(redis) = &self.publisher else {
            return;
        };
        let conversation_id = event.conversation_id();
        let members = match self.member_ids(conversation_id).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(%conversation_id, error = %e, "cannot resolve members for fan-out");
                return;
            }
        };
        if let Err(e) = publish_event(redis, &event, &members).await {
            tracing::warn!(
                %conversation_id,
                event_type = event.event_type(),
                error = %e,
                "change event publish failed"
            );
        }
    }

    async fn member_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT user_id FROM conversation_members WHERE conversation_id = $1",
                &[&conversation_id],
            )
            .await?;
        rows.iter()
            .map(|r| r.try_get("user_id"))
            .collect::<Result<_, _>>()
            .map_err(AppError::from)
    }

    async fn load_conversation<C: GenericClient + Sync>(client: &C, id: Uuid) -> AppResult<Conversation> {
        let row = client
            .query_opt(
                format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1").as_str(),
                &[&id],
            )
            .await?
            .ok_or(AppError::NotFound)?;
        let mut participants = Self::load_participants(client, &[id]).await?;
        conversation_from_row(&row, participants.remove(&id).unwrap_or_default())
    }

    async fn load_participants<C: GenericClient + Sync>(
        client: &C,
        ids: &[Uuid],
    ) -> AppResult<HashMap<Uuid, Vec<Participant>>> {
        let rows = client
            .query(
                r#"
                SELECT conversation_id, user_id, display_name
                FROM conversation_members
                WHERE conversation_id = ANY($1)
                ORDER BY joined_at, user_id
                "#,
                &[&ids],
            )
            .await?;
        let mut by_conversation: HashMap<Uuid, Vec<Participant>> = HashMap::new();
        for row in rows {
            by_conversation
                .entry(row.try_get("conversation_id")?)
                .or_default()
                .push(Participant {
                    user_id: row.try_get("user_id")?,
                    display_name: row.try_get("display_name")?,
                });
        }
        Ok(by_conversation)
    }

    async fn load_member<C: GenericClient + Sync>(
        client: &C,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<MemberState> {
        let row = client
            .query_opt(
                r#"
                SELECT m.conversation_id, m.user_id, m.last_read_at, m.delivered_at,
                       m.archived, m.muted,
                       (SELECT COUNT(*) FROM messages x
                         WHERE x.conversation_id = m.conversation_id
                           AND x.sender_id <> m.user_id
                           AND NOT x.is_deleted
                           AND (m.last_read_at IS NULL OR x.created_at > m.last_read_at))::int
                         AS unread_count
                FROM conversation_members m
                WHERE m.conversation_id = $1 AND m.user_id = $2
                "#,
                &[&conversation_id, &user_id],
            )
            .await?
            .ok_or(AppError::NotFound)?;
        member_from_row(&row)
    }

    async fn create_conversation(
        &self,
        kind: ConversationKind,
        scope: Option<Uuid>,
        name: Option<&str>,
        direct_key: Option<String>,
        members: &[Participant],
    ) -> AppResult<(Conversation, bool)> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let inserted = tx
            .query_opt(
                r#"
                INSERT INTO conversations (id, kind, business_id, name, direct_key)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (direct_key) DO NOTHING
                RETURNING id
                "#,
                &[&Uuid::new_v4(), &kind.as_str(), &scope, &name, &direct_key],
            )
            .await?;

        let (id, created) = match inserted {
            Some(row) => (row.try_get::<_, Uuid>("id")?, true),
            None => {
                let row = tx
                    .query_one("SELECT id FROM conversations WHERE direct_key = $1", &[&direct_key])
                    .await?;
                (row.try_get::<_, Uuid>("id")?, false)
            }
        };

        if created {
            for member in members {
                tx.execute(
                    r#"
                    INSERT INTO conversation_members (conversation_id, user_id, display_name)
                    VALUES ($1, $2, $3)
                    ON CONFLICT DO NOTHING
                    "#,
                    &[&id, &member.user_id, &member.display_name],
                )
                .await?;
            }
        }

        let conversation = Self::load_conversation(&*tx, id).await?;
        tx.commit().await?;
        Ok((conversation, created))
    }

    async fn update_member(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        statement: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> AppResult<()> {
        let client = self.pool.get().await?;
        let updated = client.execute(statement, params).await?;
        if updated == 0 {
            return Err(AppError::NotFound);
        }
        let member = Self::load_member(&**client, conversation_id, user_id).await?;
        drop(client);
        self.publish(ChangeEvent::MemberUpdated { member }).await;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for PgRemoteStore {
    async fn list_conversations(
        &self,
        user_id: Uuid,
        scope: Option<Uuid>,
    ) -> AppResult<Vec<ConversationSnapshot>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT c.id, c.kind, c.business_id, c.name, c.last_message_id,
                       c.last_message_preview, c.last_message_at, c.created_at
                FROM conversations c
                JOIN conversation_members m ON m.conversation_id = c.id AND m.user_id = $1
                WHERE ($2::uuid IS NULL OR c.business_id = $2)
                ORDER BY c.last_message_at DESC NULLS LAST, c.id
                "#,
                &[&user_id, &scope],
            )
            .await?;

        let ids = rows
            .iter()
            .map(|r| r.try_get("id"))
            .collect::<Result<Vec<Uuid>, _>>()?;
        let mut participants = Self::load_participants(&**client, &ids).await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let conversation = conversation_from_row(row, participants.remove(&id).unwrap_or_default())?;
            let membership = Self::load_member(&**client, id, user_id).await?;
            snapshots.push(ConversationSnapshot {
                conversation,
                membership,
            });
        }
        tracing::debug!(%user_id, count = snapshots.len(), "conversations listed");
        Ok(snapshots)
    }

    async fn find_or_create_direct(
        &self,
        scope: Option<Uuid>,
        initiator: Participant,
        recipient: Participant,
    ) -> AppResult<Conversation> {
        if initiator.user_id == recipient.user_id {
            return Err(AppError::Conflict("cannot start a conversation with yourself".into()));
        }
        let key = Conversation::direct_key(scope, initiator.user_id, recipient.user_id);
        let (conversation, created) = self
            .create_conversation(
                ConversationKind::Direct,
                scope,
                None,
                Some(key),
                &[initiator, recipient],
            )
            .await?;
        if created {
            tracing::info!(conversation_id = %conversation.id, "direct conversation created");
            self.publish(ChangeEvent::ConversationUpserted {
                conversation: conversation.clone(),
            })
            .await;
        }
        Ok(conversation)
    }

    async fn create_group(
        &self,
        scope: Option<Uuid>,
        name: &str,
        members: Vec<Participant>,
    ) -> AppResult<Conversation> {
        let name = name.trim();
        let name = (!name.is_empty()).then_some(name);
        let (conversation, _) = self
            .create_conversation(ConversationKind::Group, scope, name, None, &members)
            .await?;
        tracing::info!(conversation_id = %conversation.id, members = members.len(), "group created");
        self.publish(ChangeEvent::ConversationUpserted {
            conversation: conversation.clone(),
        })
        .await;
        Ok(conversation)
    }

    async fn fetch_messages(&self, conversation_id: Uuid, limit: usize) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let exists = client
            .query_opt("SELECT 1 FROM conversations WHERE id = $1", &[&conversation_id])
            .await?;
        if exists.is_none() {
            return Err(AppError::NotFound);
        }
        let rows = client
            .query(
                format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS} FROM (
                        SELECT {MESSAGE_COLUMNS} FROM messages
                        WHERE conversation_id = $1
                        ORDER BY created_at DESC, id DESC
                        LIMIT $2
                    ) page
                    ORDER BY created_at, id
                    "#
                ).as_str(),
                &[&conversation_id, &(limit as i64)],
            )
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn fetch_members(&self, conversation_id: Uuid) -> AppResult<Vec<MemberState>> {
        let client = self.pool.get().await?;
        let ids = client
            .query(
                "SELECT user_id FROM conversation_members WHERE conversation_id = $1",
                &[&conversation_id],
            )
            .await?;
        if ids.is_empty() {
            return Err(AppError::NotFound);
        }
        let mut members = Vec::with_capacity(ids.len());
        for row in ids {
            members.push(Self::load_member(&**client, conversation_id, row.try_get("user_id")?).await?);
        }
        Ok(members)
    }

    async fn insert_message(&self, message: NewMessage) -> AppResult<Message> {
        let select_by_token = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE client_token = $1");

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        if let Some(row) = tx.query_opt(select_by_token.as_str(), &[&message.client_token]).await? {
            return message_from_row(&row);
        }

        let member = tx
            .query_opt(
                "SELECT 1 FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
                &[&message.conversation_id, &message.sender_id],
            )
            .await?;
        if member.is_none() {
            return Err(AppError::NotFound);
        }

        if let Some(reply_to) = message.reply_to {
            let target = tx
                .query_opt(
                    "SELECT 1 FROM messages WHERE id = $1 AND conversation_id = $2",
                    &[&reply_to, &message.conversation_id],
                )
                .await?;
            if target.is_none() {
                return Err(ValidationError::InvalidReply(reply_to).into());
            }
        }

        let inserted = tx
            .query_opt(
                format!(
                    r#"
                    INSERT INTO messages
                        (id, conversation_id, sender_id, body, kind, reply_to, attachments, client_token)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (client_token) DO NOTHING
                    RETURNING {MESSAGE_COLUMNS}
                    "#
                ).as_str(),
                &[
                    &Uuid::new_v4(),
                    &message.conversation_id,
                    &message.sender_id,
                    &message.body,
                    &message.kind.as_str(),
                    &message.reply_to,
                    &Json(&message.attachments),
                    &message.client_token,
                ],
            )
            .await?;

        let row = match inserted {
            Some(row) => message_from_row(&row)?,
            // a concurrent retry with the same token won the race
            None => {
                let row = tx.query_one(select_by_token.as_str(), &[&message.client_token]).await?;
                return message_from_row(&row);
            }
        };

        tx.execute(
            r#"
            UPDATE conversations
            SET last_message_id = $2, last_message_preview = $3, last_message_at = $4
            WHERE id = $1 AND (last_message_at IS NULL OR last_message_at <= $4)
            "#,
            &[&row.conversation_id, &row.id, &row.preview_text(), &row.created_at],
        )
        .await?;
        let conversation = Self::load_conversation(&*tx, row.conversation_id).await?;
        tx.commit().await?;
        drop(client);

        tracing::debug!(conversation_id = %row.conversation_id, message_id = %row.id, "message inserted");
        self.publish(ChangeEvent::MessageInserted { message: row.clone() }).await;
        self.publish(ChangeEvent::ConversationUpserted { conversation }).await;
        Ok(row)
    }

    async fn update_message(&self, message_id: Uuid, patch: MessagePatch) -> AppResult<Message> {
        let client = self.pool.get().await?;
        let row = match &patch {
            MessagePatch::Edit { body, edited_at } => {
                client
                    .query_opt(
                        format!(
                            "UPDATE messages SET body = $2, edited_at = $3 \
                             WHERE id = $1 AND NOT is_deleted RETURNING {MESSAGE_COLUMNS}"
                        ).as_str(),
                        &[&message_id, body, edited_at],
                    )
                    .await?
            }
            MessagePatch::SoftDelete => {
                client
                    .query_opt(
                        format!(
                            "UPDATE messages SET is_deleted = TRUE, body = NULL, attachments = '[]'::jsonb \
                             WHERE id = $1 RETURNING {MESSAGE_COLUMNS}"
                        ).as_str(),
                        &[&message_id],
                    )
                    .await?
            }
            MessagePatch::Pin(pinned) => {
                client
                    .query_opt(
                        format!("UPDATE messages SET is_pinned = $2 WHERE id = $1 RETURNING {MESSAGE_COLUMNS}").as_str(),
                        &[&message_id, pinned],
                    )
                    .await?
            }
        };
        let message = message_from_row(&row.ok_or(AppError::NotFound)?)?;

        client
            .execute(
                "UPDATE conversations SET last_message_preview = $3 WHERE id = $1 AND last_message_id = $2",
                &[&message.conversation_id, &message.id, &message.preview_text()],
            )
            .await?;
        drop(client);

        self.publish(ChangeEvent::MessageUpdated {
            message: message.clone(),
        })
        .await;
        Ok(message)
    }

    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        self.update_member(
            conversation_id,
            user_id,
            r#"
            UPDATE conversation_members
            SET last_read_at = GREATEST(COALESCE(last_read_at, $3), $3),
                delivered_at = GREATEST(COALESCE(delivered_at, $3), $3)
            WHERE conversation_id = $1 AND user_id = $2
            "#,
            &[&conversation_id, &user_id, &at],
        )
        .await
    }

    async fn mark_delivered(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.update_member(
            conversation_id,
            user_id,
            r#"
            UPDATE conversation_members
            SET delivered_at = GREATEST(COALESCE(delivered_at, $3), $3)
            WHERE conversation_id = $1 AND user_id = $2
            "#,
            &[&conversation_id, &user_id, &at],
        )
        .await
    }

    async fn set_member_flags(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        flags: MemberFlags,
    ) -> AppResult<()> {
        self.update_member(
            conversation_id,
            user_id,
            r#"
            UPDATE conversation_members
            SET archived = COALESCE($3, archived),
                muted = COALESCE($4, muted)
            WHERE conversation_id = $1 AND user_id = $2
            "#,
            &[&conversation_id, &user_id, &flags.archived, &flags.muted],
        )
        .await
    }
}

fn conversation_from_row(row: &Row, participants: Vec<Participant>) -> AppResult<Conversation> {
    let kind: String = row.try_get("kind")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        kind: ConversationKind::parse(&kind),
        business_id: row.try_get("business_id")?,
        name: row.try_get("name")?,
        participants,
        last_message_id: row.try_get("last_message_id")?,
        last_message_preview: row.try_get("last_message_preview")?,
        last_message_at: row.try_get("last_message_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn member_from_row(row: &Row) -> AppResult<MemberState> {
    let unread: i32 = row.try_get("unread_count")?;
    Ok(MemberState {
        conversation_id: row.try_get("conversation_id")?,
        user_id: row.try_get("user_id")?,
        last_read_at: row.try_get("last_read_at")?,
        delivered_at: row.try_get("delivered_at")?,
        archived: row.try_get("archived")?,
        muted: row.try_get("muted")?,
        unread_count: unread.max(0) as u32,
    })
}

fn message_from_row(row: &Row) -> AppResult<Message> {
    let kind: String = row.try_get("kind")?;
    let Json(attachments): Json<Vec<Attachment>> = row.try_get("attachments")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        body: row.try_get("body")?,
        kind: MessageKind::parse(&kind),
        reply_to: row.try_get("reply_to")?,
        attachments,
        client_token: row.try_get("client_token")?,
        created_at: row.try_get("created_at")?,
        edited_at: row.try_get("edited_at")?,
        is_deleted: row.try_get("is_deleted")?,
        is_pinned: row.try_get("is_pinned")?,
        local: None,
    })
}
