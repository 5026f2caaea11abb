//! Database utilities and the Postgres-backed store

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::{str::FromStr, time::Duration};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    ActivityStore, MessageStore, ReadMarkerStore, SettingsStore, TicketStore, TypingStore,
};
use crate::types::{
    ActivityRecord, Attachment, AuthorRole, CloseOutcome, ConversationId, EditFields, Message,
    MessageEdit, MessageId, NewActivity, NewMessage, ReplySummary, TicketId, TicketLifecycle,
    TicketStatus, TypingFact, UnknownVariant, UserId,
};

/// Create a database connection pool
/// Note: Disables statement cache for PgBouncer compatibility
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    // PgBouncer in transaction mode doesn't support prepared statements
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(300))
        .connect_with(options)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                match db_err.code().as_deref() {
                    // insufficient_privilege, raised by row-level security
                    Some("42501") => StoreError::PermissionDenied(message),
                    // undefined_column
                    Some("42703") => StoreError::UndefinedColumn(message),
                    // integrity constraint violations
                    Some(code) if code.starts_with("23") => StoreError::Constraint(message),
                    _ => StoreError::Database(message),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        StoreError::Database(err.to_string())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    author_id: Uuid,
    author_name: String,
    author_role: String,
    body: String,
    attachments: Json<Vec<Attachment>>,
    audio_url: Option<String>,
    audio_duration_secs: Option<i32>,
    reply_to: Option<Uuid>,
    created_at: OffsetDateTime,
    edited: bool,
    edited_at: Option<OffsetDateTime>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: MessageId::Server(row.id),
            conversation_id: ConversationId(row.conversation_id),
            author_id: UserId(row.author_id),
            author_name: row.author_name,
            author_role: row.author_role.parse::<AuthorRole>()?,
            body: row.body,
            attachments: row.attachments.0,
            audio_url: row.audio_url,
            audio_duration_secs: row.audio_duration_secs.and_then(|s| u32::try_from(s).ok()),
            reply_to: row.reply_to,
            reply_preview: None,
            created_at: row.created_at,
            edited: row.edited,
            edited_at: row.edited_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ActivityRow {
    id: Uuid,
    ticket_id: Uuid,
    activity_type: String,
    actor_id: Option<Uuid>,
    description: String,
    created_at: Option<OffsetDateTime>,
}

impl From<ActivityRow> for ActivityRecord {
    fn from(row: ActivityRow) -> Self {
        ActivityRecord {
            id: row.id,
            ticket_id: TicketId(row.ticket_id),
            activity_type: row.activity_type,
            actor_id: row.actor_id.map(UserId),
            description: row.description,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct LifecycleRow {
    id: Uuid,
    status: String,
    resolved_at: Option<OffsetDateTime>,
    closed_at: Option<OffsetDateTime>,
    reopen_count: i32,
}

impl TryFrom<LifecycleRow> for TicketLifecycle {
    type Error = StoreError;

    fn try_from(row: LifecycleRow) -> Result<Self, Self::Error> {
        Ok(TicketLifecycle {
            ticket_id: TicketId(row.id),
            status: row.status.parse::<TicketStatus>()?,
            resolved_at: row.resolved_at,
            closed_at: row.closed_at,
            reopen_count: row.reopen_count,
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, author_id, author_name, author_role, body, \
     attachments, audio_url, audio_duration_secs, reply_to, created_at, edited, edited_at";

const LIFECYCLE_COLUMNS: &str = "id, status, resolved_at, closed_at, reopen_count";

// =============================================================================
// Postgres store
// =============================================================================

/// Store implementation backed by Postgres
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn insert_message(&self, message: &NewMessage) -> StoreResult<Message> {
        let query = format!(
            r#"
            INSERT INTO ticket_messages
                (conversation_id, author_id, author_name, author_role, body,
                 attachments, audio_url, audio_duration_secs, reply_to)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        );

        let row: MessageRow = sqlx::query_as(&query)
            .bind(message.conversation_id.0)
            .bind(message.author_id.0)
            .bind(&message.author_name)
            .bind(message.author_role.as_str())
            .bind(&message.body)
            .bind(Json(&message.attachments))
            .bind(&message.audio_url)
            .bind(message.audio_duration_secs.map(|s| s as i32))
            .bind(message.reply_to)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn update_message(&self, id: Uuid, edit: &MessageEdit) -> StoreResult<Message> {
        let row: MessageRow = match edit.fields {
            EditFields::Full => {
                let query = format!(
                    r#"
                    UPDATE ticket_messages
                    SET body = $2, edited = TRUE, edited_at = $3
                    WHERE id = $1
                    RETURNING {}
                    "#,
                    MESSAGE_COLUMNS
                );
                sqlx::query_as(&query)
                    .bind(id)
                    .bind(&edit.body)
                    .bind(edit.edited_at)
                    .fetch_one(&self.pool)
                    .await?
            }
            EditFields::BodyOnly => {
                sqlx::query_as(
                    r#"
                    UPDATE ticket_messages
                    SET body = $2
                    WHERE id = $1
                    RETURNING id, conversation_id, author_id, author_name, author_role, body,
                              attachments, audio_url, audio_duration_secs, reply_to, created_at,
                              FALSE AS edited, NULL::timestamptz AS edited_at
                    "#,
                )
                .bind(id)
                .bind(&edit.body)
                .fetch_one(&self.pool)
                .await?
            }
        };

        row.try_into()
    }

    async fn message_summary(&self, id: Uuid) -> StoreResult<Option<ReplySummary>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT author_name, LEFT(body, 80) FROM ticket_messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(author_name, snippet)| ReplySummary {
            message_id: id,
            author_name,
            snippet,
        }))
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        let query = format!(
            "SELECT {} FROM ticket_messages WHERE conversation_id = $1 ORDER BY created_at ASC",
            MESSAGE_COLUMNS
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&query)
            .bind(conversation_id.0)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Message::try_from).collect()
    }
}

#[async_trait]
impl ActivityStore for PgStore {
    async fn record_activity(&self, activity: &NewActivity) -> StoreResult<ActivityRecord> {
        let row: ActivityRow = sqlx::query_as(
            r#"
            INSERT INTO ticket_activity (ticket_id, activity_type, actor_id, description)
            VALUES ($1, $2, $3, $4)
            RETURNING id, ticket_id, activity_type, actor_id, description, created_at
            "#,
        )
        .bind(activity.ticket_id.0)
        .bind(&activity.activity_type)
        .bind(activity.actor_id.map(|a| a.0))
        .bind(&activity.description)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn list_activity(&self, ticket_id: TicketId) -> StoreResult<Vec<ActivityRecord>> {
        let rows: Vec<ActivityRow> = sqlx::query_as(
            r#"
            SELECT id, ticket_id, activity_type, actor_id, description, created_at
            FROM ticket_activity
            WHERE ticket_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(ticket_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ActivityRecord::from).collect())
    }
}

#[async_trait]
impl TicketStore for PgStore {
    async fn fetch_lifecycle(&self, ticket_id: TicketId) -> StoreResult<Option<TicketLifecycle>> {
        let query = format!("SELECT {} FROM support_tickets WHERE id = $1", LIFECYCLE_COLUMNS);
        let row: Option<LifecycleRow> = sqlx::query_as(&query)
            .bind(ticket_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TicketLifecycle::try_from).transpose()
    }

    async fn list_resolved(&self) -> StoreResult<Vec<TicketLifecycle>> {
        let query = format!(
            "SELECT {} FROM support_tickets WHERE status = 'resolved' AND closed_at IS NULL",
            LIFECYCLE_COLUMNS
        );
        let rows: Vec<LifecycleRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;

        rows.into_iter().map(TicketLifecycle::try_from).collect()
    }

    async fn close_if_resolved(
        &self,
        ticket_id: TicketId,
        closed_at: OffsetDateTime,
    ) -> StoreResult<CloseOutcome> {
        let query = format!(
            r#"
            UPDATE support_tickets
            SET status = 'closed', closed_at = $2, updated_at = NOW()
            WHERE id = $1
              AND status = 'resolved'
              AND resolved_at IS NOT NULL
              AND closed_at IS NULL
            RETURNING {}
            "#,
            LIFECYCLE_COLUMNS
        );
        let row: Option<LifecycleRow> = sqlx::query_as(&query)
            .bind(ticket_id.0)
            .bind(closed_at)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(CloseOutcome::Closed(row.try_into()?)),
            None => Ok(CloseOutcome::NotEligible {
                current: self.fetch_lifecycle(ticket_id).await?,
            }),
        }
    }
}

#[async_trait]
impl TypingStore for PgStore {
    async fn upsert_typing(&self, fact: &TypingFact) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ticket_typing_indicators
                (conversation_id, user_id, user_name, role, is_typing, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (conversation_id, user_id) DO UPDATE SET
              user_name = EXCLUDED.user_name,
              is_typing = EXCLUDED.is_typing,
              updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(fact.conversation_id.0)
        .bind(fact.user_id.0)
        .bind(&fact.user_name)
        .bind(fact.role.as_str())
        .bind(fact.is_typing)
        .bind(fact.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM ticket_typing_indicators WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ReadMarkerStore for PgStore {
    async fn write_read_marker(
        &self,
        agent_id: UserId,
        ticket_id: TicketId,
        read_at: OffsetDateTime,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ticket_read_markers (agent_id, ticket_id, read_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (agent_id, ticket_id) DO UPDATE SET
              read_at = GREATEST(ticket_read_markers.read_at, EXCLUDED.read_at)
            "#,
        )
        .bind(agent_id.0)
        .bind(ticket_id.0)
        .bind(read_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn read_markers(&self, agent_id: UserId) -> StoreResult<Vec<(TicketId, OffsetDateTime)>> {
        let rows: Vec<(Uuid, OffsetDateTime)> = sqlx::query_as(
            "SELECT ticket_id, read_at FROM ticket_read_markers WHERE agent_id = $1",
        )
        .bind(agent_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(ticket_id, read_at)| (TicketId(ticket_id), read_at))
            .collect())
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM system_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }
}
