use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{AgentId, ConversationId, MessageId, Role, UserId},
    protocol::{Agent, ConversationPayload, MessagePayload},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub title: String,
    pub pinned: bool,
    pub last_message_preview: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredConversation {
    pub fn to_payload(&self) -> ConversationPayload {
        ConversationPayload {
            id: self.id,
            title: self.title.clone(),
            updated_at: self.updated_at,
            pinned: self.pinned,
            agent_id: self.agent_id,
            last_message_preview: self.last_message_preview.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn to_payload(&self) -> MessagePayload {
        MessagePayload {
            id: self.id,
            role: self.role,
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAgent<'a> {
    pub name: &'a str,
    pub avatar_url: Option<&'a str>,
    pub is_default: bool,
    pub model: &'a str,
    pub model_provider: &'a str,
}

const CONVERSATION_COLUMNS: &str =
    "id, user_id, agent_id, title, pinned, last_message_preview, created_at, updated_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` is a separate database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts the agent, or refreshes its metadata when the name already exists.
    pub async fn upsert_agent(&self, agent: &NewAgent<'_>) -> Result<AgentId> {
        let mut tx = self.pool.begin().await?;
        if agent.is_default {
            sqlx::query("UPDATE agents SET is_default = 0 WHERE name != ?")
                .bind(agent.name)
                .execute(&mut *tx)
                .await?;
        }
        let rec = sqlx::query(
            "INSERT INTO agents (name, avatar_url, is_default, model, model_provider)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                avatar_url = excluded.avatar_url,
                is_default = excluded.is_default,
                model = excluded.model,
                model_provider = excluded.model_provider
             RETURNING id",
        )
        .bind(agent.name)
        .bind(agent.avatar_url)
        .bind(agent.is_default)
        .bind(agent.model)
        .bind(agent.model_provider)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(AgentId(rec.get::<i64, _>(0)))
    }

    pub async fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, name, avatar_url, is_default, model, model_provider FROM agents WHERE id = ?",
        )
        .bind(agent_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Agent {
            agent_id: AgentId(row.get::<i64, _>(0)),
            name: row.get(1),
            avatar_url: row.get(2),
            is_default: row.get::<bool, _>(3),
            model: row.get(4),
            model_provider: row.get(5),
        }))
    }

    pub async fn default_agent(&self) -> Result<Option<AgentId>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM agents WHERE is_default = 1 ORDER BY id LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.map(AgentId))
    }

    pub async fn create_conversation(
        &self,
        user_id: UserId,
        agent_id: AgentId,
        title: &str,
    ) -> Result<StoredConversation> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO conversations (user_id, agent_id, title, pinned, created_at, updated_at)
             VALUES (?, ?, ?, 0, ?, ?)
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(user_id.0)
        .bind(agent_id.0)
        .bind(title)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create conversation for agent {agent_id}"))?;
        conversation_from_row(&row)
    }

    pub async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
        ))
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE user_id = ?
             ORDER BY pinned DESC, updated_at DESC, id DESC"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    /// Applies the provided fields; returns `false` when the conversation does not exist.
    pub async fn update_conversation(
        &self,
        conversation_id: ConversationId,
        title: Option<&str>,
        pinned: Option<bool>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations
             SET title = COALESCE(?, title),
                 pinned = COALESCE(?, pinned)
             WHERE id = ?",
        )
        .bind(title)
        .bind(pinned)
        .bind(conversation_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stores a user message with its reply and moves the conversation's
    /// preview to the reply. Either all three writes land or none do.
    pub async fn record_exchange(
        &self,
        conversation_id: ConversationId,
        user_content: &str,
        reply_content: &str,
        preview: &str,
    ) -> Result<(StoredMessage, StoredMessage)> {
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let user =
            insert_message_row(&mut tx, conversation_id, Role::User, user_content, created_at)
                .await?;
        let reply = insert_message_row(
            &mut tx,
            conversation_id,
            Role::Assistant,
            reply_content,
            created_at,
        )
        .await?;
        sqlx::query(
            "UPDATE conversations SET last_message_preview = ?, updated_at = ? WHERE id = ?",
        )
        .bind(preview)
        .bind(reply.created_at)
        .bind(conversation_id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit()
            .await
            .with_context(|| format!("failed to record exchange in conversation {conversation_id}"))?;
        Ok((user, reply))
    }

    pub async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, role, content, created_at FROM messages
             WHERE conversation_id = ?
             ORDER BY id ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let raw_role: String = row.get(1);
                let role = Role::parse(&raw_role)
                    .ok_or_else(|| anyhow!("unknown message role '{raw_role}'"))?;
                Ok(StoredMessage {
                    id: MessageId(row.get::<i64, _>(0)),
                    conversation_id,
                    role,
                    content: row.get(2),
                    created_at: row.get(3),
                })
            })
            .collect()
    }
}

async fn insert_message_row(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
    role: Role,
    content: &str,
    created_at: DateTime<Utc>,
) -> Result<StoredMessage> {
    let rec = sqlx::query(
        "INSERT INTO messages (conversation_id, role, content, created_at)
         VALUES (?, ?, ?, ?)
         RETURNING id",
    )
    .bind(conversation_id.0)
    .bind(role.as_str())
    .bind(content)
    .bind(created_at)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("failed to store message for conversation {conversation_id}"))?;
    Ok(StoredMessage {
        id: MessageId(rec.get::<i64, _>(0)),
        conversation_id,
        role,
        content: content.to_string(),
        created_at,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<StoredConversation> {
    Ok(StoredConversation {
        id: ConversationId(row.try_get::<i64, _>(0)?),
        user_id: UserId(row.try_get::<i64, _>(1)?),
        agent_id: AgentId(row.try_get::<i64, _>(2)?),
        title: row.try_get(3)?,
        pinned: row.try_get::<bool, _>(4)?,
        last_message_preview: row.try_get(5)?,
        created_at: row.try_get(6)?,
        updated_at: row.try_get(7)?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
