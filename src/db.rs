use crate::constants::DB_PRAGMAS;
use crate::types::{Result, StoredMessage, StoredMessageRecord, StratusError, UserId};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;
use uuid::Uuid;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(StratusError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(StratusError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(StratusError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(StratusError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// --- IDENTITY ---

pub async fn lookup_session(pool: &DbPool, token: &str) -> Result<Option<UserId>> {
    let row = sqlx::query(
        "SELECT user_id FROM sessions WHERE token = ? AND expires_at > datetime('now')",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| UserId(r.get(0))))
}

/// Removes the user together with their sessions and chats in one
/// transaction.
pub async fn delete_user_account(pool: &DbPool, user_id: &UserId) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chats WHERE user_id = ?")
        .bind(&user_id.0)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(&user_id.0)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(&user_id.0)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// --- CHATS ---

#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub messages: Vec<StoredMessage>,
}

pub async fn create_chat(pool: &DbPool, user_id: &UserId, title: &str) -> Result<ChatSummary> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO chats (id, user_id, title, messages, created_at, updated_at) VALUES (?, ?, ?, '[]', ?, ?)",
    )
    .bind(&id)
    .bind(&user_id.0)
    .bind(title)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(ChatSummary {
        id,
        title: title.to_string(),
        created_at: now.clone(),
        updated_at: now,
        messages: Vec::new(),
    })
}

pub async fn list_chats(pool: &DbPool, user_id: &UserId) -> Result<Vec<ChatSummary>> {
    let rows = sqlx::query(
        "SELECT id, title, created_at, updated_at, messages FROM chats WHERE user_id = ? ORDER BY updated_at DESC",
    )
    .bind(&user_id.0)
    .fetch_all(pool)
    .await?;

    let mut chats = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.get(0);
        let raw: String = row.get(4);
        chats.push(ChatSummary {
            messages: crate::persistence::normalize_stored(parse_message_document(&id, &raw)),
            id,
            title: row.get(1),
            created_at: row.get(2),
            updated_at: row.get(3),
        });
    }
    Ok(chats)
}

pub async fn chat_owner(pool: &DbPool, chat_id: &str) -> Result<Option<UserId>> {
    let row = sqlx::query("SELECT user_id FROM chats WHERE id = ?")
        .bind(chat_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| UserId(r.get(0))))
}

pub async fn delete_chat(pool: &DbPool, user_id: &UserId, chat_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM chats WHERE id = ? AND user_id = ?")
        .bind(chat_id)
        .bind(&user_id.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Loads a chat's message document in its raw, possibly-legacy shape.
/// Callers normalize via `persistence::normalize_stored`.
pub async fn load_chat_messages(
    pool: &DbPool,
    chat_id: &str,
) -> Result<Vec<StoredMessageRecord>> {
    let row = sqlx::query("SELECT messages FROM chats WHERE id = ?")
        .bind(chat_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => {
            let raw: String = r.get(0);
            Ok(parse_message_document(chat_id, &raw))
        }
        None => Ok(Vec::new()),
    }
}

/// The one place a non-array or malformed stored document is tolerated:
/// it degrades to an empty list with a warning instead of leaking
/// duck-typing into business logic.
fn parse_message_document(chat_id: &str, raw: &str) -> Vec<StoredMessageRecord> {
    match serde_json::from_str::<Vec<StoredMessageRecord>>(raw) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(
                "[💾 ] Chat {} has a malformed message document ({}); treating as empty",
                crate::str_utils::prefix_chars(chat_id, 8),
                e
            );
            Vec::new()
        }
    }
}

pub async fn store_chat_messages(
    pool: &DbPool,
    chat_id: &str,
    messages: &[StoredMessage],
    title: Option<&str>,
) -> Result<()> {
    let document = serde_json::to_string(messages)?;
    let now = chrono::Utc::now().to_rfc3339();

    match title {
        Some(t) => {
            sqlx::query("UPDATE chats SET messages = ?, title = ?, updated_at = ? WHERE id = ?")
                .bind(&document)
                .bind(t)
                .bind(&now)
                .bind(chat_id)
                .execute(pool)
                .await?;
        }
        None => {
            sqlx::query("UPDATE chats SET messages = ?, updated_at = ? WHERE id = ?")
                .bind(&document)
                .bind(&now)
                .bind(chat_id)
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

/// Updates the title of a chat the user owns; returns the stored title, or
/// `None` when the chat does not exist or belongs to someone else.
pub async fn update_chat_title(
    pool: &DbPool,
    user_id: &UserId,
    chat_id: &str,
    title: &str,
) -> Result<Option<String>> {
    let result = sqlx::query("UPDATE chats SET title = ?, updated_at = ? WHERE id = ? AND user_id = ?")
        .bind(title)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(chat_id)
        .bind(&user_id.0)
        .execute(pool)
        .await?;

    if result.rows_affected() > 0 {
        Ok(Some(title.to_string()))
    } else {
        Ok(None)
    }
}
