//! Relational storage (C2): raw messages, buffers, cases, history tokens.
//! Job queue storage lives in [`crate::queue`] against the same pool so a
//! worker can commit a queue transition and a storage write atomically.

mod schema;

use crate::domain::{Case, CaseStatus, HistoryToken, RawMessage};
use crate::error::{Result, StorageError};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

/// Connection pool plus schema-bootstrap entry point for the embedded store.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Connect to the configured SQLite database and ensure the schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(StorageError::Connect)?;

        let storage = Self { pool };
        storage.initialize().await?;
        Ok(storage)
    }

    /// Build a storage handle directly from an existing pool (used by tests
    /// and by components that share the pool with the job queue).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize(&self) -> Result<()> {
        schema::bootstrap(&self.pool).await
    }

    /// Insert a `RawMessage`. Returns `true` if a new row was inserted,
    /// `false` if `message_id` already existed (idempotent duplicate).
    pub async fn insert_raw_message(&self, msg: &RawMessage) -> Result<bool> {
        let image_paths_json =
            serde_json::to_string(&msg.image_paths).context("failed to serialize image_paths")?;

        let result = sqlx::query(
            r#"
            INSERT INTO raw_messages
                (message_id, group_id, ts, sender_hash, content_text, image_paths_json, reply_to_id, rag_answered_flag)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(message_id) DO NOTHING
            "#,
        )
        .bind(&msg.message_id)
        .bind(&msg.group_id)
        .bind(msg.ts)
        .bind(&msg.sender_hash)
        .bind(&msg.content_text)
        .bind(&image_paths_json)
        .bind(&msg.reply_to_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert raw message {}", msg.message_id))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_raw_message(&self, message_id: &str) -> Result<Option<RawMessage>> {
        let row = sqlx::query(
            r#"
            SELECT message_id, group_id, ts, sender_hash, content_text, image_paths_json,
                   reply_to_id, rag_answered_flag
            FROM raw_messages WHERE message_id = ?
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to fetch raw message {message_id}"))?;

        row.map(|row| raw_message_from_row(&row)).transpose()
    }

    /// Last-N canonical message lines for a group, oldest-first, for gate/respond context.
    pub async fn last_n_messages_text(&self, group_id: &str, n: i64) -> Result<String> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, group_id, ts, sender_hash, content_text, image_paths_json,
                   reply_to_id, rag_answered_flag
            FROM raw_messages WHERE group_id = ? ORDER BY ts DESC LIMIT ?
            "#,
        )
        .bind(group_id)
        .bind(n)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to fetch last {n} messages for group {group_id}"))?;

        let mut messages = rows
            .into_iter()
            .map(|row| raw_message_from_row(&row))
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();

        Ok(messages
            .iter()
            .map(RawMessage::canonical_line)
            .collect::<String>())
    }

    /// Read the current rolling buffer text for a group (empty string if none yet).
    pub async fn get_buffer(&self, group_id: &str) -> Result<String> {
        let text: Option<String> = sqlx::query_scalar("SELECT text FROM buffers WHERE group_id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read buffer for group {group_id}"))?;
        Ok(text.unwrap_or_default())
    }

    /// Overwrite the buffer text for a group (upsert).
    pub async fn set_buffer(&self, group_id: &str, text: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO buffers (group_id, text, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(group_id) DO UPDATE SET text = excluded.text, updated_at = excluded.updated_at
            "#,
        )
        .bind(group_id)
        .bind(text)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write buffer for group {group_id}"))?;
        Ok(())
    }

    /// Persist a new `Case` row. Duplicate `case_id` (a retried worker) is
    /// treated as idempotent success rather than an error.
    pub async fn insert_case(&self, case: &Case) -> Result<()> {
        let tags_json = serde_json::to_string(&case.tags).context("failed to serialize tags")?;
        let evidence_json =
            serde_json::to_string(&case.evidence_ids).context("failed to serialize evidence_ids")?;

        sqlx::query(
            r#"
            INSERT INTO cases
                (case_id, group_id, status, problem_title, problem_summary, solution_summary,
                 tags_json, evidence_ids_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(case_id) DO NOTHING
            "#,
        )
        .bind(&case.case_id)
        .bind(&case.group_id)
        .bind(case.status.as_str())
        .bind(&case.problem_title)
        .bind(&case.problem_summary)
        .bind(&case.solution_summary)
        .bind(&tags_json)
        .bind(&evidence_json)
        .bind(case.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert case {}", case.case_id))?;
        Ok(())
    }

    pub async fn get_case(&self, case_id: &str) -> Result<Option<Case>> {
        let row = sqlx::query(
            r#"
            SELECT case_id, group_id, status, problem_title, problem_summary, solution_summary,
                   tags_json, evidence_ids_json, created_at
            FROM cases WHERE case_id = ?
            "#,
        )
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to fetch case {case_id}"))?;

        row.map(|row| case_from_row(&row)).transpose()
    }

    /// Most recently created `open` case for a group, if any — the candidate
    /// for the §3.1 resolution check.
    pub async fn latest_open_case(&self, group_id: &str) -> Result<Option<Case>> {
        let row = sqlx::query(
            r#"
            SELECT case_id, group_id, status, problem_title, problem_summary, solution_summary,
                   tags_json, evidence_ids_json, created_at
            FROM cases WHERE group_id = ? AND status = 'open'
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to fetch latest open case for group {group_id}"))?;

        row.map(|row| case_from_row(&row)).transpose()
    }

    /// All case ids currently in storage (used by the reconciler to diff
    /// against the vector index).
    pub async fn all_case_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT case_id FROM cases")
            .fetch_all(&self.pool)
            .await
            .context("failed to list case ids")?;
        Ok(ids)
    }

    /// Cases created after `since` that have no counterpart in the vector
    /// index, keyed by the reconciler's opportunistic re-embed pass.
    pub async fn cases_not_in(&self, excluded_ids: &[String]) -> Result<Vec<Case>> {
        if excluded_ids.is_empty() {
            let rows = sqlx::query(
                r#"
                SELECT case_id, group_id, status, problem_title, problem_summary, solution_summary,
                       tags_json, evidence_ids_json, created_at
                FROM cases
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .context("failed to list cases")?;
            return rows.into_iter().map(|row| case_from_row(&row)).collect();
        }

        let placeholders = excluded_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT case_id, group_id, status, problem_title, problem_summary, solution_summary, \
             tags_json, evidence_ids_json, created_at FROM cases WHERE case_id NOT IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in excluded_ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("failed to list cases missing from the vector index")?;
        rows.into_iter().map(|row| case_from_row(&row)).collect()
    }

    pub async fn create_history_token(&self, token: &HistoryToken) -> Result<()> {
        sqlx::query(
            "INSERT INTO history_tokens (token, group_id, expires_at, used) VALUES (?, ?, ?, 0)",
        )
        .bind(&token.token)
        .bind(&token.group_id)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await
        .context("failed to create history token")?;
        Ok(())
    }

    /// Validate and consume a history token in one step. Returns the token's
    /// `group_id` if it was valid, unused, and unexpired.
    pub async fn consume_history_token(&self, token: &str) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await.context("failed to open tx")?;

        let row = sqlx::query(
            "SELECT group_id, expires_at, used FROM history_tokens WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to fetch history token")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let used: bool = row.try_get::<i64, _>("used").context("used")? != 0;
        let expires_at: chrono::DateTime<chrono::Utc> =
            row.try_get("expires_at").context("expires_at")?;
        let group_id: String = row.try_get("group_id").context("group_id")?;

        if used || expires_at < chrono::Utc::now() {
            return Ok(None);
        }

        let updated = sqlx::query("UPDATE history_tokens SET used = 1 WHERE token = ? AND used = 0")
            .bind(token)
            .execute(&mut *tx)
            .await
            .context("failed to mark history token used")?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        tx.commit().await.context("failed to commit history token consumption")?;
        Ok(Some(group_id))
    }
}

fn raw_message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RawMessage> {
    let image_paths_json: String = row.try_get("image_paths_json").unwrap_or_else(|_| "[]".to_string());
    Ok(RawMessage {
        message_id: row.try_get("message_id").context("message_id")?,
        group_id: row.try_get("group_id").context("group_id")?,
        ts: row.try_get("ts").context("ts")?,
        sender_hash: row.try_get("sender_hash").context("sender_hash")?,
        content_text: row.try_get("content_text").context("content_text")?,
        image_paths: serde_json::from_str(&image_paths_json).unwrap_or_default(),
        reply_to_id: row.try_get("reply_to_id").ok(),
        rag_answered: row.try_get::<i64, _>("rag_answered_flag").unwrap_or(0) != 0,
    })
}

fn case_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Case> {
    let status_str: String = row.try_get("status").context("status")?;
    let tags_json: String = row.try_get("tags_json").unwrap_or_else(|_| "[]".to_string());
    let evidence_json: String = row.try_get("evidence_ids_json").unwrap_or_else(|_| "[]".to_string());

    Ok(Case {
        case_id: row.try_get("case_id").context("case_id")?,
        group_id: row.try_get("group_id").context("group_id")?,
        status: CaseStatus::parse(&status_str)
            .with_context(|| format!("invalid case status in database: {status_str}"))?,
        problem_title: row.try_get("problem_title").context("problem_title")?,
        problem_summary: row.try_get("problem_summary").context("problem_summary")?,
        solution_summary: row.try_get("solution_summary").context("solution_summary")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        evidence_ids: serde_json::from_str(&evidence_json).unwrap_or_default(),
        created_at: row.try_get("created_at").context("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Storage {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        schema::bootstrap(&pool).await.expect("schema bootstrap");
        Storage::from_pool(pool)
    }

    fn sample_message(id: &str) -> RawMessage {
        RawMessage {
            message_id: id.to_string(),
            group_id: "G".to_string(),
            ts: 1_700_000_000_000,
            sender_hash: "0123456789abcdef".to_string(),
            content_text: "hello".to_string(),
            image_paths: vec![],
            reply_to_id: None,
            rag_answered: false,
        }
    }

    #[tokio::test]
    async fn duplicate_message_insert_is_idempotent() {
        let storage = setup().await;
        let msg = sample_message("m1");
        assert!(storage.insert_raw_message(&msg).await.unwrap());
        assert!(!storage.insert_raw_message(&msg).await.unwrap());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_messages")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn buffer_round_trips() {
        let storage = setup().await;
        assert_eq!(storage.get_buffer("G").await.unwrap(), "");
        storage.set_buffer("G", "hello world").await.unwrap();
        assert_eq!(storage.get_buffer("G").await.unwrap(), "hello world");
        storage.set_buffer("G", "hello world more").await.unwrap();
        assert_eq!(storage.get_buffer("G").await.unwrap(), "hello world more");
    }

    #[tokio::test]
    async fn duplicate_case_insert_is_idempotent() {
        let storage = setup().await;
        let case = Case {
            case_id: "c1".to_string(),
            group_id: "G".to_string(),
            status: CaseStatus::Solved,
            problem_title: "t".to_string(),
            problem_summary: "p".to_string(),
            solution_summary: "s".to_string(),
            tags: vec![],
            evidence_ids: vec![],
            created_at: chrono::Utc::now(),
        };
        storage.insert_case(&case).await.unwrap();
        storage.insert_case(&case).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cases")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn history_token_single_use() {
        let storage = setup().await;
        let token = HistoryToken {
            token: "tok1".to_string(),
            group_id: "G".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(5),
            used: false,
        };
        storage.create_history_token(&token).await.unwrap();
        assert_eq!(
            storage.consume_history_token("tok1").await.unwrap(),
            Some("G".to_string())
        );
        assert_eq!(storage.consume_history_token("tok1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_history_token_is_rejected() {
        let storage = setup().await;
        let token = HistoryToken {
            token: "tok-expired".to_string(),
            group_id: "G".to_string(),
            expires_at: chrono::Utc::now() - chrono::Duration::minutes(5),
            used: false,
        };
        storage.create_history_token(&token).await.unwrap();
        assert_eq!(storage.consume_history_token("tok-expired").await.unwrap(), None);
    }
}
