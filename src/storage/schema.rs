//! Schema bootstrap for the relational store. Idempotent: safe to run on
//! every startup against an existing database.

use crate::error::{Result, StorageError};
use sqlx::SqlitePool;

pub async fn bootstrap(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_messages (
            message_id         TEXT PRIMARY KEY,
            group_id           TEXT NOT NULL,
            ts                 INTEGER NOT NULL,
            sender_hash        TEXT NOT NULL,
            content_text       TEXT NOT NULL,
            image_paths_json   TEXT NOT NULL DEFAULT '[]',
            reply_to_id        TEXT,
            rag_answered_flag  INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StorageError::Migration(e.to_string()))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_raw_messages_group_ts ON raw_messages(group_id, ts)")
        .execute(pool)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS buffers (
            group_id    TEXT PRIMARY KEY,
            text        TEXT NOT NULL DEFAULT '',
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StorageError::Migration(e.to_string()))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cases (
            case_id             TEXT PRIMARY KEY,
            group_id            TEXT NOT NULL,
            status              TEXT NOT NULL,
            problem_title       TEXT NOT NULL,
            problem_summary     TEXT NOT NULL,
            solution_summary    TEXT NOT NULL,
            tags_json           TEXT NOT NULL DEFAULT '[]',
            evidence_ids_json   TEXT NOT NULL DEFAULT '[]',
            created_at          TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StorageError::Migration(e.to_string()))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cases_group_status ON cases(group_id, status)")
        .execute(pool)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS history_tokens (
            token       TEXT PRIMARY KEY,
            group_id    TEXT NOT NULL,
            expires_at  TEXT NOT NULL,
            used        INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StorageError::Migration(e.to_string()))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id        TEXT PRIMARY KEY,
            kind          TEXT NOT NULL,
            payload_json  TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'pending',
            attempts      INTEGER NOT NULL DEFAULT 0,
            enqueued_at   TEXT NOT NULL,
            claimed_at    TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StorageError::Migration(e.to_string()))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_kind_status_enqueued ON jobs(kind, status, enqueued_at)")
        .execute(pool)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    Ok(())
}
