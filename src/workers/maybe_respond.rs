//! `MAYBE_RESPOND` worker (C8): gate -> retrieve -> draft -> send, with an
//! at-most-one-reply guarantee per message.
//!
//! The `rag_answered` flag on the triggering message is committed in the
//! same SQLite transaction as the job's `complete` transition: both tables
//! share one pool, so a single `BEGIN ... COMMIT` makes "answered" and
//! "done" atomic without a cross-component transaction abstraction.

use crate::config::PipelineConfig;
use crate::domain::{CaseStatus, MessageJobPayload};
use crate::error::{QueueError, Result};
use crate::llm::LlmGateway;
use crate::messaging::{MessagingDyn, Quote};
use crate::storage::Storage;
use crate::vector::VectorIndex;
use anyhow::Context as _;
use std::sync::Arc;

/// Original text is quoted up to this many characters, per §6's
/// `quote: {ts, author, excerpt}`.
const QUOTE_EXCERPT_CHARS: usize = 200;

pub struct MaybeRespondWorker {
    storage: Storage,
    vector: Arc<VectorIndex>,
    llm: Arc<LlmGateway>,
    messaging: Arc<dyn MessagingDyn>,
    pipeline: PipelineConfig,
}

impl MaybeRespondWorker {
    pub fn new(
        storage: Storage,
        vector: Arc<VectorIndex>,
        llm: Arc<LlmGateway>,
        messaging: Arc<dyn MessagingDyn>,
        pipeline: PipelineConfig,
    ) -> Self {
        Self { storage, vector, llm, messaging, pipeline }
    }

    /// Run one claimed `MAYBE_RESPOND` job to completion. The caller is
    /// responsible for claiming the job from the queue; this method only
    /// performs the work and the terminal transactional commit.
    pub async fn process(&self, job_id: &str, payload: &MessageJobPayload) -> Result<()> {
        let raw_message = self
            .storage
            .get_raw_message(&payload.message_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(payload.message_id.clone()))?;

        if raw_message.rag_answered {
            return self.finish(job_id, &payload.message_id, false).await;
        }

        let context = self
            .storage
            .last_n_messages_text(&payload.group_id, self.pipeline.context_window as i64)
            .await?;

        let decision = self.llm.gate(&context).await?;
        if !decision.consider {
            return self.finish(job_id, &payload.message_id, false).await;
        }

        let embedding = self.llm.embed(payload.text.clone()).await?;
        let hits = self
            .vector
            .query(
                &payload.group_id,
                CaseStatus::Solved,
                &embedding,
                self.pipeline.retrieve_top_k,
            )
            .await?;

        let buffer = self.storage.get_buffer(&payload.group_id).await?;
        if hits.is_empty() && buffer.trim().is_empty() {
            return self.finish(job_id, &payload.message_id, false).await;
        }

        let retrieved_context = hits
            .iter()
            .map(|hit| format!("[{}] {}", hit.entry.case_id, hit.entry.document))
            .collect::<Vec<_>>()
            .join("\n\n");
        let respond_prompt = format!(
            "Message:\n{}\n\nRecent conversation:\n{context}\n\nRetrieved cases:\n{retrieved_context}",
            payload.text
        );

        let draft = self.llm.respond(&respond_prompt).await?;
        if !draft.respond || draft.text.trim().is_empty() {
            return self.finish(job_id, &payload.message_id, false).await;
        }

        let text = append_citations(&draft.text, &draft.citations);
        let quote = Quote {
            ts: raw_message.ts,
            author: raw_message.sender_hash.clone(),
            excerpt: truncate_chars(&raw_message.content_text, QUOTE_EXCERPT_CHARS),
        };
        let mentions = vec![raw_message.sender_hash.clone()];

        self.messaging
            .send_boxed(&payload.group_id, &text, Some(&quote), &mentions)
            .await?;
        self.finish(job_id, &payload.message_id, true).await
    }

    /// Commit the job's completion and, if a reply was actually sent, the
    /// `rag_answered` flag, in a single transaction.
    async fn finish(&self, job_id: &str, message_id: &str, answered: bool) -> Result<()> {
        commit_completion(self.storage.pool(), job_id, message_id, answered).await
    }
}

/// Append cited case ids as an inline suffix, per §6's "attach citations as
/// inline suffixes". No-op if the draft cited nothing.
fn append_citations(text: &str, citations: &[String]) -> String {
    if citations.is_empty() {
        return text.to_string();
    }
    let refs = citations
        .iter()
        .map(|c| format!("[{c}]"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{text}\n\nSources: {refs}")
}

/// First `max_chars` characters of `text`, respecting UTF-8 boundaries.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Atomically mark a message answered (if `answered`) and the job done.
/// Factored out of [`MaybeRespondWorker`] so it can be exercised directly
/// without standing up an LLM gateway or vector index.
async fn commit_completion(
    pool: &sqlx::SqlitePool,
    job_id: &str,
    message_id: &str,
    answered: bool,
) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to open maybe_respond completion transaction")?;

    if answered {
        sqlx::query("UPDATE raw_messages SET rag_answered_flag = 1 WHERE message_id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .context("failed to set rag_answered flag")?;
    }

    let updated = sqlx::query("UPDATE jobs SET status = 'done' WHERE job_id = ?")
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .context("failed to complete job")?;

    if updated.rows_affected() == 0 {
        return Err(QueueError::NotFound(job_id.to_string()).into());
    }

    tx.commit()
        .await
        .context("failed to commit maybe_respond completion transaction")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobKind, RawMessage};
    use crate::queue::JobQueue;
    use crate::storage::schema;

    async fn setup() -> (Storage, JobQueue) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        schema::bootstrap(&pool).await.expect("schema bootstrap");
        (Storage::from_pool(pool.clone()), JobQueue::new(pool))
    }

    #[test]
    fn append_citations_is_noop_without_citations() {
        assert_eq!(append_citations("reply text", &[]), "reply text");
    }

    #[test]
    fn append_citations_lists_case_ids() {
        let text = append_citations("reply text", &["c1".to_string(), "c2".to_string()]);
        assert_eq!(text, "reply text\n\nSources: [c1] [c2]");
    }

    #[test]
    fn truncate_chars_respects_utf8_boundaries() {
        let text = "héllo wörld";
        let truncated = truncate_chars(text, 5);
        assert_eq!(truncated.chars().count(), 5);
    }

    #[tokio::test]
    async fn commit_completion_without_answer_leaves_flag_unset() {
        let (storage, queue) = setup().await;
        let msg = RawMessage {
            message_id: "m1".into(),
            group_id: "G".into(),
            ts: 0,
            sender_hash: "abc".into(),
            content_text: "hi".into(),
            image_paths: vec![],
            reply_to_id: None,
            rag_answered: false,
        };
        storage.insert_raw_message(&msg).await.unwrap();
        let job_id = queue
            .enqueue(JobKind::MaybeRespond, &serde_json::json!({}))
            .await
            .unwrap();
        queue.claim_next(&[JobKind::MaybeRespond]).await.unwrap();

        commit_completion(storage.pool(), &job_id, "m1", false).await.unwrap();

        let fetched = storage.get_raw_message("m1").await.unwrap().unwrap();
        assert!(!fetched.rag_answered);
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, crate::domain::JobStatus::Done);
    }

    #[tokio::test]
    async fn commit_completion_with_answer_sets_flag_and_completes_job_together() {
        let (storage, queue) = setup().await;
        let msg = RawMessage {
            message_id: "m2".into(),
            group_id: "G".into(),
            ts: 0,
            sender_hash: "abc".into(),
            content_text: "hi".into(),
            image_paths: vec![],
            reply_to_id: None,
            rag_answered: false,
        };
        storage.insert_raw_message(&msg).await.unwrap();
        let job_id = queue
            .enqueue(JobKind::MaybeRespond, &serde_json::json!({}))
            .await
            .unwrap();
        queue.claim_next(&[JobKind::MaybeRespond]).await.unwrap();

        commit_completion(storage.pool(), &job_id, "m2", true).await.unwrap();

        let fetched = storage.get_raw_message("m2").await.unwrap().unwrap();
        assert!(fetched.rag_answered);
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, crate::domain::JobStatus::Done);
    }
}
