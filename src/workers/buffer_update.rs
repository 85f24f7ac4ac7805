//! `BUFFER_UPDATE` worker (C7): mines solved (and open) cases out of a
//! group's rolling text buffer.
//!
//! Algorithm per message (SPEC_FULL.md §4.3): load the raw message, append
//! it to the buffer in canonical form, and — unless the message was already
//! answered from retrieval — ask the LLM to extract candidate case spans.
//! Only the earliest span is acted on per job: structure it into a case,
//! embed and upsert it, then subtract the consumed span text from the
//! buffer so it is not mined again. If no span was accepted this round, run
//! the supplemental open-case resolution check against the group's most
//! recent still-open case.

use crate::domain::{Case, CaseStatus, MessageJobPayload, VectorEntry};
use crate::error::Result;
use crate::llm::LlmGateway;
use crate::llm::schemas::CaseResultStatus;
use crate::queue::JobQueue;
use crate::storage::Storage;
use crate::vector::VectorIndex;
use std::sync::Arc;
use uuid::Uuid;

pub struct BufferUpdateWorker {
    storage: Storage,
    queue: JobQueue,
    vector: Arc<VectorIndex>,
    llm: Arc<LlmGateway>,
}

impl BufferUpdateWorker {
    pub fn new(storage: Storage, queue: JobQueue, vector: Arc<VectorIndex>, llm: Arc<LlmGateway>) -> Self {
        Self { storage, queue, vector, llm }
    }

    /// Run one claimed `BUFFER_UPDATE` job to completion.
    pub async fn process(&self, job_id: &str, payload: &MessageJobPayload) -> Result<()> {
        let Some(raw_message) = self.storage.get_raw_message(&payload.message_id).await? else {
            // The message was rolled back after this job was enqueued; nothing to do.
            self.queue.complete(job_id).await?;
            return Ok(());
        };

        let mut buffer = self.storage.get_buffer(&payload.group_id).await?;
        buffer.push_str(&raw_message.canonical_line());
        self.storage.set_buffer(&payload.group_id, &buffer).await?;

        // The message was already answered from retrieval; mining it into a
        // new case would just duplicate the answer that already exists.
        if raw_message.rag_answered {
            self.queue.complete(job_id).await?;
            return Ok(());
        }

        let extracted = self.llm.extract(&buffer).await?;

        let mut resolved_span = false;
        if let Some(span) = extracted.cases.first() {
            let start = span.start_idx.max(0) as usize;
            let end = (span.end_idx as usize).min(buffer.len());

            if start <= end && start <= buffer.len() {
                let structured = self.llm.structure(&span.case_block).await?;
                if structured.keep {
                    self.persist_case(&payload.group_id, structured.status, structured).await?;
                    buffer = subtract_span(&buffer, &span.case_block);
                    self.storage.set_buffer(&payload.group_id, &buffer).await?;
                    resolved_span = true;
                }
            }
        }

        if !resolved_span {
            self.maybe_resolve_open_case(&payload.group_id, &buffer).await?;
        }

        self.queue.complete(job_id).await?;
        Ok(())
    }

    async fn persist_case(
        &self,
        group_id: &str,
        status: CaseResultStatus,
        structured: crate::llm::schemas::CaseResult,
    ) -> Result<()> {
        let case = Case {
            case_id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            status: match status {
                CaseResultStatus::Solved => CaseStatus::Solved,
                CaseResultStatus::Open => CaseStatus::Open,
            },
            problem_title: structured.problem_title,
            problem_summary: structured.problem_summary,
            solution_summary: structured.solution_summary,
            tags: structured.tags,
            evidence_ids: structured.evidence_ids,
            created_at: chrono::Utc::now(),
        };

        self.storage.insert_case(&case).await?;

        let embedding = self.llm.embed(case.canonical_document()).await?;
        let entry = VectorEntry {
            case_id: case.case_id.clone(),
            embedding,
            document: case.canonical_document(),
            group_id: case.group_id.clone(),
            status: case.status,
            created_at: case.created_at,
            evidence_ids: case.evidence_ids.clone(),
        };
        self.vector.upsert(&entry).await?;

        Ok(())
    }

    /// Check whether the group's most recent `open` case has now been
    /// resolved by the current buffer. If so, insert a *new* solved case
    /// row — the open case itself is never mutated.
    async fn maybe_resolve_open_case(&self, group_id: &str, buffer: &str) -> Result<()> {
        let Some(open_case) = self.storage.latest_open_case(group_id).await? else {
            return Ok(());
        };

        let prompt = format!(
            "Open case:\n{}\n\nCurrent buffer:\n{}",
            open_case.canonical_document(),
            buffer
        );
        let resolution = self.llm.resolve(&prompt).await?;

        if !resolution.resolved {
            return Ok(());
        }

        let solution_summary = resolution
            .solution_summary
            .unwrap_or_else(|| "Resolved by later conversation.".to_string());

        let resolved_case = Case {
            case_id: Uuid::new_v4().to_string(),
            group_id: open_case.group_id.clone(),
            status: CaseStatus::Solved,
            problem_title: open_case.problem_title.clone(),
            problem_summary: open_case.problem_summary.clone(),
            solution_summary,
            tags: open_case.tags.clone(),
            evidence_ids: open_case.evidence_ids.clone(),
            created_at: chrono::Utc::now(),
        };

        self.storage.insert_case(&resolved_case).await?;

        let embedding = self.llm.embed(resolved_case.canonical_document()).await?;
        let entry = VectorEntry {
            case_id: resolved_case.case_id.clone(),
            embedding,
            document: resolved_case.canonical_document(),
            group_id: resolved_case.group_id.clone(),
            status: resolved_case.status,
            created_at: resolved_case.created_at,
            evidence_ids: resolved_case.evidence_ids.clone(),
        };
        self.vector.upsert(&entry).await
    }
}

/// Remove the first occurrence of `case_block` from `buffer`, verbatim. The
/// extraction model echoes back the exact span text it scanned, so a literal
/// substring removal is the textual subtraction the buffer invariant calls
/// for; if the text has since drifted (e.g. a concurrent append) and no
/// longer matches, the buffer is left untouched rather than corrupted.
fn subtract_span(buffer: &str, case_block: &str) -> String {
    if case_block.is_empty() {
        return buffer.to_string();
    }
    buffer.replacen(case_block, "", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtract_span_removes_first_occurrence_only() {
        let buffer = "a: hi\nb: bye\na: hi\n";
        let result = subtract_span(buffer, "a: hi\n");
        assert_eq!(result, "b: bye\na: hi\n");
    }

    #[test]
    fn subtract_span_leaves_buffer_untouched_when_text_does_not_match() {
        let buffer = "a: hi\nb: bye\n";
        let result = subtract_span(buffer, "never appears");
        assert_eq!(result, buffer);
    }

    #[test]
    fn subtract_span_is_noop_on_empty_block() {
        let buffer = "a: hi\n";
        assert_eq!(subtract_span(buffer, ""), buffer);
    }
}
