//! History Bootstrap (C9): bulk-ingest a historical transcript into cases.
//!
//! Chunks the transcript with overlap, fans chunks out across bounded
//! concurrency with a per-chunk timeout (modeling the original's
//! subprocess-isolation-per-chunk without literal subprocesses), structures
//! each recovered block, and deduplicates across chunks by cosine distance
//! before writing anything to storage.

mod chunk;
mod dedup;

pub use chunk::{chunk_transcript, TranscriptMessage};
pub use dedup::cosine_distance;

use crate::config::{PipelineConfig, TimeoutsConfig};
use crate::domain::{Case, CaseStatus, VectorEntry};
use crate::error::Result;
use crate::llm::LlmGateway;
use crate::llm::schemas::BlocksCase;
use crate::storage::Storage;
use crate::vector::VectorIndex;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of one bootstrap run: how many cases were written, and which
/// chunks failed (timed out or errored) without aborting the whole run.
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub chunks_total: usize,
    pub failed_chunks: Vec<usize>,
    pub cases_written: usize,
    pub duplicates_dropped: usize,
}

impl BootstrapReport {
    /// `true` when at least one chunk failed but the run still produced
    /// usable cases from the rest — reported as `partial_success`.
    pub fn partial_success(&self) -> bool {
        !self.failed_chunks.is_empty()
    }
}

pub struct HistoryBootstrap {
    storage: Storage,
    vector: Arc<VectorIndex>,
    llm: Arc<LlmGateway>,
    pipeline: PipelineConfig,
    timeouts: TimeoutsConfig,
}

impl HistoryBootstrap {
    pub fn new(
        storage: Storage,
        vector: Arc<VectorIndex>,
        llm: Arc<LlmGateway>,
        pipeline: PipelineConfig,
        timeouts: TimeoutsConfig,
    ) -> Self {
        Self { storage, vector, llm, pipeline, timeouts }
    }

    pub async fn run(&self, group_id: &str, transcript: &[TranscriptMessage]) -> Result<BootstrapReport> {
        let chunks = chunk_transcript(
            transcript,
            self.pipeline.chunk_char_cap,
            self.pipeline.chunk_overlap_messages,
        );

        let mut report = BootstrapReport { chunks_total: chunks.len(), ..Default::default() };

        let per_chunk_timeout = std::time::Duration::from_secs(self.timeouts.llm_call_secs * 2);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.pipeline.history_max_concurrent_chunks));

        let mut tasks = Vec::with_capacity(chunks.len());
        for chunk_text in chunks {
            let llm = Arc::clone(&self.llm);
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                tokio::time::timeout(per_chunk_timeout, llm.history_blocks(&chunk_text)).await
            }));
        }

        let mut candidate_blocks: Vec<BlocksCase> = Vec::new();
        for (chunk_index, task) in tasks.into_iter().enumerate() {
            match task.await {
                Ok(Ok(Ok(blocks))) => candidate_blocks.extend(blocks.cases),
                Ok(Ok(Err(err))) => {
                    tracing::warn!(chunk_index, error = %err, "history chunk extraction failed");
                    report.failed_chunks.push(chunk_index);
                }
                Ok(Err(_elapsed)) => {
                    tracing::warn!(chunk_index, "history chunk extraction timed out");
                    report.failed_chunks.push(chunk_index);
                }
                Err(join_err) => {
                    tracing::warn!(chunk_index, error = %join_err, "history chunk extraction task panicked");
                    report.failed_chunks.push(chunk_index);
                }
            }
        }

        // Dedup compares only the title+problem-summary embedding (SPEC_FULL.md
        // §4.5), kept separate from the canonical-document embedding written
        // to the vector index so a reworded solution never masks a duplicate.
        let mut accepted_dedup_embeddings: Vec<Vec<f32>> = Vec::new();

        for block in candidate_blocks {
            let structured = self.llm.structure(&block.case_block).await?;
            if !structured.keep {
                continue;
            }

            let case = Case {
                case_id: Uuid::new_v4().to_string(),
                group_id: group_id.to_string(),
                status: match structured.status {
                    crate::llm::schemas::CaseResultStatus::Solved => CaseStatus::Solved,
                    crate::llm::schemas::CaseResultStatus::Open => CaseStatus::Open,
                },
                problem_title: structured.problem_title,
                problem_summary: structured.problem_summary,
                solution_summary: structured.solution_summary,
                tags: structured.tags,
                evidence_ids: structured.evidence_ids,
                created_at: chrono::Utc::now(),
            };

            let dedup_embedding = self.llm.embed(case.dedup_document()).await?;

            let is_duplicate = accepted_dedup_embeddings.iter().any(|existing| {
                cosine_distance(existing, &dedup_embedding) < self.pipeline.history_dedup_distance_threshold
            });
            if is_duplicate {
                report.duplicates_dropped += 1;
                continue;
            }

            let embedding = self.llm.embed(case.canonical_document()).await?;

            self.storage.insert_case(&case).await?;
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

            accepted_dedup_embeddings.push(dedup_embedding);
            report.cases_written += 1;
        }

        if report.partial_success() {
            tracing::warn!(
                failed_chunks = ?report.failed_chunks,
                total = report.chunks_total,
                "history bootstrap completed with some chunks dropped"
            );
        }

        Ok(report)
    }
}
