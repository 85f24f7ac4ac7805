//! Reconciler (C10): periodic `SYNC_RAG` pass restoring parity between the
//! relational `cases` table and the vector index — delete orphan vectors
//! with no backing case row, and opportunistically re-embed cases that
//! never made it into the index (e.g. after a crash between insert and
//! upsert).

use crate::error::Result;
use crate::llm::LlmGateway;
use crate::storage::Storage;
use crate::vector::VectorIndex;
use std::collections::HashSet;
use std::sync::Arc;

pub struct Reconciler {
    storage: Storage,
    vector: Arc<VectorIndex>,
    llm: Arc<LlmGateway>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub orphan_vectors_deleted: usize,
    pub orphan_cases_reembedded: usize,
}

impl Reconciler {
    pub fn new(storage: Storage, vector: Arc<VectorIndex>, llm: Arc<LlmGateway>) -> Self {
        Self { storage, vector, llm }
    }

    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let case_ids: HashSet<String> = self.storage.all_case_ids().await?.into_iter().collect();
        let vector_ids: HashSet<String> = self.vector.all_case_ids().await?.into_iter().collect();

        let orphan_vector_ids: Vec<String> = vector_ids.difference(&case_ids).cloned().collect();
        if !orphan_vector_ids.is_empty() {
            tracing::info!(count = orphan_vector_ids.len(), "deleting orphan vector entries");
            self.vector.delete(&orphan_vector_ids).await?;
        }

        let vector_ids_vec: Vec<String> = vector_ids.into_iter().collect();
        let orphan_cases = self.storage.cases_not_in(&vector_ids_vec).await?;

        let mut reembedded = 0;
        for case in &orphan_cases {
            let embedding = self.llm.embed(case.canonical_document()).await?;
            let entry = crate::domain::VectorEntry {
                case_id: case.case_id.clone(),
                embedding,
                document: case.canonical_document(),
                group_id: case.group_id.clone(),
                status: case.status,
                created_at: case.created_at,
                evidence_ids: case.evidence_ids.clone(),
            };
            self.vector.upsert(&entry).await?;
            reembedded += 1;
        }

        if reembedded > 0 {
            tracing::info!(count = reembedded, "re-embedded cases missing from the vector index");
        }

        Ok(ReconcileReport {
            orphan_vectors_deleted: orphan_vector_ids.len(),
            orphan_cases_reembedded: reembedded,
        })
    }

    /// Loop forever, running a reconciliation pass every `interval`, until
    /// `shutdown` fires.
    pub async fn run_forever(&self, interval: std::time::Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        tracing::error!(error = %err, "reconciler pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("reconciler shutting down");
                        return;
                    }
                }
            }
        }
    }
}
