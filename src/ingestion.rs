//! Ingestion front-end (C5): normalize an inbound message, resolve and
//! (optionally) upload attachments, annotate images via the LLM Gateway,
//! persist the raw message, and enqueue the two jobs that process it.
//!
//! Grounded on the original ingestion pipeline: sender hashing via a
//! truncated SHA-256 digest, image annotation appended to the message text,
//! and `MAYBE_RESPOND` enqueued ahead of `BUFFER_UPDATE` so a reply is
//! attempted before the buffer is mutated for the same message.

use crate::config::StorageRootsConfig;
use crate::domain::{MessageJobPayload, RawMessage};
use crate::error::Result;
use crate::llm::LlmGateway;
use crate::queue::JobQueue;
use crate::storage::Storage;
use anyhow::Context as _;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// An inbound message as handed off by a messaging adapter, before any
/// pipeline-internal normalization.
pub struct InboundMessage {
    pub message_id: String,
    pub group_id: String,
    pub sender: String,
    pub ts: i64,
    pub text: String,
    /// Local filesystem paths to any attached images, already downloaded by
    /// the adapter.
    pub image_paths: Vec<String>,
    pub reply_to_id: Option<String>,
}

pub struct IngestionFrontend {
    storage: Storage,
    queue: JobQueue,
    llm: Arc<LlmGateway>,
    storage_roots: StorageRootsConfig,
}

impl IngestionFrontend {
    pub fn new(
        storage: Storage,
        queue: JobQueue,
        llm: Arc<LlmGateway>,
        storage_roots: StorageRootsConfig,
    ) -> Self {
        Self { storage, queue, llm, storage_roots }
    }

    /// Ingest one inbound message: hash the sender, resolve and (optionally)
    /// upload any attachments, annotate the resolved images, persist the raw
    /// message (idempotent), and enqueue `MAYBE_RESPOND` then `BUFFER_UPDATE`.
    /// Returns `false` without enqueuing anything if the message had already
    /// been ingested.
    pub async fn ingest(&self, message: InboundMessage) -> Result<bool> {
        let sender_hash = hash_sender(&message.sender);
        let mut content_text = message.text.clone();
        let mut resolved_image_paths = Vec::with_capacity(message.image_paths.len());

        for image_path in &message.image_paths {
            let resolved_path = resolve_attachment_path(&self.storage_roots, image_path).await?;

            match self.annotate_image(&resolved_path).await {
                Ok(annotation) => content_text.push_str(&annotation),
                Err(err) => {
                    tracing::warn!(
                        image_path,
                        error = %err,
                        "image annotation failed, falling back to bare marker"
                    );
                    content_text.push_str("\n\n[Image]");
                }
            }

            resolved_image_paths.push(resolved_path);
        }

        let raw_message = RawMessage {
            message_id: message.message_id.clone(),
            group_id: message.group_id.clone(),
            ts: message.ts,
            sender_hash,
            content_text: content_text.clone(),
            image_paths: resolved_image_paths,
            reply_to_id: message.reply_to_id.clone(),
            rag_answered: false,
        };

        let inserted = self.storage.insert_raw_message(&raw_message).await?;
        if !inserted {
            tracing::debug!(message_id = %message.message_id, "duplicate inbound message, skipping enqueue");
            return Ok(false);
        }

        let payload = MessageJobPayload {
            group_id: message.group_id.clone(),
            message_id: message.message_id.clone(),
            sender: message.sender.clone(),
            ts: message.ts,
            text: content_text,
        };
        let payload_json = serde_json::to_value(&payload).context("failed to serialize job payload")?;

        // MAYBE_RESPOND goes first: if the bot can answer from retrieval right
        // now, it should, before BUFFER_UPDATE folds this message into the
        // rolling buffer it will itself later mine from.
        self.queue
            .enqueue(crate::domain::JobKind::MaybeRespond, &payload_json)
            .await?;
        self.queue
            .enqueue(crate::domain::JobKind::BufferUpdate, &payload_json)
            .await?;

        Ok(true)
    }

    async fn annotate_image(&self, image_path: &str) -> Result<String> {
        let extract = self.llm.image_to_text(image_path).await?;
        Ok(extract.to_annotation())
    }
}

/// SHA-256 of the adapter-provided sender identity, truncated to 16 hex
/// characters — enough to disambiguate senders within a group without
/// storing the identity itself.
pub fn hash_sender(sender: &str) -> String {
    let digest = Sha256::digest(sender.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Resolve an attachment reference to a local filesystem path, uploading it
/// to the configured blob store first if one is configured. Falls back to
/// the local path unmodified when no blob store is configured or the upload
/// fails, matching the ingestion pipeline's "best effort" attachment policy.
pub async fn resolve_attachment_path(storage_roots: &StorageRootsConfig, relative_path: &str) -> Result<String> {
    let local_path = storage_roots.ingest_storage_root.join(relative_path);

    let Some(blob_store) = &storage_roots.blob_store else {
        return Ok(local_path.to_string_lossy().to_string());
    };

    match upload_to_blob_store(blob_store, &local_path, relative_path).await {
        Ok(url) => Ok(url),
        Err(err) => {
            tracing::warn!(
                relative_path,
                error = %err,
                "blob store upload failed, falling back to local path"
            );
            Ok(local_path.to_string_lossy().to_string())
        }
    }
}

async fn upload_to_blob_store(
    blob_store: &crate::config::BlobStoreConfig,
    local_path: &std::path::Path,
    relative_path: &str,
) -> Result<String> {
    let bytes = tokio::fs::read(local_path)
        .await
        .with_context(|| format!("failed to read attachment at {}", local_path.display()))?;

    let url = format!(
        "{}/{}/{}",
        blob_store.endpoint.trim_end_matches('/'),
        blob_store.bucket,
        relative_path
    );

    let client = reqwest::Client::new();
    client
        .put(&url)
        .basic_auth(&blob_store.access_key_id, Some(&blob_store.secret_access_key))
        .body(bytes)
        .send()
        .await
        .context("blob store upload request failed")?
        .error_for_status()
        .context("blob store upload returned an error status")?;

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_hash_is_sixteen_hex_chars() {
        let hash = hash_sender("+15551234567");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sender_hash_is_deterministic() {
        assert_eq!(hash_sender("alice"), hash_sender("alice"));
        assert_ne!(hash_sender("alice"), hash_sender("bob"));
    }
}
