//! Local embedding model wrapper. Unlike the per-call model construction
//! this is lifted from, the model is built once and shared behind an `Arc`.

use crate::error::{LlmError, Result};
use fastembed::{EmbeddingModel as FastembedModel, InitOptions, TextEmbedding};
use std::sync::Arc;

pub struct EmbeddingModel {
    model: std::sync::Mutex<TextEmbedding>,
}

impl EmbeddingModel {
    pub fn load(model_name: &str) -> Result<Arc<Self>> {
        let model_kind = parse_model_name(model_name);
        let model = TextEmbedding::try_new(InitOptions::new(model_kind).with_show_download_progress(false))
            .map_err(|e| LlmError::EmbeddingFailed(e.to_string()))?;
        Ok(Arc::new(Self { model: std::sync::Mutex::new(model) }))
    }

    /// Embed a single piece of text. Runs the (CPU-bound) model on a
    /// blocking thread so it never stalls the async executor.
    pub async fn embed_one(self: &Arc<Self>, text: String) -> Result<Vec<f32>> {
        let mut vectors = self.embed_many(vec![text]).await?;
        vectors
            .pop()
            .ok_or_else(|| LlmError::EmbeddingFailed("embedding model returned no vectors".to_string()).into())
    }

    pub async fn embed_many(self: &Arc<Self>, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let this = Arc::clone(self);
        let vectors = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let model = this.model.lock().expect("embedding model mutex poisoned");
            model
                .embed(texts, None)
                .map_err(|e| LlmError::EmbeddingFailed(e.to_string()).into())
        })
        .await
        .map_err(|e| LlmError::EmbeddingFailed(format!("embedding task panicked: {e}")))??;

        Ok(vectors)
    }
}

fn parse_model_name(name: &str) -> FastembedModel {
    match name {
        "bge-small-en-v1.5" | "BAAI/bge-small-en-v1.5" => FastembedModel::BGESmallENV15,
        "bge-base-en-v1.5" | "BAAI/bge-base-en-v1.5" => FastembedModel::BGEBaseENV15,
        "all-MiniLM-L6-v2" => FastembedModel::AllMiniLML6V2,
        _ => FastembedModel::BGESmallENV15,
    }
}
