//! The LLM Gateway (C4): one typed, schema-validated method per pipeline
//! task, each routed to its configured provider/model. Grounded on the
//! teacher's provider-routing split (`LlmManager` + `SpacebotModel`), with
//! schemas ported from the original's pydantic task models.

use crate::config::{Config, RuntimeConfig};
use crate::error::{LlmError, Result};
use crate::llm::embedding::EmbeddingModel;
use crate::llm::provider::CompletionClient;
use crate::llm::schemas::{
    BlocksResult, CaseResult, DecisionResult, ExtractResult, ImgExtract, ResolutionResult,
    RespondResult,
};
use std::sync::Arc;
use std::time::Duration;

pub struct LlmGateway {
    runtime: Arc<RuntimeConfig>,
    embedding: Arc<EmbeddingModel>,
    timeout: Duration,
}

impl LlmGateway {
    pub fn new(config: &Config, runtime: Arc<RuntimeConfig>) -> Result<Self> {
        let embedding = EmbeddingModel::load(&config.llm.embedding_model)?;
        Ok(Self {
            runtime,
            embedding,
            timeout: Duration::from_secs(config.timeouts.llm_call_secs),
        })
    }

    fn client_for(&self, model_spec: &str) -> Result<CompletionClient> {
        let llm = self.runtime.llm.load();
        let (provider_name, model_name) = model_spec
            .split_once('/')
            .ok_or_else(|| LlmError::UnknownProvider(model_spec.to_string()))?;

        let provider = llm
            .providers
            .get(provider_name)
            .cloned()
            .ok_or_else(|| LlmError::MissingProviderKey(provider_name.to_string()))?;

        CompletionClient::new(provider, model_name.to_string(), self.timeout)
    }

    async fn run_task<T: serde::de::DeserializeOwned>(
        &self,
        task: &'static str,
        model_spec: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<T> {
        #[cfg(feature = "metrics")]
        crate::telemetry::metrics::METRICS.llm_calls.with_label_values(&[task]).inc();

        let client = self.client_for(model_spec)?;
        let raw = client.complete(system_prompt, user_prompt).await?;
        let json_text = extract_json_block(&raw);
        serde_json::from_str(&json_text).map_err(|e| {
            LlmError::SchemaValidation {
                task,
                reason: format!("failed to parse model output as JSON: {e}"),
            }
            .into()
        })
    }

    pub async fn image_to_text(&self, image_description_prompt: &str) -> Result<ImgExtract> {
        let model = self.runtime.llm.load().task_models.image_to_text.clone();
        self.run_task(
            "image_to_text",
            &model,
            IMAGE_TO_TEXT_SYSTEM_PROMPT,
            image_description_prompt,
        )
        .await
    }

    pub async fn gate(&self, context: &str) -> Result<DecisionResult> {
        let model = self.runtime.llm.load().task_models.gate.clone();
        self.run_task("gate", &model, GATE_SYSTEM_PROMPT, context).await
    }

    pub async fn extract(&self, buffer_text: &str) -> Result<ExtractResult> {
        let model = self.runtime.llm.load().task_models.extract.clone();
        let result: ExtractResult = self
            .run_task("extract", &model, EXTRACT_SYSTEM_PROMPT, buffer_text)
            .await?;
        result.validate()?;
        Ok(result)
    }

    pub async fn structure(&self, case_block: &str) -> Result<CaseResult> {
        let model = self.runtime.llm.load().task_models.structure.clone();
        self.run_task("structure", &model, STRUCTURE_SYSTEM_PROMPT, case_block).await
    }

    pub async fn respond(&self, context: &str) -> Result<RespondResult> {
        let model = self.runtime.llm.load().task_models.respond.clone();
        self.run_task("respond", &model, RESPOND_SYSTEM_PROMPT, context).await
    }

    pub async fn history_blocks(&self, chunk_text: &str) -> Result<BlocksResult> {
        let model = self.runtime.llm.load().task_models.history_blocks.clone();
        self.run_task(
            "history_blocks",
            &model,
            HISTORY_BLOCKS_SYSTEM_PROMPT,
            chunk_text,
        )
        .await
    }

    /// Supplemental check: has a still-open case been answered by the
    /// current buffer contents?
    pub async fn resolve(&self, open_case_and_buffer: &str) -> Result<ResolutionResult> {
        let model = self.runtime.llm.load().task_models.resolve.clone();
        self.run_task("resolve", &model, RESOLVE_SYSTEM_PROMPT, open_case_and_buffer)
            .await
    }

    pub async fn embed(&self, text: String) -> Result<Vec<f32>> {
        self.embedding.embed_one(text).await
    }

    pub async fn embed_many(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.embedding.embed_many(texts).await
    }
}

/// Models are instructed to answer with a single JSON object, optionally
/// wrapped in a fenced code block; strip the fence if present.
fn extract_json_block(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim_end_matches("```").trim().to_string()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_end_matches("```").trim().to_string()
    } else {
        trimmed.to_string()
    }
}

const IMAGE_TO_TEXT_SYSTEM_PROMPT: &str = "Describe the contents of the attached image. \
Report any legible text verbatim in `extracted_text` and note notable visual elements in \
`observations`. Respond with a single JSON object matching the ImgExtract schema.";

const GATE_SYSTEM_PROMPT: &str = "You are deciding whether a new chat message is worth the bot's \
attention. Consider it a new_question, ongoing_discussion, noise, or statement. Set `consider` \
true only for messages that could plausibly need a reply. Respond with a single JSON object \
matching the DecisionResult schema.";

const EXTRACT_SYSTEM_PROMPT: &str = "Scan the buffer text for self-contained support cases: a \
problem raised and, usually, its resolution. Return character-offset spans into the buffer, \
sorted and non-overlapping, with start_idx <= end_idx. Respond with a single JSON object \
matching the ExtractResult schema.";

const STRUCTURE_SYSTEM_PROMPT: &str = "Turn the given case block into a structured case record: \
problem_title, problem_summary, solution_summary, tags, and evidence_ids (message ids cited as \
evidence). Set status to solved only if a solution was reached; otherwise open. Set keep to \
false if the block is not really a distinct support case. Respond with a single JSON object \
matching the CaseResult schema.";

const RESPOND_SYSTEM_PROMPT: &str = "Using only the retrieved cases as grounding, decide whether \
to answer the current message and, if so, draft a concise reply citing the case ids used. Set \
respond to false if the retrieved cases do not actually answer the question. Respond with a \
single JSON object matching the RespondResult schema.";

const HISTORY_BLOCKS_SYSTEM_PROMPT: &str = "Scan this chunk of historical chat transcript for \
self-contained support case blocks (problem plus, usually, resolution). Respond with a single \
JSON object matching the BlocksResult schema.";

const RESOLVE_SYSTEM_PROMPT: &str = "An open case and the current conversation buffer follow. \
Decide whether the buffer now resolves the open case. If so, provide a solution_summary. \
Respond with a single JSON object matching the ResolutionResult schema.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_block_strips_fenced_code() {
        let raw = "```json\n{\"respond\": true}\n```";
        assert_eq!(extract_json_block(raw), "{\"respond\": true}");
    }

    #[test]
    fn extract_json_block_passes_through_bare_json() {
        let raw = "{\"respond\": false}";
        assert_eq!(extract_json_block(raw), "{\"respond\": false}");
    }
}
