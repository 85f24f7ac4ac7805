//! Typed, immutable configuration read from environment and an optional TOML
//! file, with hot-reloadable LLM/routing sub-config behind `ArcSwap`.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Database backend switch. The source system supports `mysql`/`oracle`; this
/// implementation targets a single embedded relational engine concretely (see
/// DESIGN.md's resolved Open Question). The enum is kept for forward
/// compatibility with the source's `DB_BACKEND` switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbBackend {
    Sqlite,
    Mysql,
    Oracle,
}

impl Default for DbBackend {
    fn default() -> Self {
        DbBackend::Sqlite
    }
}

/// Which wire shape a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    Anthropic,
    OpenAiCompletions,
}

/// Credentials and endpoint for one LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_type: ApiType,
    pub base_url: String,
    pub api_key: String,
}

/// Model selection, one entry per Gateway task (§4.7 of SPEC_FULL.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskModels {
    /// `provider/model`, e.g. `anthropic/claude-haiku-4-5`.
    pub image_to_text: String,
    pub gate: String,
    pub extract: String,
    pub structure: String,
    pub respond: String,
    pub history_blocks: String,
    pub resolve: String,
}

impl Default for TaskModels {
    fn default() -> Self {
        let default_model = "anthropic/claude-sonnet-4-5".to_string();
        let cheap_model = "anthropic/claude-haiku-4-5".to_string();
        Self {
            image_to_text: cheap_model.clone(),
            gate: cheap_model,
            extract: default_model.clone(),
            structure: default_model.clone(),
            respond: default_model.clone(),
            history_blocks: default_model.clone(),
            resolve: default_model,
        }
    }
}

/// Hot-reloadable LLM provider and model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub task_models: TaskModels,
    pub embedding_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            task_models: TaskModels::default(),
            embedding_model: "BAAI/bge-small-en-v1.5".to_string(),
        }
    }
}

/// Per-call and per-job timeouts, all in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub llm_call_secs: u64,
    pub db_call_secs: u64,
    pub vector_call_secs: u64,
    pub job_total_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            llm_call_secs: 120,
            db_call_secs: 10,
            vector_call_secs: 15,
            job_total_secs: 600,
        }
    }
}

/// Pipeline-wide tuning knobs enumerated by SPEC_FULL §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Messages of last-N context handed to gate/respond.
    pub context_window: usize,
    /// Retrieval top-k.
    pub retrieve_top_k: usize,
    /// Worker poll interval, seconds.
    pub worker_poll_interval_secs: u64,
    /// Job considered abandoned and reclaimable after this many seconds in_progress.
    pub stale_claim_secs: u64,
    /// History token TTL, minutes.
    pub history_token_ttl_minutes: i64,
    /// History bootstrap chunk character cap.
    pub chunk_char_cap: usize,
    /// History bootstrap chunk message overlap.
    pub chunk_overlap_messages: usize,
    /// History bootstrap cross-chunk dedup cosine-distance threshold.
    pub history_dedup_distance_threshold: f32,
    /// Bounded concurrency for history-bootstrap chunk extraction fan-out.
    pub history_max_concurrent_chunks: usize,
    /// Comma-separated bot mention strings, used by the gate/respond prompts.
    pub bot_mentions: Vec<String>,
    /// Reconciler `SYNC_RAG` run interval, seconds.
    pub reconciler_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            context_window: 40,
            retrieve_top_k: 5,
            worker_poll_interval_secs: 1,
            stale_claim_secs: 900,
            history_token_ttl_minutes: 60,
            chunk_char_cap: 12_000,
            chunk_overlap_messages: 3,
            history_dedup_distance_threshold: 0.15,
            history_max_concurrent_chunks: 8,
            bot_mentions: vec!["@supportbot".to_string()],
            reconciler_interval_secs: 300,
        }
    }
}

/// Storage roots and optional blob-store (R2-shaped) credentials.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageRootsConfig {
    /// Filesystem root attachments are resolved against when a reference is a
    /// relative local path rather than a blob-store URL.
    pub bot_storage_root: PathBuf,
    pub ingest_storage_root: PathBuf,
    /// When unset, attachment upload falls back to the local filesystem.
    pub blob_store: Option<BlobStoreConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Structured logging / tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            otlp_endpoint: None,
        }
    }
}

/// Messaging adapter identity (which platform, which credential).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessagingConfig {
    pub adapter: String,
    pub identity: Option<String>,
}

/// Top-level, process-wide configuration. Loaded once at startup; the
/// LLM/routing sub-config may be hot-reloaded behind `ArcSwap` by a config
/// file watcher (see `RuntimeConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_backend: DbBackend,
    pub llm: LlmConfig,
    pub vector: VectorConfig,
    pub pipeline: PipelineConfig,
    pub timeouts: TimeoutsConfig,
    pub storage_roots: StorageRootsConfig,
    pub telemetry: TelemetryConfig,
    pub messaging: MessagingConfig,
    pub http_bind: std::net::SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub path: PathBuf,
    pub collection: String,
}

/// Process-wide resources that may change without a restart: currently just
/// the LLM provider/model table, swapped in by the config-file watcher.
pub struct RuntimeConfig {
    pub llm: arc_swap::ArcSwap<LlmConfig>,
}

impl RuntimeConfig {
    pub fn new(llm: LlmConfig) -> Self {
        Self {
            llm: arc_swap::ArcSwap::from_pointee(llm),
        }
    }

    pub fn reload_llm(&self, llm: LlmConfig) {
        self.llm.store(std::sync::Arc::new(llm));
        tracing::info!("LLM provider/model configuration reloaded");
    }
}

/// Watch `config_file` for changes and reload the `task_models` table (and
/// `embedding_model`) into `runtime` on every write, without touching
/// provider credentials (those only ever come from the environment).
/// Returns the `notify` watcher; dropping it stops the watch.
pub fn watch_for_reload(
    runtime: std::sync::Arc<RuntimeConfig>,
    config_file: PathBuf,
) -> anyhow::Result<notify::RecommendedWatcher> {
    use notify::Watcher;

    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;

    if config_file.exists() {
        watcher.watch(&config_file, notify::RecursiveMode::NonRecursive)?;
    }

    let path_for_thread = config_file.clone();
    std::thread::spawn(move || {
        for event in rx {
            let Ok(event) = event else { continue };
            if !matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                continue;
            }
            match reload_task_models(&path_for_thread) {
                Ok(Some(partial)) => {
                    let mut llm = (**runtime.llm.load()).clone();
                    llm.task_models = partial.task_models;
                    llm.embedding_model = partial.embedding_model;
                    runtime.reload_llm(llm);
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "failed to reload config file, keeping previous settings"),
            }
        }
    });

    Ok(watcher)
}

#[derive(Deserialize)]
struct ReloadableLlmSection {
    task_models: TaskModels,
    embedding_model: String,
}

#[derive(Deserialize)]
struct ReloadableConfigFile {
    llm: Option<ReloadableLlmSection>,
}

fn reload_task_models(path: &Path) -> anyhow::Result<Option<ReloadableLlmSection>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: ReloadableConfigFile = toml::from_str(&text).context("parsing config TOML")?;
    Ok(parsed.llm)
}

impl Config {
    /// Load configuration from environment variables, then overlay an
    /// optional TOML file named by `SUPPORTBOT_CONFIG_FILE` or passed
    /// explicitly via `--config`.
    pub fn load() -> Result<Self> {
        Self::load_from_env_and_file(None)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        Self::load_from_env_and_file(Some(path))
    }

    fn load_from_env_and_file(explicit_path: Option<&Path>) -> Result<Self> {
        let data_dir = std::env::var("SUPPORTBOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .map(|d| d.join("supportbot"))
                    .unwrap_or_else(|| PathBuf::from("./data"))
            });

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let mut builder = config::Config::builder().add_source(
            config::Environment::with_prefix("SUPPORTBOT")
                .separator("__")
                .try_parsing(true),
        );

        let file_path = explicit_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("SUPPORTBOT_CONFIG_FILE").ok().map(PathBuf::from))
            .unwrap_or_else(|| data_dir.join("config.toml"));

        if file_path.exists() {
            builder = builder.add_source(config::File::from(file_path.clone()).required(false));
        }

        let layered = builder
            .build()
            .with_context(|| format!("failed to load config layers from {}", file_path.display()))?;

        let anthropic_key = env_or_layered(&layered, "ANTHROPIC_API_KEY");
        let openai_key = env_or_layered(&layered, "OPENAI_API_KEY");

        let mut providers = HashMap::new();
        if let Some(key) = anthropic_key {
            providers.insert(
                "anthropic".to_string(),
                ProviderConfig {
                    api_type: ApiType::Anthropic,
                    base_url: "https://api.anthropic.com".to_string(),
                    api_key: key,
                },
            );
        }
        if let Some(key) = openai_key {
            providers.insert(
                "openai".to_string(),
                ProviderConfig {
                    api_type: ApiType::OpenAiCompletions,
                    base_url: "https://api.openai.com/v1".to_string(),
                    api_key: key,
                },
            );
        }

        if providers.is_empty() {
            return Err(ConfigError::Invalid(
                "no LLM provider API key found. Set ANTHROPIC_API_KEY or OPENAI_API_KEY.".into(),
            )
            .into());
        }

        let llm = LlmConfig {
            providers,
            task_models: TaskModels::default(),
            embedding_model: std::env::var("SUPPORTBOT_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "BAAI/bge-small-en-v1.5".to_string()),
        };

        let vector = VectorConfig {
            path: data_dir.join("vector"),
            collection: std::env::var("SUPPORTBOT_VECTOR_COLLECTION")
                .unwrap_or_else(|_| "cases".to_string()),
        };

        let pipeline = PipelineConfig {
            bot_mentions: std::env::var("SUPPORTBOT_BOT_MENTIONS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|_| PipelineConfig::default().bot_mentions),
            ..PipelineConfig::default()
        };

        let storage_roots = StorageRootsConfig {
            bot_storage_root: std::env::var("SUPPORTBOT_BOT_STORAGE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("attachments")),
            ingest_storage_root: std::env::var("SUPPORTBOT_INGEST_STORAGE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("ingest")),
            blob_store: blob_store_from_env(),
        };

        let telemetry = TelemetryConfig {
            log_level: std::env::var("SUPPORTBOT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_dir: std::env::var("SUPPORTBOT_LOG_DIR").ok().map(PathBuf::from),
            otlp_endpoint: std::env::var("SUPPORTBOT_OTLP_ENDPOINT").ok(),
        };

        let messaging = MessagingConfig {
            adapter: std::env::var("SUPPORTBOT_MESSAGING_ADAPTER")
                .unwrap_or_else(|_| "noop".to_string()),
            identity: std::env::var("SUPPORTBOT_MESSAGING_IDENTITY").ok(),
        };

        let http_bind = std::env::var("SUPPORTBOT_HTTP_BIND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| std::net::SocketAddr::from(([0, 0, 0, 0], 8088)));

        Ok(Self {
            data_dir,
            db_backend: DbBackend::Sqlite,
            llm,
            vector,
            pipeline,
            timeouts: TimeoutsConfig::default(),
            storage_roots,
            telemetry,
            messaging,
            http_bind,
        })
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("supportbot.db")
    }

    pub fn sqlite_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.sqlite_path().display())
    }
}

fn env_or_layered(layered: &config::Config, key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .or_else(|| layered.get_string(key).ok())
}

fn blob_store_from_env() -> Option<BlobStoreConfig> {
    let endpoint = std::env::var("SUPPORTBOT_R2_ENDPOINT").ok()?;
    let bucket = std::env::var("SUPPORTBOT_R2_BUCKET").ok()?;
    let access_key_id = std::env::var("SUPPORTBOT_R2_ACCESS_KEY_ID").ok()?;
    let secret_access_key = std::env::var("SUPPORTBOT_R2_SECRET_ACCESS_KEY").ok()?;
    Some(BlobStoreConfig {
        endpoint,
        bucket,
        access_key_id,
        secret_access_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_config_matches_spec_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.context_window, 40);
        assert_eq!(cfg.retrieve_top_k, 5);
        assert_eq!(cfg.worker_poll_interval_secs, 1);
        assert_eq!(cfg.chunk_char_cap, 12_000);
        assert_eq!(cfg.chunk_overlap_messages, 3);
        assert!((cfg.history_dedup_distance_threshold - 0.15).abs() < f32::EPSILON);
    }

    #[test]
    fn db_backend_defaults_to_sqlite() {
        assert_eq!(DbBackend::default(), DbBackend::Sqlite);
    }
}
