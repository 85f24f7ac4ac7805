//! Top-level error types for the support bot pipeline.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading and validation errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Box<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Relational storage errors (raw messages, jobs, buffers, cases, history tokens).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to connect to SQLite: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("case not found: {0}")]
    CaseNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Vector index (LanceDB) errors.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("failed to connect to vector store: {0}")]
    Connect(String),

    #[error("failed to open or create table: {0}")]
    Table(String),

    #[error("upsert failed: {0}")]
    Upsert(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// LLM provider, model, and schema-validation errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("missing API key for provider: {0}")]
    MissingProviderKey(String),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("completion failed: {0}")]
    CompletionFailed(String),

    /// LLM output failed schema validation. Not retried.
    #[error("schema validation failed for task {task}: {reason}")]
    SchemaValidation { task: &'static str, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {0} exceeded its total deadline")]
    DeadlineExceeded(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Messaging adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("adapter {0} not configured")]
    NotConfigured(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
