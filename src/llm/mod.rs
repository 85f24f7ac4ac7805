pub mod embedding;
pub mod gateway;
pub mod provider;
pub mod schemas;

pub use embedding::EmbeddingModel;
pub use gateway::LlmGateway;
