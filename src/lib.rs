//! Group-chat support assistant: mines solved cases out of ongoing chat
//! traffic, answers repeat questions from retrieval, and bulk-imports a
//! group's prior history on request.

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod history;
pub mod ingestion;
pub mod llm;
pub mod messaging;
pub mod queue;
pub mod reconciler;
pub mod storage;
pub mod telemetry;
pub mod vector;
pub mod workers;

pub use error::{Error, Result};
