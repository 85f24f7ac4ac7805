pub mod buffer_update;
pub mod maybe_respond;

pub use buffer_update::BufferUpdateWorker;
pub use maybe_respond::MaybeRespondWorker;
