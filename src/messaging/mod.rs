pub mod noop;
pub mod traits;

pub use noop::{NoopAdapter, RecordedSend};
pub use traits::{Messaging, MessagingDyn, Quote};
