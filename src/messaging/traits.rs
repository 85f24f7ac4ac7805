//! Thin adapter trait the pipeline sends replies through. Grounded on the
//! teacher's `Messaging`/`MessagingDyn` split: the async trait is written
//! naturally with RPITIT, and a hand-written dyn-compatible shim lets the
//! rest of the crate hold `Arc<dyn MessagingDyn>` without naming a concrete
//! adapter type.

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;

/// A quoted excerpt of the message being replied to, per §6's
/// `quote?: {ts, author, excerpt}`.
#[derive(Debug, Clone)]
pub struct Quote {
    pub ts: i64,
    pub author: String,
    /// First 200 characters of the original text.
    pub excerpt: String,
}

/// A destination platform for outbound replies (Signal, Matrix, a test double, ...).
pub trait Messaging: Send + Sync {
    fn send(
        &self,
        group_id: &str,
        text: &str,
        quote: Option<&Quote>,
        mentions: &[String],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Object-safe counterpart of [`Messaging`], boxing the future by hand so a
/// trait object can be used where `impl Future` return position cannot.
pub trait MessagingDyn: Send + Sync {
    fn send_boxed<'a>(
        &'a self,
        group_id: &'a str,
        text: &'a str,
        quote: Option<&'a Quote>,
        mentions: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

impl<T: Messaging> MessagingDyn for T {
    fn send_boxed<'a>(
        &'a self,
        group_id: &'a str,
        text: &'a str,
        quote: Option<&'a Quote>,
        mentions: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.send(group_id, text, quote, mentions))
    }
}
