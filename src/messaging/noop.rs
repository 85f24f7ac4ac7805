//! Local/no-op messaging adapter: logs the reply instead of sending it.
//! Used when no real platform adapter is configured, and by tests.

use crate::error::Result;
use crate::messaging::traits::{Messaging, Quote};
use std::sync::Mutex;

/// One recorded send, as a worker-loop test would want to assert on it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSend {
    pub group_id: String,
    pub text: String,
    pub quote_author: Option<String>,
    pub mentions: Vec<String>,
}

/// Records every send in-process instead of talking to a real platform.
/// Useful both as the default adapter and as a test double that lets a
/// worker-loop test assert on what would have been sent.
#[derive(Default)]
pub struct NoopAdapter {
    sent: Mutex<Vec<RecordedSend>>,
}

impl NoopAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_messages(&self) -> Vec<RecordedSend> {
        self.sent.lock().expect("noop adapter mutex poisoned").clone()
    }
}

impl Messaging for NoopAdapter {
    async fn send(&self, group_id: &str, text: &str, quote: Option<&Quote>, mentions: &[String]) -> Result<()> {
        tracing::info!(
            group_id,
            text,
            quote_author = quote.map(|q| q.author.as_str()),
            mentions = ?mentions,
            "noop adapter: would send message"
        );
        self.sent.lock().expect("noop adapter mutex poisoned").push(RecordedSend {
            group_id: group_id.to_string(),
            text: text.to_string(),
            quote_author: quote.map(|q| q.author.clone()),
            mentions: mentions.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sent_messages() {
        let adapter = NoopAdapter::new();
        let quote = Quote { ts: 1, author: "alice".to_string(), excerpt: "hi".to_string() };
        adapter
            .send("G", "hello", Some(&quote), &["alice".to_string()])
            .await
            .unwrap();
        assert_eq!(
            adapter.sent_messages(),
            vec![RecordedSend {
                group_id: "G".to_string(),
                text: "hello".to_string(),
                quote_author: Some("alice".to_string()),
                mentions: vec!["alice".to_string()],
            }]
        );
    }

    #[tokio::test]
    async fn records_send_without_quote() {
        let adapter = NoopAdapter::new();
        adapter.send("G", "hello", None, &[]).await.unwrap();
        let sent = adapter.sent_messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].quote_author.is_none());
    }
}
