//! Transcript chunking for history bootstrap: split into character-capped
//! chunks with a fixed message-count overlap so a case split across the
//! chunk boundary still appears whole in at least one chunk.

/// One message from an imported historical transcript.
#[derive(Debug, Clone)]
pub struct TranscriptMessage {
    pub sender: String,
    pub ts: i64,
    pub text: String,
}

impl TranscriptMessage {
    fn rendered(&self) -> String {
        format!("[{}] {}: {}\n", self.ts, self.sender, self.text)
    }
}

/// Chunk a transcript into text blocks no larger than `char_cap`, each
/// overlapping the previous by `overlap_messages` messages.
pub fn chunk_transcript(
    transcript: &[TranscriptMessage],
    char_cap: usize,
    overlap_messages: usize,
) -> Vec<String> {
    if transcript.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < transcript.len() {
        let mut end = start;
        let mut current_len = 0;

        while end < transcript.len() {
            let rendered_len = transcript[end].rendered().len();
            if current_len > 0 && current_len + rendered_len > char_cap {
                break;
            }
            current_len += rendered_len;
            end += 1;
        }

        // Guarantee progress even if a single message exceeds the cap.
        if end == start {
            end = start + 1;
        }

        let text = transcript[start..end]
            .iter()
            .map(TranscriptMessage::rendered)
            .collect::<String>();
        chunks.push(text);

        if end >= transcript.len() {
            break;
        }
        start = end.saturating_sub(overlap_messages).max(start + 1);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: i64, text: &str) -> TranscriptMessage {
        TranscriptMessage { sender: "alice".to_string(), ts: n, text: text.to_string() }
    }

    #[test]
    fn empty_transcript_yields_no_chunks() {
        assert!(chunk_transcript(&[], 100, 2).is_empty());
    }

    #[test]
    fn small_transcript_fits_in_one_chunk() {
        let transcript = vec![message(1, "hi"), message(2, "there")];
        let chunks = chunk_transcript(&transcript, 10_000, 2);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn large_transcript_splits_with_overlap() {
        let transcript: Vec<_> = (0..50).map(|i| message(i, "a reasonably long message body here")).collect();
        let chunks = chunk_transcript(&transcript, 500, 3);
        assert!(chunks.len() > 1);

        // With a nonzero overlap, consecutive chunks share rendered content,
        // so the chunks combined are longer than the transcript rendered once.
        let rendered_once: usize = transcript.iter().map(|m| m.rendered().len()).sum();
        let rendered_chunks: usize = chunks.iter().map(String::len).sum();
        assert!(rendered_chunks > rendered_once);
    }

    #[test]
    fn oversized_single_message_still_makes_progress() {
        let huge_text = "x".repeat(5000);
        let transcript = vec![message(1, &huge_text), message(2, "short")];
        let chunks = chunk_transcript(&transcript, 100, 2);
        assert!(chunks.len() >= 2);
    }
}
