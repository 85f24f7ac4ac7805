//! Core data model shared by storage, the vector index, and the workers:
//! `RawMessage`, `Buffer`, `Case`, `Job`, `HistoryToken`, `VectorEntry`.

use serde::{Deserialize, Serialize};

/// A message as ingested from the messaging adapter. Immutable after insertion;
/// insertion is idempotent on `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMessage {
    pub message_id: String,
    pub group_id: String,
    /// Monotonic producer timestamp, milliseconds since epoch.
    pub ts: i64,
    /// SHA-256 of the adapter-provided sender identity, truncated to 16 hex chars.
    pub sender_hash: String,
    pub content_text: String,
    pub image_paths: Vec<String>,
    pub reply_to_id: Option<String>,
    /// Set when `MAYBE_RESPOND` has already answered this message from retrieval.
    pub rag_answered: bool,
}

impl RawMessage {
    /// Canonical buffer line: `"[<iso-ts>] <sender_hash>: <content_text>\n"`.
    pub fn canonical_line(&self) -> String {
        let iso_ts = chrono::DateTime::from_timestamp_millis(self.ts)
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc3339();
        format!("[{iso_ts}] {}: {}\n", self.sender_hash, self.content_text)
    }
}

/// Status of a mined or history-bootstrapped case.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Solved,
    Open,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Solved => "solved",
            CaseStatus::Open => "open",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "solved" => Some(CaseStatus::Solved),
            "open" => Some(CaseStatus::Open),
            _ => None,
        }
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A structured, embedded record of a problem and (usually) its resolution.
/// Cases are never mutated in place: a status transition is a brand new row
/// that supersedes the old one by lineage, not by update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Case {
    pub case_id: String,
    pub group_id: String,
    pub status: CaseStatus,
    pub problem_title: String,
    pub problem_summary: String,
    pub solution_summary: String,
    pub tags: Vec<String>,
    pub evidence_ids: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Case {
    /// Canonical retrieval document: title + problem + solution + tags.
    pub fn canonical_document(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}",
            self.problem_title,
            self.problem_summary,
            self.solution_summary,
            self.tags.join(", ")
        )
    }

    /// Title + problem summary only, used by history bootstrap's cross-chunk
    /// dedup check (SPEC_FULL.md §4.5) — narrower than `canonical_document`
    /// so two cases with the same problem but differently-worded solutions
    /// still collapse into one.
    pub fn dedup_document(&self) -> String {
        format!("{}\n{}", self.problem_title, self.problem_summary)
    }
}

/// Kinds of durable jobs the queue dispatches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    BufferUpdate,
    MaybeRespond,
    SyncRag,
    HistoryLink,
    HistorySync,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::BufferUpdate => "BUFFER_UPDATE",
            JobKind::MaybeRespond => "MAYBE_RESPOND",
            JobKind::SyncRag => "SYNC_RAG",
            JobKind::HistoryLink => "HISTORY_LINK",
            JobKind::HistorySync => "HISTORY_SYNC",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BUFFER_UPDATE" => Some(JobKind::BufferUpdate),
            "MAYBE_RESPOND" => Some(JobKind::MaybeRespond),
            "SYNC_RAG" => Some(JobKind::SyncRag),
            "HISTORY_LINK" => Some(JobKind::HistoryLink),
            "HISTORY_SYNC" => Some(JobKind::HistorySync),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "in_progress" => Some(JobStatus::InProgress),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A durable unit of pipeline work. At most one worker may hold a given job
/// `in_progress` at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i64,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub claimed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Payload shared by `BUFFER_UPDATE` and `MAYBE_RESPOND` jobs: enough to
/// reconstruct the triggering inbound event without a second lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageJobPayload {
    pub group_id: String,
    pub message_id: String,
    pub sender: String,
    pub ts: i64,
    pub text: String,
}

/// Single-use token authorising a bulk history-bootstrap ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryToken {
    pub token: String,
    pub group_id: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub used: bool,
}

/// Projection of a `Case` into the vector index: `id = case_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    pub case_id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub group_id: String,
    pub status: CaseStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub evidence_ids: Vec<String>,
}

/// A vector search hit: the stored entry plus similarity distance (lower is closer).
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub entry: VectorEntry,
    pub distance: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_line_has_expected_shape() {
        let msg = RawMessage {
            message_id: "m1".into(),
            group_id: "g1".into(),
            ts: 1_700_000_000_000,
            sender_hash: "abc123abc123abcd".into(),
            content_text: "hello there".into(),
            image_paths: vec![],
            reply_to_id: None,
            rag_answered: false,
        };
        let line = msg.canonical_line();
        assert!(line.starts_with('['));
        assert!(line.contains("abc123abc123abcd: hello there"));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn case_canonical_document_joins_tags() {
        let case = Case {
            case_id: "c1".into(),
            group_id: "g1".into(),
            status: CaseStatus::Solved,
            problem_title: "VPN fails".into(),
            problem_summary: "negotiation failed".into(),
            solution_summary: "update client".into(),
            tags: vec!["vpn".into(), "network".into()],
            evidence_ids: vec!["m1".into()],
            created_at: chrono::Utc::now(),
        };
        let doc = case.canonical_document();
        assert_eq!(doc, "VPN fails\nnegotiation failed\nupdate client\nvpn, network");
    }

    #[test]
    fn job_kind_round_trips_through_str() {
        for kind in [
            JobKind::BufferUpdate,
            JobKind::MaybeRespond,
            JobKind::SyncRag,
            JobKind::HistoryLink,
            JobKind::HistorySync,
        ] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
    }
}
