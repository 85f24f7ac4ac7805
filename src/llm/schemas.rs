//! Typed, schema-validated shapes for each LLM task. Ported in meaning from
//! the original pydantic models: same fields, same validation rules.

use crate::error::LlmError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Output of the image-to-text task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImgExtract {
    pub observations: Vec<String>,
    pub extracted_text: String,
}

impl ImgExtract {
    /// Render into the bracketed annotation appended to a message's text,
    /// per the `[Image: ...]` / `[Image]` wording.
    pub fn to_annotation(&self) -> String {
        let has_text = !self.extracted_text.trim().is_empty();
        let has_observations = !self.observations.is_empty();

        if !has_text && !has_observations {
            return "\n\n[Image]".to_string();
        }

        let mut parts = Vec::new();
        if has_text {
            parts.push(format!("Text on image: {}", self.extracted_text));
        }
        if has_observations {
            parts.push(format!("Elements: {}", self.observations.join(", ")));
        }
        format!("\n\n[Image: {}]", parts.join(" | "))
    }
}

/// One candidate case span located inside the rolling buffer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedCaseSpan {
    pub start_idx: i64,
    pub end_idx: i64,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub case_block: String,
}

/// Output of the extract task: zero or more non-overlapping spans.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractResult {
    pub cases: Vec<ExtractedCaseSpan>,
}

impl ExtractResult {
    /// Enforce: no negative index, `start <= end`, spans sorted and
    /// non-overlapping. Any violation rejects the whole result, not just
    /// the offending span.
    pub fn validate(&self) -> Result<(), LlmError> {
        let mut prev_end: Option<i64> = None;

        for span in &self.cases {
            if span.start_idx < 0 || span.end_idx < 0 {
                return Err(LlmError::SchemaValidation {
                    task: "extract",
                    reason: format!(
                        "negative span index: start_idx={}, end_idx={}",
                        span.start_idx, span.end_idx
                    ),
                });
            }
            if span.start_idx > span.end_idx {
                return Err(LlmError::SchemaValidation {
                    task: "extract",
                    reason: format!(
                        "start_idx {} is after end_idx {}",
                        span.start_idx, span.end_idx
                    ),
                });
            }
            if let (Some(start_line), Some(end_line)) = (span.start_line, span.end_line) {
                if start_line > end_line {
                    return Err(LlmError::SchemaValidation {
                        task: "extract",
                        reason: format!(
                            "start_line {start_line} is after end_line {end_line}"
                        ),
                    });
                }
            }
            if let Some(prev_end) = prev_end {
                if span.start_idx <= prev_end {
                    return Err(LlmError::SchemaValidation {
                        task: "extract",
                        reason: format!(
                            "span starting at {} overlaps previous span ending at {}",
                            span.start_idx, prev_end
                        ),
                    });
                }
            }
            prev_end = Some(span.end_idx);
        }

        Ok(())
    }
}

/// Output of the structure task: decision on whether to keep a candidate
/// span as a case, and its structured content.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CaseResult {
    pub keep: bool,
    pub status: CaseResultStatus,
    pub problem_title: String,
    pub problem_summary: String,
    pub solution_summary: String,
    pub tags: Vec<String>,
    pub evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseResultStatus {
    Solved,
    Open,
}

/// Output of the gate task: whether a new message warrants consideration at all.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DecisionResult {
    pub consider: bool,
    pub tag: DecisionTag,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTag {
    NewQuestion,
    OngoingDiscussion,
    Noise,
    Statement,
}

/// Output of the respond task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RespondResult {
    pub respond: bool,
    pub text: String,
    pub citations: Vec<String>,
}

/// One case block recovered during history bootstrap chunk processing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BlocksCase {
    pub case_block: String,
}

/// Output of the history-blocks task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BlocksResult {
    pub cases: Vec<BlocksCase>,
}

/// Result of checking whether a still-open case has been resolved by the
/// current buffer contents.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResolutionResult {
    pub resolved: bool,
    pub solution_summary: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: i64, end: i64) -> ExtractedCaseSpan {
        ExtractedCaseSpan {
            start_idx: start,
            end_idx: end,
            start_line: None,
            end_line: None,
            case_block: "block".to_string(),
        }
    }

    #[test]
    fn accepts_sorted_non_overlapping_spans() {
        let result = ExtractResult { cases: vec![span(0, 5), span(6, 10)] };
        assert!(result.validate().is_ok());
    }

    #[test]
    fn rejects_negative_index() {
        let result = ExtractResult { cases: vec![span(-1, 5)] };
        assert!(result.validate().is_err());
    }

    #[test]
    fn rejects_start_after_end() {
        let result = ExtractResult { cases: vec![span(10, 5)] };
        assert!(result.validate().is_err());
    }

    #[test]
    fn rejects_overlapping_spans() {
        let result = ExtractResult { cases: vec![span(0, 10), span(5, 15)] };
        assert!(result.validate().is_err());
    }

    #[test]
    fn rejects_unsorted_spans() {
        let result = ExtractResult { cases: vec![span(10, 15), span(0, 5)] };
        assert!(result.validate().is_err());
    }

    #[test]
    fn img_extract_annotation_with_text_and_observations() {
        let extract = ImgExtract {
            observations: vec!["a whiteboard".to_string(), "a laptop".to_string()],
            extracted_text: "VPN error 619".to_string(),
        };
        assert_eq!(
            extract.to_annotation(),
            "\n\n[Image: Text on image: VPN error 619 | Elements: a whiteboard, a laptop]"
        );
    }

    #[test]
    fn img_extract_annotation_falls_back_when_empty() {
        let extract = ImgExtract { observations: vec![], extracted_text: String::new() };
        assert_eq!(extract.to_annotation(), "\n\n[Image]");
    }
}
