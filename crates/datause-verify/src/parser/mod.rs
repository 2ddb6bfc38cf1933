//! Verdict extraction from raw model answers.
//!
//! Parsing tolerates surrounding prose and markdown fences but is strict about
//! the label: an answer whose decision is missing, or is not in the closed
//! label set, is [`Unparsable`](crate::client::FailureKind::Unparsable).
//!
//! Extraction order:
//! 1. A JSON object (fenced, embedded, or the last object after reasoning)
//!    with a `decision` / `label` / `answer` / `verdict` key
//! 2. The last `Decision:` / `Label:` / `Final answer:` / `Answer:` line
//! 3. An answer that is nothing but a label

use crate::client::Failure;
use crate::models::{Label, LabelSet, ParserMode, PredictionStrategy, Verdict};
use serde_json::Value;

const LABEL_KEYS: [&str; 4] = ["decision", "label", "answer", "verdict"];
const RATIONALE_KEYS: [&str; 4] = ["reasoning", "rationale", "explanation", "justification"];
const MARKERS: [&str; 4] = ["final answer:", "decision:", "label:", "answer:"];

/// Parses model answers against a closed label set.
#[derive(Debug, Clone, Default)]
pub struct ResponseParser {
    labels: LabelSet,
}

impl ResponseParser {
    /// Parser accepting only `labels`
    #[must_use]
    pub const fn new(labels: LabelSet) -> Self {
        Self { labels }
    }

    /// Extract a verdict from `raw`.
    ///
    /// # Errors
    /// Returns an `Unparsable` failure when no accepted label can be found.
    pub fn parse(&self, raw: &str, strategy: PredictionStrategy) -> Result<Verdict, Failure> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Failure::unparsable("empty response"));
        }

        if let Some((object, start)) = find_verdict_object(raw) {
            if let Some(decision) = LABEL_KEYS.iter().find_map(|k| object.get(*k)) {
                let text = value_text(decision);
                let label = self.labels.parse(&text).ok_or_else(|| {
                    Failure::unparsable(format!("label '{text}' is not in the accepted set"))
                })?;

                let rationale = RATIONALE_KEYS
                    .iter()
                    .find_map(|k| object.get(*k))
                    .map(value_text)
                    .filter(|r| !r.trim().is_empty())
                    .or_else(|| match strategy.parser_mode() {
                        ParserMode::ChainOfThought => {
                            let prose = strip_fence_opening(raw[..start].trim());
                            (!prose.is_empty()).then(|| prose.to_string())
                        }
                        ParserMode::Json => None,
                    });

                return Ok(Verdict { label, rationale });
            }
        }

        if let Some(label) = self.marker_label(raw) {
            let rationale = match strategy.parser_mode() {
                ParserMode::ChainOfThought => Some(raw.to_string()),
                ParserMode::Json => None,
            };
            return Ok(Verdict { label, rationale });
        }

        if let Some(label) = self.labels.parse(raw) {
            return Ok(Verdict {
                label,
                rationale: None,
            });
        }

        Err(Failure::unparsable("no recognizable label in response"))
    }

    /// Label on the last marker line, if any
    fn marker_label(&self, raw: &str) -> Option<Label> {
        raw.lines().rev().find_map(|line| {
            let lower = line.trim().to_lowercase();
            let lower = lower.trim_start_matches(['*', '#', '-', ' ']);
            MARKERS.iter().find_map(|marker| {
                lower
                    .strip_prefix(marker)
                    .and_then(|rest| self.labels.parse(rest.trim_start_matches('*')))
            })
        })
    }
}

/// Find the JSON object carrying a label key, returning it with its byte offset.
///
/// Tries each fenced block, then the span from the first `{` to the last
/// `}`, then the last `{` onward (reasoning followed by a verdict). Objects
/// without a label key (quoted metadata, for example) are skipped.
fn find_verdict_object(text: &str) -> Option<(serde_json::Map<String, Value>, usize)> {
    let mut candidates: Vec<(usize, usize)> = Vec::new();

    let mut cursor = 0;
    while let Some(fence) = text[cursor..].find("```").map(|i| cursor + i) {
        let Some(body_start) = text[fence..].find('\n').map(|n| fence + n + 1) else {
            break;
        };
        let Some(len) = text[body_start..].find("```") else {
            break;
        };
        candidates.push((body_start, body_start + len));
        cursor = body_start + len + 3;
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            candidates.push((start, end + 1));
        }
    }
    if let Some(end) = text.rfind('}') {
        if let Some(start) = text[..end].rfind('{') {
            candidates.push((start, end + 1));
        }
    }

    candidates.into_iter().find_map(|(start, end)| {
        match serde_json::from_str::<Value>(text[start..end].trim()) {
            Ok(Value::Object(map)) if LABEL_KEYS.iter().any(|k| map.contains_key(*k)) => {
                Some((map, fence_start(text, start)))
            }
            _ => None,
        }
    })
}

/// Offset of the fence line that opens the block at `start`, if any.
fn fence_start(text: &str, start: usize) -> usize {
    let before = text[..start].trim_end();
    before
        .rfind("```")
        .filter(|pos| !before[*pos..].contains('\n'))
        .unwrap_or(start)
}

fn strip_fence_opening(text: &str) -> &str {
    text.trim_end_matches("```json").trim_end_matches("```").trim()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
