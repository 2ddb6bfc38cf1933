//! Data models for samples, predictions, and review.
//!
//! This module defines the core data structures used throughout the crate:
//!
//! - [`SampleId`] - Identifier of one (citing paper, data paper) pair
//! - [`Label`] / [`LabelSet`] - Closed verdict vocabulary
//! - [`Sample`] / [`SampleSet`] - Samples under evaluation, the single source of ground truth
//! - [`PredictionStrategy`] - Prompting strategy bound to a template, text field and parser mode
//! - [`PredictionRecord`] - Outcome of one strategy applied to one sample
//! - [`Verdict`] - Parsed model answer
//! - [`DisagreementCase`] - Prediction/ground-truth mismatch for review
//! - [`CorrectionRequest`] / [`CorrectionEntry`] - Manual ground-truth overrides and their audit trail

use crate::client::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of one sample.
///
/// Ids that are both plain integers compare numerically, so `"2" < "10"`.
/// Otherwise ids compare as strings, with integer ids sorting first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleId(String);

impl SampleId {
    /// Create a sample id, trimming surrounding whitespace
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_string())
    }

    /// Borrow the id text
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Ord for SampleId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for SampleId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SampleId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<u64> for SampleId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Verdict labels for "does the citing paper use the data paper's data".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    /// The dataset is analysed, trained on, evaluated, or compared against
    UsesData,
    /// The dataset is only mentioned (background, related work, outlook)
    DoesNotUseData,
    /// The model could not decide
    Uncertain,
}

impl Label {
    /// All labels in canonical order
    pub const ALL: [Self; 3] = [Self::UsesData, Self::DoesNotUseData, Self::Uncertain];

    /// Canonical snake-case identifier
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UsesData => "uses_data",
            Self::DoesNotUseData => "does_not_use_data",
            Self::Uncertain => "uncertain",
        }
    }

    /// Wording used in prompts and the `decision` field of model answers
    #[inline]
    #[must_use]
    pub const fn decision_text(&self) -> &'static str {
        match self {
            Self::UsesData => "Used",
            Self::DoesNotUseData => "Not Used",
            Self::Uncertain => "Uncertain",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*' | '.' | ','))
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
            .collect();

        match normalized.as_str() {
            "uses_data" | "used" | "uses" | "use" | "yes" | "true" | "1" | "1.0" => {
                Ok(Self::UsesData)
            }
            "does_not_use_data" | "not_used" | "unused" | "does_not_use" | "no" | "false"
            | "0" | "0.0" => Ok(Self::DoesNotUseData),
            "uncertain" | "unclear" | "unknown" | "undetermined" => Ok(Self::Uncertain),
            _ => Err(format!(
                "unknown label '{s}' (expected: uses_data, does_not_use_data, uncertain)"
            )),
        }
    }
}

/// Closed, ordered set of labels accepted by a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Label>", into = "Vec<Label>")]
pub struct LabelSet(Vec<Label>);

impl LabelSet {
    /// Build a label set, dropping duplicates while keeping first-seen order
    #[must_use]
    pub fn new(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut out = Vec::new();
        for label in labels {
            if !out.contains(&label) {
                out.push(label);
            }
        }
        Self(out)
    }

    /// Whether the set contains `label`
    #[inline]
    #[must_use]
    pub fn contains(&self, label: Label) -> bool {
        self.0.contains(&label)
    }

    /// Parse `text` and accept it only if the result is in this set
    #[must_use]
    pub fn parse(&self, text: &str) -> Option<Label> {
        text.parse::<Label>().ok().filter(|l| self.contains(*l))
    }

    /// Labels in set order
    #[inline]
    #[must_use]
    pub fn labels(&self) -> &[Label] {
        &self.0
    }

    /// Number of labels
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Label>> for LabelSet {
    fn from(labels: Vec<Label>) -> Self {
        Self::new(labels)
    }
}

impl From<LabelSet> for Vec<Label> {
    fn from(set: LabelSet) -> Self {
        set.0
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self(Label::ALL.to_vec())
    }
}

/// Text field of a [`Sample`] that a strategy consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    /// Paper abstract
    Abstract,
    /// Extracted full text
    FullText,
}

impl fmt::Display for TextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abstract => f.write_str("abstract"),
            Self::FullText => f.write_str("full_text"),
        }
    }
}

/// How a strategy's model answer is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    /// The answer is a bare JSON verdict
    Json,
    /// Free-form reasoning followed by a JSON verdict
    ChainOfThought,
}

/// Prompting strategy used to produce a prediction column.
///
/// Serialized as its [`id`](Self::id) string so it can key TOML tables and CSV cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PredictionStrategy {
    /// Zero-shot prompt over the abstract
    Abstract,
    /// Zero-shot prompt over the full text
    FulltextZeroShot,
    /// Few-shot chain-of-thought prompt over the full text
    FulltextFewShotCot,
}

impl PredictionStrategy {
    /// All strategies in canonical order
    pub const ALL: [Self; 3] = [
        Self::Abstract,
        Self::FulltextZeroShot,
        Self::FulltextFewShotCot,
    ];

    /// Stable identifier used in tables and on the command line
    #[inline]
    #[must_use]
    pub const fn id(&self) -> &'static str {
        match self {
            Self::Abstract => "abstract",
            Self::FulltextZeroShot => "fulltext-zeroshot",
            Self::FulltextFewShotCot => "fulltext-fewshot-cot",
        }
    }

    /// Text field the strategy's prompt embeds
    #[inline]
    #[must_use]
    pub const fn text_field(&self) -> TextField {
        match self {
            Self::Abstract => TextField::Abstract,
            Self::FulltextZeroShot | Self::FulltextFewShotCot => TextField::FullText,
        }
    }

    /// Parser mode for the strategy's answers
    #[inline]
    #[must_use]
    pub const fn parser_mode(&self) -> ParserMode {
        match self {
            Self::Abstract | Self::FulltextZeroShot => ParserMode::Json,
            Self::FulltextFewShotCot => ParserMode::ChainOfThought,
        }
    }

    /// Column name used in the wide prediction export
    #[must_use]
    pub fn column_name(&self) -> String {
        format!("prediction_{}", self.id().replace('-', "_"))
    }
}

impl fmt::Display for PredictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl From<PredictionStrategy> for String {
    fn from(strategy: PredictionStrategy) -> Self {
        strategy.id().to_string()
    }
}

impl TryFrom<String> for PredictionStrategy {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl std::str::FromStr for PredictionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "abstract" => Ok(Self::Abstract),
            "fulltext-zeroshot" | "zeroshot" | "zero-shot" => Ok(Self::FulltextZeroShot),
            "fulltext-fewshot-cot" | "fewshot-cot" | "few-shot-cot" | "cot" => {
                Ok(Self::FulltextFewShotCot)
            }
            _ => Err(format!(
                "unknown strategy '{s}'. Valid options: abstract, fulltext-zeroshot, fulltext-fewshot-cot"
            )),
        }
    }
}

/// Bibliographic context of a sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleMetadata {
    /// Citing paper identifier (usually a DOI)
    pub paper_id: Option<String>,
    /// Cited data paper identifier
    pub data_paper_id: Option<String>,
    /// Citing paper title
    pub citing_paper_title: Option<String>,
    /// Cited data paper title
    pub cited_data_paper_title: Option<String>,
}

/// One (citing paper, data paper) pair under evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Unique sample id
    pub id: SampleId,
    /// Abstract text, if collected
    pub abstract_text: Option<String>,
    /// Full text, if extracted
    pub full_text: Option<String>,
    /// Accepted label; `None` until annotated
    pub ground_truth: Option<Label>,
    /// Bibliographic context
    pub metadata: SampleMetadata,
}

impl Sample {
    /// Create a sample with only an id
    #[must_use]
    pub fn new(id: impl Into<SampleId>) -> Self {
        Self {
            id: id.into(),
            abstract_text: None,
            full_text: None,
            ground_truth: None,
            metadata: SampleMetadata::default(),
        }
    }

    /// Set the abstract
    #[must_use]
    pub fn with_abstract(mut self, text: impl Into<String>) -> Self {
        self.abstract_text = Some(text.into());
        self
    }

    /// Set the full text
    #[must_use]
    pub fn with_full_text(mut self, text: impl Into<String>) -> Self {
        self.full_text = Some(text.into());
        self
    }

    /// Set the ground-truth label
    #[must_use]
    pub const fn with_ground_truth(mut self, label: Label) -> Self {
        self.ground_truth = Some(label);
        self
    }

    /// Text for `field`, or `None` when absent or blank
    #[must_use]
    pub fn text(&self, field: TextField) -> Option<&str> {
        let text = match field {
            TextField::Abstract => self.abstract_text.as_deref(),
            TextField::FullText => self.full_text.as_deref(),
        };
        text.filter(|t| !t.trim().is_empty())
    }

    /// Best available text (full text, else abstract), cut to `max_chars`
    #[must_use]
    pub fn excerpt(&self, max_chars: usize) -> &str {
        self.text(TextField::FullText)
            .or_else(|| self.text(TextField::Abstract))
            .map_or("", |t| truncate_chars(t, max_chars))
    }
}

/// Samples keyed by id; owns the ground truth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSet {
    samples: BTreeMap<SampleId, Sample>,
}

impl SampleSet {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a sample. Returns `false` (and keeps the existing sample) on a duplicate id.
    pub fn insert(&mut self, sample: Sample) -> bool {
        if self.samples.contains_key(&sample.id) {
            return false;
        }
        self.samples.insert(sample.id.clone(), sample);
        true
    }

    /// Look up a sample
    #[must_use]
    pub fn get(&self, id: &SampleId) -> Option<&Sample> {
        self.samples.get(id)
    }

    /// Look up a sample mutably
    pub fn get_mut(&mut self, id: &SampleId) -> Option<&mut Sample> {
        self.samples.get_mut(id)
    }

    /// Ground-truth label of a sample, if the sample exists and is annotated
    #[must_use]
    pub fn ground_truth(&self, id: &SampleId) -> Option<Label> {
        self.samples.get(id).and_then(|s| s.ground_truth)
    }

    /// Samples in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.values()
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl FromIterator<Sample> for SampleSet {
    fn from_iter<I: IntoIterator<Item = Sample>>(iter: I) -> Self {
        let mut set = Self::new();
        for sample in iter {
            set.insert(sample);
        }
        set
    }
}

/// Outcome status of a prediction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    /// A label was obtained
    Success,
    /// Prompt construction or the request failed
    Failed,
    /// The model answered but no label could be extracted
    Unparsable,
}

impl PredictionStatus {
    /// Whether `retry_failed` should target this record
    #[inline]
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Unparsable)
    }
}

impl fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
            Self::Unparsable => f.write_str("unparsable"),
        }
    }
}

/// Result of applying one strategy to one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Sample the prediction is for
    pub sample_id: SampleId,
    /// Strategy that produced it
    pub strategy: PredictionStrategy,
    /// Model identifier
    pub model: String,
    /// Predicted label (`Some` only on success)
    pub label: Option<Label>,
    /// Model rationale, if given
    pub rationale: Option<String>,
    /// Raw model answer, kept for diagnosis
    pub raw_response: Option<String>,
    /// Outcome status
    pub status: PredictionStatus,
    /// Failure kind for non-success records
    pub failure: Option<FailureKind>,
    /// Failure diagnostics
    pub message: Option<String>,
    /// When the record was produced
    pub timestamp: DateTime<Utc>,
}

impl PredictionRecord {
    /// Whether the record carries a label
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == PredictionStatus::Success
    }
}

/// Structured model answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Extracted label
    pub label: Label,
    /// Model rationale, if any
    pub rationale: Option<String>,
}

/// A sample whose prediction differs from its ground truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisagreementCase {
    /// Sample id
    pub sample_id: SampleId,
    /// Prediction column the case came from
    pub column: String,
    /// Current ground-truth label
    pub ground_truth: Label,
    /// Predicted label
    pub predicted: Label,
    /// Model rationale, if recorded
    pub rationale: Option<String>,
    /// Text excerpt shown to the reviewer
    pub excerpt: String,
    /// Citing paper title
    pub citing_paper_title: Option<String>,
    /// Cited data paper title
    pub cited_data_paper_title: Option<String>,
}

/// Reviewer-supplied override for one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    /// New label, as text
    pub label: String,
    /// Why the label changes
    #[serde(default)]
    pub justification: String,
}

/// Audit record of an applied correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionEntry {
    /// Corrected sample
    pub sample_id: SampleId,
    /// Label before the correction
    pub previous: Option<Label>,
    /// Label after the correction
    pub corrected: Label,
    /// Reviewer justification
    pub justification: String,
    /// When the correction was applied
    pub applied_at: DateTime<Utc>,
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
