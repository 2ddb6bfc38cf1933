//! Scoring prediction columns against ground truth.
//!
//! [`EvaluationEngine::compute_metrics`] restricts to samples that have both a
//! prediction and a ground-truth label, builds a confusion matrix (rows are
//! ground truth, columns are predictions) and derives per-class and macro
//! metrics from it. `uncertain` is a class of its own. Zero denominators give
//! 0.0, never NaN.
//!
//! [`EvaluationEngine::find_disagreements`] lists the eligible samples whose
//! prediction differs from ground truth, in ascending sample-id order.

// Clippy pedantic allows:
// - usize counts become f64 ratios; counts stay far below 2^52
#![allow(clippy::cast_precision_loss)]

pub mod hybrid;

use crate::config::PipelineConfig;
use crate::error::{Result, VerifyError};
use crate::models::{DisagreementCase, Label, LabelSet, PredictionStrategy, SampleId, SampleSet};
use crate::runner::PredictionTable;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// One named column of predicted labels, keyed by sample id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictionColumn {
    name: String,
    labels: BTreeMap<SampleId, Label>,
    rationales: BTreeMap<SampleId, String>,
}

impl PredictionColumn {
    /// Empty column
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            rationales: BTreeMap::new(),
        }
    }

    /// Column from `(id, label)` pairs
    #[must_use]
    pub fn from_labels(
        name: impl Into<String>,
        labels: impl IntoIterator<Item = (SampleId, Label)>,
    ) -> Self {
        Self {
            name: name.into(),
            labels: labels.into_iter().collect(),
            rationales: BTreeMap::new(),
        }
    }

    /// Successful predictions of one strategy, with their rationales
    #[must_use]
    pub fn from_table(table: &PredictionTable, strategy: PredictionStrategy) -> Self {
        let mut column = Self::new(strategy.column_name());
        for record in table.strategy_records(strategy) {
            if let Some(label) = record.label {
                column.labels.insert(record.sample_id.clone(), label);
                if let Some(rationale) = &record.rationale {
                    column
                        .rationales
                        .insert(record.sample_id.clone(), rationale.clone());
                }
            }
        }
        column
    }

    /// Set the prediction for `id`
    pub fn insert(&mut self, id: SampleId, label: Label) {
        self.labels.insert(id, label);
    }

    /// Column name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prediction for `id`
    #[must_use]
    pub fn get(&self, id: &SampleId) -> Option<Label> {
        self.labels.get(id).copied()
    }

    /// Rationale recorded for `id`
    #[must_use]
    pub fn rationale(&self, id: &SampleId) -> Option<&str> {
        self.rationales.get(id).map(String::as_str)
    }

    /// Predictions in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = (&SampleId, Label)> {
        self.labels.iter().map(|(id, l)| (id, *l))
    }

    /// Number of predictions
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the column has no predictions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Which labels a metric table covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LabelPolicy {
    /// Labels observed among eligible predictions and ground truth
    #[default]
    Observed,
    /// A fixed set, extended with any other observed label
    Fixed(LabelSet),
}

/// Confusion matrix; rows are ground truth, columns are predictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    labels: Vec<Label>,
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    fn new(labels: Vec<Label>) -> Self {
        let n = labels.len();
        Self {
            labels,
            counts: vec![vec![0; n]; n],
        }
    }

    fn index(&self, label: Label) -> Option<usize> {
        self.labels.iter().position(|l| *l == label)
    }

    fn record(&mut self, truth: Label, predicted: Label) {
        if let (Some(row), Some(col)) = (self.index(truth), self.index(predicted)) {
            self.counts[row][col] += 1;
        }
    }

    /// Labels in row/column order
    #[must_use]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Raw counts, `counts[truth][predicted]`
    #[must_use]
    pub fn counts(&self) -> &[Vec<usize>] {
        &self.counts
    }

    /// Samples with ground truth `truth` predicted as `predicted`
    #[must_use]
    pub fn count(&self, truth: Label, predicted: Label) -> usize {
        match (self.index(truth), self.index(predicted)) {
            (Some(row), Some(col)) => self.counts[row][col],
            _ => 0,
        }
    }

    /// Sum of all cells
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// Diagonal sum
    #[must_use]
    pub fn correct(&self) -> usize {
        (0..self.labels.len()).map(|i| self.counts[i][i]).sum()
    }

    fn true_positives(&self, i: usize) -> usize {
        self.counts[i][i]
    }

    fn predicted_as(&self, i: usize) -> usize {
        self.counts.iter().map(|row| row[i]).sum()
    }

    fn actual(&self, i: usize) -> usize {
        self.counts[i].iter().sum()
    }
}

/// Precision, recall and F1 for one class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    /// Class label
    pub label: Label,
    /// TP / (TP + FP)
    pub precision: f64,
    /// TP / (TP + FN)
    pub recall: f64,
    /// Harmonic mean of precision and recall
    pub f1: f64,
    /// Eligible samples whose ground truth is this class
    pub support: usize,
}

/// Metrics for one prediction column against one ground-truth snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Prediction column name
    pub column: String,
    /// Samples with both a prediction and a ground-truth label
    pub eligible: usize,
    /// Confusion matrix over the evaluated labels
    pub confusion: ConfusionMatrix,
    /// Per-class metrics, in matrix label order
    pub per_class: Vec<ClassMetrics>,
    /// Fraction of eligible samples predicted correctly
    pub accuracy: f64,
    /// Unweighted mean of per-class precision
    pub macro_precision: f64,
    /// Unweighted mean of per-class recall
    pub macro_recall: f64,
    /// Unweighted mean of per-class F1
    pub macro_f1: f64,
}

impl EvaluationResult {
    /// Metrics for `label`, if it is in the matrix
    #[must_use]
    pub fn class(&self, label: Label) -> Option<&ClassMetrics> {
        self.per_class.iter().find(|c| c.label == label)
    }
}

/// Computes metrics and disagreements.
#[derive(Debug, Clone)]
pub struct EvaluationEngine {
    policy: LabelPolicy,
    excerpt_chars: usize,
}

impl Default for EvaluationEngine {
    fn default() -> Self {
        Self::new(LabelPolicy::Observed, 30_000)
    }
}

impl EvaluationEngine {
    /// Engine with a label policy and review excerpt length
    #[must_use]
    pub const fn new(policy: LabelPolicy, excerpt_chars: usize) -> Self {
        Self {
            policy,
            excerpt_chars,
        }
    }

    /// Engine configured from `config.metric_labels` and `config.review_excerpt_chars`
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let policy = config
            .metric_labels
            .clone()
            .map_or(LabelPolicy::Observed, LabelPolicy::Fixed);
        Self::new(policy, config.review_excerpt_chars)
    }

    /// Score `predictions` against the ground truth held by `samples`.
    ///
    /// # Errors
    /// Returns [`VerifyError::InsufficientData`] if no sample has both a
    /// prediction and a ground-truth label.
    pub fn compute_metrics(
        &self,
        predictions: &PredictionColumn,
        samples: &SampleSet,
    ) -> Result<EvaluationResult> {
        let pairs = eligible_pairs(predictions, samples);
        if pairs.is_empty() {
            return Err(VerifyError::InsufficientData {
                column: predictions.name().to_string(),
            });
        }

        let mut confusion = ConfusionMatrix::new(self.metric_labels(&pairs));
        for (_, truth, predicted) in &pairs {
            confusion.record(*truth, *predicted);
        }

        let per_class: Vec<ClassMetrics> = confusion
            .labels()
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let tp = confusion.true_positives(i);
                let precision = ratio(tp, confusion.predicted_as(i));
                let recall = ratio(tp, confusion.actual(i));
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    label: *label,
                    precision,
                    recall,
                    f1,
                    support: confusion.actual(i),
                }
            })
            .collect();

        let n_classes = per_class.len() as f64;
        let mean = |f: fn(&ClassMetrics) -> f64| per_class.iter().map(f).sum::<f64>() / n_classes;

        let result = EvaluationResult {
            column: predictions.name().to_string(),
            eligible: pairs.len(),
            accuracy: ratio(confusion.correct(), confusion.total()),
            macro_precision: mean(|c| c.precision),
            macro_recall: mean(|c| c.recall),
            macro_f1: mean(|c| c.f1),
            per_class,
            confusion,
        };
        debug!(
            "{}: {} eligible, accuracy {:.3}",
            result.column, result.eligible, result.accuracy
        );
        Ok(result)
    }

    /// Eligible samples whose prediction differs from ground truth, sorted by id.
    #[must_use]
    pub fn find_disagreements(
        &self,
        predictions: &PredictionColumn,
        samples: &SampleSet,
    ) -> Vec<DisagreementCase> {
        eligible_pairs(predictions, samples)
            .into_iter()
            .filter(|(_, truth, predicted)| truth != predicted)
            .filter_map(|(id, truth, predicted)| {
                let sample = samples.get(id)?;
                Some(DisagreementCase {
                    sample_id: id.clone(),
                    column: predictions.name().to_string(),
                    ground_truth: truth,
                    predicted,
                    rationale: predictions.rationale(id).map(str::to_string),
                    excerpt: sample.excerpt(self.excerpt_chars).to_string(),
                    citing_paper_title: sample.metadata.citing_paper_title.clone(),
                    cited_data_paper_title: sample.metadata.cited_data_paper_title.clone(),
                })
            })
            .collect()
    }

    fn metric_labels(&self, pairs: &[(&SampleId, Label, Label)]) -> Vec<Label> {
        let observed: BTreeSet<Label> = pairs.iter().flat_map(|(_, t, p)| [*t, *p]).collect();
        match &self.policy {
            LabelPolicy::Observed => observed.into_iter().collect(),
            LabelPolicy::Fixed(fixed) => {
                let mut labels = fixed.labels().to_vec();
                labels.extend(observed.into_iter().filter(|l| !fixed.contains(*l)));
                labels
            }
        }
    }
}

/// `(id, truth, predicted)` for samples with both labels, in id order
fn eligible_pairs<'a>(
    predictions: &'a PredictionColumn,
    samples: &SampleSet,
) -> Vec<(&'a SampleId, Label, Label)> {
    predictions
        .iter()
        .filter_map(|(id, predicted)| samples.ground_truth(id).map(|truth| (id, truth, predicted)))
        .collect()
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sample;

    fn samples(truth: &[(&str, Option<Label>)]) -> SampleSet {
        truth
            .iter()
            .map(|(id, label)| {
                let sample = Sample::new(*id).with_abstract(format!("text of {id}"));
                match label {
                    Some(l) => sample.with_ground_truth(*l),
                    None => sample,
                }
            })
            .collect()
    }

    fn column(preds: &[(&str, Label)]) -> PredictionColumn {
        PredictionColumn::from_labels("test", preds.iter().map(|(id, l)| ((*id).into(), *l)))
    }

    #[test]
    fn test_perfect_predictions() {
        use Label::{DoesNotUseData, UsesData};
        let samples = samples(&[("1", Some(UsesData)), ("2", Some(DoesNotUseData))]);
        let preds = column(&[("1", UsesData), ("2", DoesNotUseData)]);
        let engine = EvaluationEngine::default();

        let result = engine.compute_metrics(&preds, &samples).unwrap();
        assert_eq!(result.eligible, 2);
        assert!((result.accuracy - 1.0).abs() < f64::EPSILON);
        assert!((result.class(UsesData).unwrap().f1 - 1.0).abs() < f64::EPSILON);
        assert!((result.class(DoesNotUseData).unwrap().f1 - 1.0).abs() < f64::EPSILON);
        assert!(engine.find_disagreements(&preds, &samples).is_empty());
    }

    #[test]
    fn test_binary_metrics() {
        use Label::{DoesNotUseData, UsesData};
        // TP=2, FN=1, FP=1, TN=1
        let samples = samples(&[
            ("1", Some(UsesData)),
            ("2", Some(UsesData)),
            ("3", Some(UsesData)),
            ("4", Some(DoesNotUseData)),
            ("5", Some(DoesNotUseData)),
        ]);
        let preds = column(&[
            ("1", UsesData),
            ("2", UsesData),
            ("3", DoesNotUseData),
            ("4", UsesData),
            ("5", DoesNotUseData),
        ]);

        let result = EvaluationEngine::default().compute_metrics(&preds, &samples).unwrap();
        let uses = result.class(UsesData).unwrap();
        assert!((uses.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((uses.recall - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(uses.support, 3);
        assert!((result.accuracy - 0.6).abs() < 1e-12);
        assert_eq!(result.confusion.count(UsesData, DoesNotUseData), 1);
        assert_eq!(result.confusion.count(DoesNotUseData, UsesData), 1);
    }

    #[test]
    fn test_uncertain_is_its_own_class() {
        use Label::{DoesNotUseData, Uncertain, UsesData};
        let samples = samples(&[("1", Some(UsesData)), ("2", Some(DoesNotUseData))]);
        let preds = column(&[("1", Uncertain), ("2", DoesNotUseData)]);

        let result = EvaluationEngine::default().compute_metrics(&preds, &samples).unwrap();
        assert_eq!(result.confusion.labels(), &[UsesData, DoesNotUseData, Uncertain]);
        assert_eq!(result.confusion.count(UsesData, Uncertain), 1);
        let uncertain = result.class(Uncertain).unwrap();
        assert_eq!(uncertain.support, 0);
        assert!(uncertain.precision.abs() < f64::EPSILON);
        assert!(result.class(UsesData).unwrap().recall.abs() < f64::EPSILON);
    }

    #[test]
    fn test_fixed_label_policy_keeps_absent_class() {
        use Label::{DoesNotUseData, Uncertain, UsesData};
        let samples = samples(&[("1", Some(UsesData)), ("2", Some(UsesData))]);
        let preds = column(&[("1", UsesData), ("2", Uncertain)]);
        let engine = EvaluationEngine::new(
            LabelPolicy::Fixed(LabelSet::new([UsesData, DoesNotUseData])),
            100,
        );

        let result = engine.compute_metrics(&preds, &samples).unwrap();
        assert_eq!(result.confusion.labels(), &[UsesData, DoesNotUseData, Uncertain]);
        assert_eq!(result.confusion.total(), 2);
        assert!(result.class(DoesNotUseData).is_some());
    }

    #[test]
    fn test_insufficient_data() {
        let samples = samples(&[("1", None), ("2", Some(Label::UsesData))]);
        let preds = column(&[("1", Label::UsesData), ("3", Label::UsesData)]);
        let err = EvaluationEngine::default()
            .compute_metrics(&preds, &samples)
            .unwrap_err();
        assert!(matches!(err, VerifyError::InsufficientData { column } if column == "test"));
    }

    #[test]
    fn test_disagreements_sorted_and_defined() {
        use Label::{DoesNotUseData, UsesData};
        let samples = samples(&[
            ("10", Some(UsesData)),
            ("3", Some(UsesData)),
            ("2", None),
            ("1", Some(DoesNotUseData)),
        ]);
        let preds = column(&[
            ("10", DoesNotUseData),
            ("3", DoesNotUseData),
            ("2", UsesData),
            ("1", DoesNotUseData),
        ]);

        let cases = EvaluationEngine::default().find_disagreements(&preds, &samples);
        let ids: Vec<&str> = cases.iter().map(|c| c.sample_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "10"]);
        assert_eq!(cases[0].ground_truth, UsesData);
        assert_eq!(cases[0].predicted, DoesNotUseData);
        assert_eq!(cases[0].excerpt, "text of 3");
    }
}
