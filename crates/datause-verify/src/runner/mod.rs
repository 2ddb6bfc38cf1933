//! Batch prediction with resumable runs and failure retry.
//!
//! [`PredictionRunner`] applies one [`PredictionStrategy`] to a [`SampleSet`]
//! and writes one [`PredictionRecord`] per sample into a [`PredictionTable`].
//! Per-sample failures become `failed`/`unparsable` records; nothing a single
//! sample does can abort the batch.
//!
//! Up to `workers` samples are in flight at once. All of them send through one
//! [`LlmClient`], so the pacing floor applies to the aggregate request rate.

use crate::client::{Failure, FailureKind, LlmClient};
use crate::config::PipelineConfig;
use crate::error::VerifyError;
use crate::models::{
    Label, PredictionRecord, PredictionStatus, PredictionStrategy, Sample, SampleId, SampleSet,
};
use crate::parser::ResponseParser;
use crate::prompt::PromptBuilder;
use chrono::Utc;
use futures::{stream, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Authoritative prediction records keyed by (sample id, strategy).
///
/// Iteration is always sorted by sample id, then strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictionTable {
    records: BTreeMap<(SampleId, PredictionStrategy), PredictionRecord>,
}

/// Record counts per status for one strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Records with a label
    pub success: usize,
    /// Records whose prompt or request failed
    pub failed: usize,
    /// Records whose answer had no label
    pub unparsable: usize,
}

impl PredictionTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for its (sample, strategy) key.
    ///
    /// A `success` record is only replaced when `overwrite_success` is set.
    /// Returns whether the table changed.
    pub fn upsert(&mut self, record: PredictionRecord, overwrite_success: bool) -> bool {
        let key = (record.sample_id.clone(), record.strategy);
        if let Some(existing) = self.records.get(&key) {
            if existing.is_success() && !overwrite_success {
                return false;
            }
        }
        self.records.insert(key, record);
        true
    }

    /// Record for one sample and strategy
    #[must_use]
    pub fn get(&self, id: &SampleId, strategy: PredictionStrategy) -> Option<&PredictionRecord> {
        self.records.get(&(id.clone(), strategy))
    }

    /// Whether the sample already has a successful record for `strategy`
    #[must_use]
    pub fn has_success(&self, id: &SampleId, strategy: PredictionStrategy) -> bool {
        self.get(id, strategy).is_some_and(PredictionRecord::is_success)
    }

    /// All records, sorted by (sample id, strategy)
    pub fn records(&self) -> impl Iterator<Item = &PredictionRecord> {
        self.records.values()
    }

    /// Records of one strategy, sorted by sample id
    pub fn strategy_records(
        &self,
        strategy: PredictionStrategy,
    ) -> impl Iterator<Item = &PredictionRecord> {
        self.records.values().filter(move |r| r.strategy == strategy)
    }

    /// Strategies present in the table, in canonical order
    #[must_use]
    pub fn strategies(&self) -> Vec<PredictionStrategy> {
        PredictionStrategy::ALL
            .into_iter()
            .filter(|s| self.strategy_records(*s).next().is_some())
            .collect()
    }

    /// Successful labels of one strategy
    #[must_use]
    pub fn labels(&self, strategy: PredictionStrategy) -> BTreeMap<SampleId, Label> {
        self.strategy_records(strategy)
            .filter_map(|r| r.label.map(|l| (r.sample_id.clone(), l)))
            .collect()
    }

    /// Sample ids whose record for `strategy` is `failed` or `unparsable`
    #[must_use]
    pub fn retryable_ids(&self, strategy: PredictionStrategy) -> Vec<SampleId> {
        self.strategy_records(strategy)
            .filter(|r| r.status.is_retryable())
            .map(|r| r.sample_id.clone())
            .collect()
    }

    /// Status counts for `strategy`
    #[must_use]
    pub fn status_counts(&self, strategy: PredictionStrategy) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.strategy_records(strategy) {
            match record.status {
                PredictionStatus::Success => counts.success += 1,
                PredictionStatus::Failed => counts.failed += 1,
                PredictionStatus::Unparsable => counts.unparsable += 1,
            }
        }
        counts
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<PredictionRecord> for PredictionTable {
    /// Later records for the same key replace earlier ones.
    fn from_iter<I: IntoIterator<Item = PredictionRecord>>(iter: I) -> Self {
        let mut table = Self::new();
        for record in iter {
            table.upsert(record, true);
        }
        table
    }
}

/// Cooperative stop signal checked before each sample starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, untripped token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; samples already in flight finish normally
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for [`PredictionRunner::run`] and [`PredictionRunner::retry_failed`]
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Re-predict samples that already have a successful record
    pub force_rerun: bool,
    /// Stop signal
    pub cancel: CancelToken,
}

/// Outcome of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Strategy that ran
    pub strategy: PredictionStrategy,
    /// Samples sent through the pipeline
    pub attempted: usize,
    /// New successful records
    pub succeeded: usize,
    /// New failed records
    pub failed: usize,
    /// New unparsable records
    pub unparsable: usize,
    /// Samples skipped (already successful, or not retryable)
    pub skipped: usize,
    /// Samples never started because the run was cancelled
    pub cancelled: usize,
}

impl RunSummary {
    const fn empty(strategy: PredictionStrategy) -> Self {
        Self {
            strategy,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            unparsable: 0,
            skipped: 0,
            cancelled: 0,
        }
    }

    /// Whether the run wrote any record
    #[inline]
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.attempted > 0
    }
}

/// Runs prediction strategies over sample sets.
#[derive(Debug, Clone)]
pub struct PredictionRunner {
    client: LlmClient,
    prompts: PromptBuilder,
    parser: ResponseParser,
    model: String,
    timeout: Duration,
    workers: usize,
}

impl PredictionRunner {
    /// Create a runner using the model, timeout and worker count from `config`
    #[must_use]
    pub fn new(
        client: LlmClient,
        prompts: PromptBuilder,
        parser: ResponseParser,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            client,
            prompts,
            parser,
            model: config.model.clone(),
            timeout: config.request_timeout(),
            workers: config.workers.max(1),
        }
    }

    /// Predict every sample that lacks a successful record for `strategy`
    /// (every sample when `force_rerun` is set).
    pub async fn run(
        &self,
        samples: &SampleSet,
        strategy: PredictionStrategy,
        table: &mut PredictionTable,
        options: &RunOptions,
    ) -> RunSummary {
        let (targets, done): (Vec<&Sample>, Vec<&Sample>) = samples
            .iter()
            .partition(|s| options.force_rerun || !table.has_success(&s.id, strategy));

        info!(
            "=== Prediction run: {strategy} ({} via {}) ===",
            self.model,
            self.client.backend_name()
        );
        info!(
            "Samples: {} to predict, {} already successful",
            targets.len(),
            done.len()
        );

        let mut summary = self
            .execute(targets, strategy, table, options.force_rerun, &options.cancel)
            .await;
        summary.skipped = done.len();
        summary
    }

    /// Re-run only samples whose record for `strategy` is `failed` or
    /// `unparsable`. With nothing to retry the table is left untouched.
    pub async fn retry_failed(
        &self,
        samples: &SampleSet,
        strategy: PredictionStrategy,
        table: &mut PredictionTable,
        options: &RunOptions,
    ) -> RunSummary {
        let retry_ids = table.retryable_ids(strategy);
        let targets: Vec<&Sample> = retry_ids.iter().filter_map(|id| samples.get(id)).collect();

        if targets.len() < retry_ids.len() {
            warn!(
                "{} failed {strategy} records refer to samples not in the sample set",
                retry_ids.len() - targets.len()
            );
        }
        if targets.is_empty() {
            info!("No failed {strategy} predictions to retry");
            let mut summary = RunSummary::empty(strategy);
            summary.skipped = samples.len();
            return summary;
        }

        info!(
            "=== Retrying {} failed {strategy} predictions ({}) ===",
            targets.len(),
            self.model
        );
        let mut summary = self
            .execute(targets, strategy, table, false, &options.cancel)
            .await;
        summary.skipped = samples.len().saturating_sub(summary.attempted + summary.cancelled);
        summary
    }

    async fn execute(
        &self,
        targets: Vec<&Sample>,
        strategy: PredictionStrategy,
        table: &mut PredictionTable,
        overwrite_success: bool,
        cancel: &CancelToken,
    ) -> RunSummary {
        let total = targets.len();
        let mut summary = RunSummary::empty(strategy);

        let mut results = stream::iter(targets)
            .map(|sample| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(self.predict_one(sample, strategy).await)
            })
            .buffer_unordered(self.workers);

        while let Some(result) = results.next().await {
            let Some(record) = result else {
                summary.cancelled += 1;
                continue;
            };
            summary.attempted += 1;

            match record.status {
                PredictionStatus::Success => {
                    summary.succeeded += 1;
                    info!(
                        "[{}/{total}] {}: {}",
                        summary.attempted,
                        record.sample_id,
                        record.label.map_or("-", |l| l.as_str())
                    );
                }
                PredictionStatus::Failed => {
                    summary.failed += 1;
                    warn!(
                        "[{}/{total}] {}: failed ({})",
                        summary.attempted,
                        record.sample_id,
                        record.message.as_deref().unwrap_or("no detail")
                    );
                }
                PredictionStatus::Unparsable => {
                    summary.unparsable += 1;
                    warn!(
                        "[{}/{total}] {}: unparsable answer",
                        summary.attempted, record.sample_id
                    );
                }
            }
            table.upsert(record, overwrite_success);
        }

        if summary.cancelled > 0 {
            warn!(
                "Run cancelled: {} samples not started, {} completed records kept",
                summary.cancelled, summary.attempted
            );
        }
        info!(
            "Done: {} success, {} failed, {} unparsable",
            summary.succeeded, summary.failed, summary.unparsable
        );
        summary
    }

    /// Build, send and parse for one sample. Never fails; failures are recorded.
    async fn predict_one(&self, sample: &Sample, strategy: PredictionStrategy) -> PredictionRecord {
        let prompt = match self.prompts.build(sample, strategy) {
            Ok(prompt) => prompt,
            Err(err) => {
                let kind = match err {
                    VerifyError::MissingField { .. } => FailureKind::MissingField,
                    _ => FailureKind::Transport,
                };
                let failure = Failure {
                    kind,
                    message: err.to_string(),
                };
                return self.failed_record(sample, strategy, &failure, None);
            }
        };
        debug!("{}: prompt of {} chars", sample.id, prompt.chars().count());

        let raw = match self.client.send(&prompt, self.timeout, &self.model).await {
            Ok(raw) => raw,
            Err(failure) => return self.failed_record(sample, strategy, &failure, None),
        };

        match self.parser.parse(&raw, strategy) {
            Ok(verdict) => PredictionRecord {
                sample_id: sample.id.clone(),
                strategy,
                model: self.model.clone(),
                label: Some(verdict.label),
                rationale: verdict.rationale,
                raw_response: Some(raw),
                status: PredictionStatus::Success,
                failure: None,
                message: None,
                timestamp: Utc::now(),
            },
            Err(failure) => {
                // A blank answer is stored as no answer; CSV cannot tell them apart
                let raw = (!raw.trim().is_empty()).then_some(raw);
                self.failed_record(sample, strategy, &failure, raw)
            }
        }
    }

    fn failed_record(
        &self,
        sample: &Sample,
        strategy: PredictionStrategy,
        failure: &Failure,
        raw_response: Option<String>,
    ) -> PredictionRecord {
        let status = if failure.kind == FailureKind::Unparsable {
            PredictionStatus::Unparsable
        } else {
            PredictionStatus::Failed
        };
        PredictionRecord {
            sample_id: sample.id.clone(),
            strategy,
            model: self.model.clone(),
            label: None,
            rationale: None,
            raw_response,
            status,
            failure: Some(failure.kind),
            message: Some(failure.message.clone()),
            timestamp: Utc::now(),
        }
    }
}
