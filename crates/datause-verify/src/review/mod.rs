//! Human-in-the-loop review of disagreements.
//!
//! [`ReviewCoordinator`] owns the sample set while corrections are applied.
//! It turns [`DisagreementCase`]s into plain-text re-confirmation prompts for
//! an external reviewer and merges the reviewer's corrections back into
//! ground truth. It performs no I/O of its own.

use crate::error::{Result, VerifyError};
use crate::models::{
    CorrectionEntry, CorrectionRequest, DisagreementCase, Label, LabelSet, SampleId, SampleSet,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt::Write;
use tracing::{info, warn};

/// Applies reviewer corrections to a sample set and keeps their audit trail.
#[derive(Debug, Clone)]
pub struct ReviewCoordinator {
    samples: SampleSet,
    labels: LabelSet,
    audit: Vec<CorrectionEntry>,
}

impl ReviewCoordinator {
    /// Coordinator over `samples`, accepting corrections to `labels`
    #[must_use]
    pub const fn new(samples: SampleSet, labels: LabelSet) -> Self {
        Self {
            samples,
            labels,
            audit: Vec::new(),
        }
    }

    /// One re-confirmation prompt per case, in input order.
    #[must_use]
    pub fn generate_review_prompts(&self, cases: &[DisagreementCase]) -> Vec<String> {
        cases
            .iter()
            .enumerate()
            .map(|(i, case)| render_review_prompt(case, i + 1, cases.len()))
            .collect()
    }

    /// Apply corrections to ground truth.
    ///
    /// Every entry is validated before any is applied, so a rejected mapping
    /// leaves ground truth untouched. Entries whose label already matches
    /// ground truth are skipped, which makes reapplying a mapping a no-op.
    /// Returns the entries applied by this call.
    ///
    /// # Errors
    /// Returns [`VerifyError::UnknownSample`] for an id not in the sample set
    /// and [`VerifyError::InvalidLabel`] for a label outside the accepted set.
    pub fn apply_corrections(
        &mut self,
        corrections: &BTreeMap<SampleId, CorrectionRequest>,
    ) -> Result<Vec<CorrectionEntry>> {
        let mut validated: Vec<(&SampleId, Label, &str)> = Vec::with_capacity(corrections.len());
        for (id, request) in corrections {
            if self.samples.get(id).is_none() {
                return Err(VerifyError::UnknownSample(id.clone()));
            }
            let label = self
                .labels
                .parse(&request.label)
                .ok_or_else(|| VerifyError::InvalidLabel {
                    sample_id: id.clone(),
                    label: request.label.clone(),
                })?;
            validated.push((id, label, &request.justification));
        }

        let mut applied = Vec::new();
        for (id, label, justification) in validated {
            let Some(sample) = self.samples.get_mut(id) else {
                continue;
            };
            if sample.ground_truth == Some(label) {
                continue;
            }
            if justification.trim().is_empty() {
                warn!("Correction for {id} has no justification");
            }

            let entry = CorrectionEntry {
                sample_id: id.clone(),
                previous: sample.ground_truth,
                corrected: label,
                justification: justification.to_string(),
                applied_at: Utc::now(),
            };
            info!(
                "  - {id}: {} -> {label}",
                entry.previous.map_or("unlabelled", |l| l.as_str())
            );
            sample.ground_truth = Some(label);
            applied.push(entry);
        }

        info!(
            "Applied {} of {} corrections ({} already current)",
            applied.len(),
            corrections.len(),
            corrections.len() - applied.len()
        );
        self.audit.extend(applied.iter().cloned());
        Ok(applied)
    }

    /// Every correction applied through this coordinator
    #[must_use]
    pub fn audit_log(&self) -> &[CorrectionEntry] {
        &self.audit
    }

    /// Current samples
    #[must_use]
    pub const fn samples(&self) -> &SampleSet {
        &self.samples
    }
}

fn render_review_prompt(case: &DisagreementCase, index: usize, total: usize) -> String {
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "#################### Review {index} / {total} | sample {} | column {} ####################",
        case.sample_id, case.column
    );
    let _ = writeln!(
        prompt,
        "I labelled by hand whether a paper actually uses the data of a given data paper. \
         An AI model disagreed with my label, so I would like a second opinion on whether my label is right."
    );
    let _ = writeln!(
        prompt,
        "Using the criteria and input below, decide whether the paper should be labelled \"Used\" or \"Not Used\"."
    );
    let _ = writeln!(prompt);

    let _ = writeln!(prompt, "### Criteria");
    let _ = writeln!(
        prompt,
        "* \"Used\": the dataset is directly used to reach the paper's claims or conclusions \
         (analysis, training, evaluation, performance comparison)."
    );
    let _ = writeln!(
        prompt,
        "* \"Not Used\": the dataset is only named in the background, related work, or future outlook."
    );
    let _ = writeln!(prompt);

    let _ = writeln!(prompt, "### Input");
    let _ = writeln!(
        prompt,
        "**Data paper title:** {}",
        case.cited_data_paper_title.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(
        prompt,
        "**Citing paper title:** {}",
        case.citing_paper_title.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(prompt, "**Citing paper text:**");
    let _ = writeln!(prompt, "{}", case.excerpt);
    let _ = writeln!(prompt);

    let _ = writeln!(prompt, "### Situation");
    let _ = writeln!(prompt, "* My label: {}", case.ground_truth.decision_text());
    let _ = writeln!(prompt, "* AI model label: {}", case.predicted.decision_text());
    if let Some(rationale) = &case.rationale {
        let _ = writeln!(prompt, "* AI model rationale: {rationale}");
    }
    let _ = writeln!(prompt);

    let _ = writeln!(prompt, "### Task");
    let _ = writeln!(
        prompt,
        "Say which label is more appropriate and support your analysis by quoting the relevant passages of the text."
    );
    prompt
}
