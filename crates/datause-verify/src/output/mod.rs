//! Persistence and report generation.
//!
//! This module provides functions for:
//!
//! - **Prediction Table**: Load/save the authoritative long-form prediction CSV
//!   and export the wide (one column per strategy) view
//! - **Evaluation Outputs**: JSON results, CSV metric summary, markdown report
//! - **Review Loop**: Review prompt files, correction input, correction audit log
//! - **Audit Report**: Markdown rendering of a sample-list audit
//!
//! ## Output Files
//!
//! `save_evaluation` creates, in the results directory:
//! - `evaluation_results.json` - Every [`EvaluationResult`]
//! - `evaluation_metrics_summary.csv` - One row per column
//! - `evaluation_report.md` - Markdown report

// Clippy pedantic allows:
// - Percentages use f64 from usize
#![allow(clippy::cast_precision_loss)]

use crate::dataset::SampleListAudit;
use crate::error::{Result, VerifyError};
use crate::evaluation::EvaluationResult;
use crate::models::{
    CorrectionEntry, CorrectionRequest, Label, PredictionRecord, SampleId, SampleSet,
};
use crate::runner::PredictionTable;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load the long-form prediction table; a missing file is an empty table.
///
/// # Errors
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_predictions(path: &Path) -> Result<PredictionTable> {
    if !path.exists() {
        info!("No prediction table at {}; starting empty", path.display());
        return Ok(PredictionTable::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let table = reader
        .deserialize::<PredictionRecord>()
        .collect::<std::result::Result<PredictionTable, csv::Error>>()?;
    info!("Loaded {} prediction records from {}", table.len(), path.display());
    Ok(table)
}

/// Save the prediction table, sorted by (sample id, strategy).
///
/// The file is written to a temporary path and renamed into place.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn save_predictions(path: &Path, table: &PredictionTable) -> Result<()> {
    ensure_parent(path)?;
    let tmp = tmp_path(path);
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for record in table.records() {
            writer.serialize(record)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    info!("Saved {} prediction records to {}", table.len(), path.display());
    Ok(())
}

/// Write the wide view: one row per sample, one column per strategy.
///
/// Cells hold the predicted label, or the status for failed records. Each
/// strategy column is followed by its `_rationale` column.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn export_wide(path: &Path, table: &PredictionTable, samples: &SampleSet) -> Result<usize> {
    ensure_parent(path)?;
    let strategies = table.strategies();
    let ids: BTreeSet<SampleId> = samples
        .iter()
        .map(|s| s.id.clone())
        .chain(table.records().map(|r| r.sample_id.clone()))
        .collect();

    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["sample_id".to_string(), "ground_truth".to_string()];
    for strategy in &strategies {
        header.push(strategy.column_name());
        header.push(format!("{}_rationale", strategy.column_name()));
    }
    writer.write_record(&header)?;

    for id in &ids {
        let mut row = vec![
            id.to_string(),
            samples
                .ground_truth(id)
                .map_or_else(String::new, |l| l.as_str().to_string()),
        ];
        for strategy in &strategies {
            match table.get(id, *strategy) {
                Some(record) => {
                    row.push(
                        record
                            .label
                            .map_or_else(|| record.status.to_string(), |l| l.as_str().to_string()),
                    );
                    row.push(record.rationale.clone().unwrap_or_default());
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    info!("Exported {} rows to {}", ids.len(), path.display());
    Ok(ids.len())
}

/// One row of the metric summary CSV.
///
/// The binary counts treat `uses_data` as the positive class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    /// Prediction column
    pub column: String,
    /// Eligible samples
    pub eligible: usize,
    /// Accuracy
    pub accuracy: f64,
    /// Precision for `uses_data`
    pub precision: f64,
    /// Recall for `uses_data`
    pub recall: f64,
    /// F1 for `uses_data`
    pub f1: f64,
    /// Macro-averaged F1
    pub macro_f1: f64,
    /// Truth `uses_data`, predicted `uses_data`
    pub tp: usize,
    /// Truth `does_not_use_data`, predicted `does_not_use_data`
    pub tn: usize,
    /// Truth `does_not_use_data`, predicted `uses_data`
    pub fp: usize,
    /// Truth `uses_data`, predicted `does_not_use_data`
    pub r#fn: usize,
}

impl From<&EvaluationResult> for SummaryRow {
    fn from(result: &EvaluationResult) -> Self {
        let positive = result.class(Label::UsesData);
        let count = |truth, predicted| result.confusion.count(truth, predicted);
        Self {
            column: result.column.clone(),
            eligible: result.eligible,
            accuracy: result.accuracy,
            precision: positive.map_or(0.0, |c| c.precision),
            recall: positive.map_or(0.0, |c| c.recall),
            f1: positive.map_or(0.0, |c| c.f1),
            macro_f1: result.macro_f1,
            tp: count(Label::UsesData, Label::UsesData),
            tn: count(Label::DoesNotUseData, Label::DoesNotUseData),
            fp: count(Label::DoesNotUseData, Label::UsesData),
            r#fn: count(Label::UsesData, Label::DoesNotUseData),
        }
    }
}

/// Paths written by [`save_evaluation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationArtifacts {
    /// Full results as JSON
    pub json: PathBuf,
    /// Metric summary CSV
    pub summary_csv: PathBuf,
    /// Markdown report
    pub report: PathBuf,
}

/// Write evaluation results, summary and report into `dir`.
///
/// `skipped` names columns that had no eligible samples.
///
/// # Errors
/// Returns an error if file operations or serialization fail.
pub fn save_evaluation(
    dir: &Path,
    results: &[EvaluationResult],
    skipped: &[String],
) -> Result<EvaluationArtifacts> {
    std::fs::create_dir_all(dir)?;

    let json = dir.join("evaluation_results.json");
    std::fs::write(&json, serde_json::to_string_pretty(results)?)?;

    let summary_csv = dir.join("evaluation_metrics_summary.csv");
    let mut writer = csv::Writer::from_path(&summary_csv)?;
    for result in results {
        writer.serialize(SummaryRow::from(result))?;
    }
    writer.flush()?;

    let report = dir.join("evaluation_report.md");
    std::fs::write(&report, generate_evaluation_report(results, skipped))?;

    info!("Saved evaluation outputs to {}", dir.display());
    Ok(EvaluationArtifacts {
        json,
        summary_csv,
        report,
    })
}

/// Markdown report of evaluation results.
#[must_use = "generates the report text"]
pub fn generate_evaluation_report(results: &[EvaluationResult], skipped: &[String]) -> String {
    let mut report = String::new();

    report.push_str("# Data Usage Verification Report\n\n");
    let _ = writeln!(
        report,
        "Generated: {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );

    report.push_str("## Summary\n\n");
    report.push_str("| Column | Eligible | Accuracy | Precision | Recall | F1 | Macro F1 |\n");
    report.push_str("|--------|----------|----------|-----------|--------|----|----------|\n");
    for result in results {
        let row = SummaryRow::from(result);
        let _ = writeln!(
            report,
            "| {} | {} | {:.3} | {:.3} | {:.3} | {:.3} | {:.3} |",
            row.column, row.eligible, row.accuracy, row.precision, row.recall, row.f1, row.macro_f1
        );
    }

    if !skipped.is_empty() {
        report.push_str("\nSkipped (no eligible samples):\n");
        for column in skipped {
            let _ = writeln!(report, "- {column}");
        }
    }

    report.push_str("\n## Detailed Results\n\n");
    for result in results {
        let _ = writeln!(report, "### {}\n", result.column);
        let _ = writeln!(
            report,
            "- Accuracy: {:.1}% ({} eligible)",
            result.accuracy * 100.0,
            result.eligible
        );
        let _ = writeln!(
            report,
            "- Macro precision / recall / F1: {:.3} / {:.3} / {:.3}\n",
            result.macro_precision, result.macro_recall, result.macro_f1
        );

        report.push_str("| Truth \\ Predicted |");
        for label in result.confusion.labels() {
            let _ = write!(report, " {label} |");
        }
        report.push_str("\n|---|");
        for _ in result.confusion.labels() {
            report.push_str("---|");
        }
        report.push('\n');
        for (label, row) in result.confusion.labels().iter().zip(result.confusion.counts()) {
            let _ = write!(report, "| {label} |");
            for count in row {
                let _ = write!(report, " {count} |");
            }
            report.push('\n');
        }

        report.push_str("\n| Class | Precision | Recall | F1 | Support |\n");
        report.push_str("|-------|-----------|--------|----|---------|\n");
        for class in &result.per_class {
            let _ = writeln!(
                report,
                "| {} | {:.3} | {:.3} | {:.3} | {} |",
                class.label, class.precision, class.recall, class.f1, class.support
            );
        }
        report.push('\n');
    }

    report
}

/// Write review prompts as plain text blocks separated by blank lines.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn save_review_prompts(path: &Path, prompts: &[String]) -> Result<()> {
    ensure_parent(path)?;
    std::fs::write(path, prompts.join("\n\n"))?;
    info!("Wrote {} review prompts to {}", prompts.len(), path.display());
    Ok(())
}

/// Reviewer input: a full request, or just the label.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CorrectionInput {
    Full(CorrectionRequest),
    Text(String),
    Number(i64),
}

/// Load corrections from a JSON object keyed by sample id.
///
/// Values are `{"label": ..., "justification": ...}` or a bare label such as
/// `"Used"` or `1`.
///
/// # Errors
/// Returns an error if the file cannot be read or is not such an object.
pub fn load_corrections(path: &Path) -> Result<BTreeMap<SampleId, CorrectionRequest>> {
    let text = std::fs::read_to_string(path)?;
    let raw: BTreeMap<String, CorrectionInput> = serde_json::from_str(&text)?;
    if raw.is_empty() {
        return Err(VerifyError::Dataset(format!(
            "{} contains no corrections",
            path.display()
        )));
    }

    Ok(raw
        .into_iter()
        .map(|(id, input)| {
            let request = match input {
                CorrectionInput::Full(request) => request,
                CorrectionInput::Text(label) => CorrectionRequest {
                    label,
                    justification: String::new(),
                },
                CorrectionInput::Number(n) => CorrectionRequest {
                    label: n.to_string(),
                    justification: String::new(),
                },
            };
            (SampleId::new(id), request)
        })
        .collect())
}

/// Append applied corrections to a JSON-lines audit log.
///
/// # Errors
/// Returns an error if the log cannot be opened or written.
pub fn append_corrections_log(path: &Path, entries: &[CorrectionEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    ensure_parent(path)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    for entry in entries {
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
    }
    info!("Appended {} corrections to {}", entries.len(), path.display());
    Ok(())
}

/// Markdown rendering of a sample-list audit.
#[must_use = "generates the report text"]
pub fn generate_audit_report(audit: &SampleListAudit) -> String {
    let mut report = String::new();
    report.push_str("# Sample List Audit\n\n");

    report.push_str("## Counts\n\n");
    report.push_str("| Table | Rows | Unique ids | Duplicate ids |\n");
    report.push_str("|-------|------|------------|---------------|\n");
    for table in [&audit.targets, &audit.samples] {
        let _ = writeln!(
            report,
            "| {} | {} | {} | {} |",
            table.name,
            table.rows,
            table.unique_ids,
            table.duplicate_ids.len()
        );
    }

    report.push_str("\n## Missing From Samples\n\n");
    if audit.missing_from_samples.is_empty() {
        report.push_str("None.\n");
        if audit.targets.unique_ids != audit.samples.unique_ids {
            report.push_str("\nId counts differ; check for duplicate or extra rows.\n");
        }
    } else {
        for id in &audit.missing_from_samples {
            let _ = writeln!(report, "- {id}");
        }
    }

    for table in [&audit.targets, &audit.samples] {
        let _ = writeln!(report, "\n## Missing Values: {}\n", table.name);
        for (column, missing) in &table.missing_values {
            let _ = writeln!(report, "- {column}: {missing}");
        }
    }

    report
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FailureKind;
    use crate::evaluation::{EvaluationEngine, PredictionColumn};
    use crate::models::{PredictionStatus, PredictionStrategy, Sample};
    use chrono::{TimeZone, Utc};

    fn record(id: &str, strategy: PredictionStrategy, label: Option<Label>) -> PredictionRecord {
        PredictionRecord {
            sample_id: id.into(),
            strategy,
            model: "gemini-1.5-flash".to_string(),
            label,
            rationale: label.map(|_| "quoted, with \"marks\"\nand a newline".to_string()),
            raw_response: Some("{\"decision\": \"Used\"}".to_string()),
            status: if label.is_some() {
                PredictionStatus::Success
            } else {
                PredictionStatus::Failed
            },
            failure: label.is_none().then_some(FailureKind::Timeout),
            message: label.is_none().then(|| "timed out".to_string()),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn table() -> PredictionTable {
        [
            record("2", PredictionStrategy::Abstract, Some(Label::DoesNotUseData)),
            record("1", PredictionStrategy::Abstract, Some(Label::UsesData)),
            record("1", PredictionStrategy::FulltextZeroShot, None),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_prediction_table_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/predictions.csv");
        let table = table();

        save_predictions(&path, &table).unwrap();
        let loaded = load_predictions(&path).unwrap();
        assert_eq!(loaded, table);

        let failed = loaded.get(&"1".into(), PredictionStrategy::FulltextZeroShot).unwrap();
        assert_eq!(failed.failure, Some(FailureKind::Timeout));
        assert_eq!(failed.label, None);
    }

    #[test]
    fn test_load_missing_predictions_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let table = load_predictions(&dir.path().join("absent.csv")).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_export_wide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.csv");
        let samples: SampleSet = [
            Sample::new("1").with_ground_truth(Label::UsesData),
            Sample::new("3"),
        ]
        .into_iter()
        .collect();

        let rows = export_wide(&path, &table(), &samples).unwrap();
        assert_eq!(rows, 3);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(
            headers,
            vec![
                "sample_id",
                "ground_truth",
                "prediction_abstract",
                "prediction_abstract_rationale",
                "prediction_fulltext_zeroshot",
                "prediction_fulltext_zeroshot_rationale"
            ]
        );
        let first = reader.records().next().unwrap().unwrap();
        assert_eq!(&first[0], "1");
        assert_eq!(&first[1], "uses_data");
        assert_eq!(&first[2], "uses_data");
        assert_eq!(&first[4], "failed");
    }

    #[test]
    fn test_save_evaluation_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let samples: SampleSet = [
            Sample::new("1").with_ground_truth(Label::UsesData),
            Sample::new("2").with_ground_truth(Label::UsesData),
        ]
        .into_iter()
        .collect();
        let column = PredictionColumn::from_table(&table(), PredictionStrategy::Abstract);
        let result = EvaluationEngine::default()
            .compute_metrics(&column, &samples)
            .unwrap();

        let artifacts =
            save_evaluation(dir.path(), &[result], &["prediction_rule1".to_string()]).unwrap();

        let summary = std::fs::read_to_string(&artifacts.summary_csv).unwrap();
        assert!(summary.starts_with("column,eligible,accuracy,precision,recall,f1,macro_f1,tp,tn,fp,fn\n"));
        assert!(summary.contains("prediction_abstract,2,0.5,1.0,0.5,"));

        let report = std::fs::read_to_string(&artifacts.report).unwrap();
        assert!(report.contains("| prediction_abstract | 2 | 0.500 |"));
        assert!(report.contains("- prediction_rule1"));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&artifacts.json).unwrap()).unwrap();
        assert_eq!(json[0]["eligible"], 2);
    }

    #[test]
    fn test_load_corrections_forms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrections.json");
        std::fs::write(
            &path,
            r#"{
                "10.1016/j.jprot.2022.104578": 1,
                "10": "Not Used",
                "3": {"label": "uses_data", "justification": "Table 2 uses it"}
            }"#,
        )
        .unwrap();

        let corrections = load_corrections(&path).unwrap();
        assert_eq!(corrections.len(), 3);
        assert_eq!(corrections[&SampleId::from("10.1016/j.jprot.2022.104578")].label, "1");
        assert_eq!(corrections[&SampleId::from("10")].label, "Not Used");
        assert_eq!(
            corrections[&SampleId::from("3")].justification,
            "Table 2 uses it"
        );
    }

    #[test]
    fn test_append_corrections_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log/corrections.jsonl");
        let entry = CorrectionEntry {
            sample_id: "3".into(),
            previous: Some(Label::UsesData),
            corrected: Label::DoesNotUseData,
            justification: "background only".to_string(),
            applied_at: Utc::now(),
        };

        append_corrections_log(&path, std::slice::from_ref(&entry)).unwrap();
        append_corrections_log(&path, &[entry]).unwrap();
        append_corrections_log(&path, &[]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        let first: CorrectionEntry = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first.corrected, Label::DoesNotUseData);
    }
}
