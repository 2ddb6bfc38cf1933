//! Tabular inputs: the samples table, rule-based features, and list audits.
//!
//! The samples CSV is the single source of ground truth. Recognized columns
//! (all optional except an id):
//!
//! | Column | Meaning |
//! |---|---|
//! | `sample_id` / `id` | Sample id (falls back to `citing_paper_doi`) |
//! | `citing_paper_doi` | Citing paper id |
//! | `cited_data_paper_doi` | Data paper id |
//! | `citing_paper_title`, `cited_data_paper_title` | Titles |
//! | `abstract`, `full_text` | Text fields |
//! | `ground_truth` / `is_data_used_gt` | Label (`1`/`0`, `Used`/`Not Used`, `uses_data`, ...) |
//!
//! Extra columns are ignored on load and preserved by [`write_ground_truth`].

use crate::error::{Result, VerifyError};
use crate::evaluation::PredictionColumn;
use crate::models::{Label, Sample, SampleId, SampleMetadata, SampleSet};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};

const ID_COLUMNS: [&str; 3] = ["sample_id", "id", "citing_paper_doi"];
const GROUND_TRUTH_COLUMNS: [&str; 2] = ["ground_truth", "is_data_used_gt"];

/// Column positions of the samples table, each resolved to its first
/// recognized header so loading and [`write_ground_truth`] agree.
struct SampleColumns {
    id: Option<usize>,
    citing_paper_doi: Option<usize>,
    cited_data_paper_doi: Option<usize>,
    citing_paper_title: Option<usize>,
    cited_data_paper_title: Option<usize>,
    abstract_text: Option<usize>,
    full_text: Option<usize>,
    ground_truth: Option<usize>,
}

impl SampleColumns {
    fn resolve(headers: &csv::StringRecord) -> Self {
        Self {
            id: find_column(headers, &ID_COLUMNS[..2]),
            citing_paper_doi: find_column(headers, &["citing_paper_doi"]),
            cited_data_paper_doi: find_column(headers, &["cited_data_paper_doi"]),
            citing_paper_title: find_column(headers, &["citing_paper_title"]),
            cited_data_paper_title: find_column(headers, &["cited_data_paper_title"]),
            abstract_text: find_column(headers, &["abstract"]),
            full_text: find_column(headers, &["full_text"]),
            ground_truth: find_column(headers, &GROUND_TRUTH_COLUMNS),
        }
    }
}

/// Non-empty cell at `col`
fn cell(record: &csv::StringRecord, col: Option<usize>) -> Option<String> {
    col.and_then(|i| record.get(i))
        .filter(|c| !c.trim().is_empty())
        .map(str::to_string)
}

/// Load the samples table. Duplicate ids keep the first row.
///
/// When several recognized headers name the same field (`sample_id` and
/// `id`, or `ground_truth` and `is_data_used_gt`), the first in the column
/// table above wins.
///
/// # Errors
/// Returns an error if the file cannot be read or a row has no id.
pub fn load_samples(path: &Path) -> Result<SampleSet> {
    let mut reader = csv::Reader::from_path(path)?;
    let columns = SampleColumns::resolve(reader.headers()?);
    let mut samples = SampleSet::new();
    let mut duplicates = 0usize;

    for (row_number, record) in reader.records().enumerate() {
        let record = record?;
        let paper_id = cell(&record, columns.citing_paper_doi);
        let id = cell(&record, columns.id)
            .or_else(|| paper_id.clone())
            .map(SampleId::new)
            .ok_or_else(|| {
                VerifyError::Dataset(format!(
                    "{}: row {} has no sample_id or citing_paper_doi",
                    path.display(),
                    row_number + 2
                ))
            })?;

        let ground_truth = parse_label_cell(
            columns.ground_truth.and_then(|i| record.get(i)),
            &id,
        );
        let sample = Sample {
            id: id.clone(),
            abstract_text: cell(&record, columns.abstract_text),
            full_text: cell(&record, columns.full_text),
            ground_truth,
            metadata: SampleMetadata {
                paper_id,
                data_paper_id: cell(&record, columns.cited_data_paper_doi),
                citing_paper_title: cell(&record, columns.citing_paper_title),
                cited_data_paper_title: cell(&record, columns.cited_data_paper_title),
            },
        };
        if !samples.insert(sample) {
            warn!("Duplicate sample id {id} in {}; keeping first row", path.display());
            duplicates += 1;
        }
    }

    info!(
        "Loaded {} samples from {} ({} duplicates skipped)",
        samples.len(),
        path.display(),
        duplicates
    );
    Ok(samples)
}

/// Rewrite the ground-truth column of the samples table from `samples`.
///
/// Every other column and the row order are preserved. The column is added
/// when the file has none. Returns the number of rows whose value changed.
///
/// # Errors
/// Returns an error if the file cannot be read or written, or has no id column.
pub fn write_ground_truth(path: &Path, samples: &SampleSet) -> Result<usize> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut headers = reader.headers()?.clone();
    let id_col = find_column(&headers, &ID_COLUMNS).ok_or_else(|| {
        VerifyError::Dataset(format!("{} has no sample id column", path.display()))
    })?;
    let gt_col = if let Some(col) = find_column(&headers, &GROUND_TRUTH_COLUMNS) {
        col
    } else {
        headers.push_field("ground_truth");
        headers.len() - 1
    };

    let mut rows = Vec::new();
    let mut changed = 0usize;
    for record in reader.records() {
        let record = record?;
        let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
        fields.resize(headers.len(), String::new());

        let id = SampleId::new(&fields[id_col]);
        if let Some(label) = samples.ground_truth(&id) {
            let current = fields[gt_col].parse::<Label>().ok();
            if current != Some(label) {
                fields[gt_col] = label.as_str().to_string();
                changed += 1;
            }
        }
        rows.push(fields);
    }
    drop(reader);

    if changed == 0 {
        return Ok(0);
    }

    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        writer.write_record(&headers)?;
        for row in &rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    info!("Wrote {changed} ground-truth updates to {}", path.display());
    Ok(changed)
}

/// Load every `prediction_*` column of a rule-feature table.
///
/// Cells that are blank, `-1`, or not a label are treated as missing.
///
/// # Errors
/// Returns an error if the file cannot be read or has no id column.
pub fn load_feature_columns(path: &Path) -> Result<Vec<PredictionColumn>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let id_col = find_column(&headers, &ID_COLUMNS).ok_or_else(|| {
        VerifyError::Dataset(format!("{} has no sample id column", path.display()))
    })?;

    let mut columns: Vec<(usize, PredictionColumn)> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| name.starts_with("prediction_"))
        .map(|(i, name)| (i, PredictionColumn::new(name)))
        .collect();

    for record in reader.records() {
        let record = record?;
        let Some(id) = record.get(id_col).filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        let id = SampleId::new(id);
        for (i, column) in &mut columns {
            if let Some(label) = record.get(*i).and_then(|cell| cell.parse::<Label>().ok()) {
                column.insert(id.clone(), label);
            }
        }
    }

    info!(
        "Loaded {} feature columns from {}",
        columns.len(),
        path.display()
    );
    Ok(columns.into_iter().map(|(_, c)| c).collect())
}

/// Row, id and missing-value counts for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableAudit {
    /// File that was audited
    pub name: String,
    /// Data rows
    pub rows: usize,
    /// Distinct non-empty ids
    pub unique_ids: usize,
    /// Ids that occur more than once
    pub duplicate_ids: Vec<String>,
    /// Empty cells per column, in header order
    pub missing_values: Vec<(String, usize)>,
}

/// Comparison of the annotation target list against the samples table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleListAudit {
    /// Annotation target list
    pub targets: TableAudit,
    /// Samples-with-text table
    pub samples: TableAudit,
    /// Target ids absent from the samples table, sorted
    pub missing_from_samples: Vec<String>,
}

impl SampleListAudit {
    /// Whether both lists hold the same ids without duplicates
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.missing_from_samples.is_empty()
            && self.targets.duplicate_ids.is_empty()
            && self.samples.duplicate_ids.is_empty()
            && self.targets.unique_ids == self.samples.unique_ids
    }
}

/// Compare the annotation target list with the samples table.
///
/// # Errors
/// Returns an error if either file cannot be read or has no id column.
pub fn audit_sample_lists(targets: &Path, samples: &Path) -> Result<SampleListAudit> {
    let (targets_audit, target_ids) = audit_table(targets)?;
    let (samples_audit, sample_ids) = audit_table(samples)?;

    let mut missing: Vec<SampleId> = target_ids.difference(&sample_ids).cloned().collect();
    missing.sort();
    if missing.is_empty() {
        info!("All {} target ids are present in the samples table", target_ids.len());
    } else {
        warn!("{} target ids are missing from the samples table", missing.len());
    }

    Ok(SampleListAudit {
        targets: targets_audit,
        samples: samples_audit,
        missing_from_samples: missing.iter().map(ToString::to_string).collect(),
    })
}

fn audit_table(path: &Path) -> Result<(TableAudit, BTreeSet<SampleId>)> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let id_col = find_column(&headers, &ID_COLUMNS).ok_or_else(|| {
        VerifyError::Dataset(format!("{} has no sample id column", path.display()))
    })?;

    let mut rows = 0usize;
    let mut missing = vec![0usize; headers.len()];
    let mut seen: BTreeMap<SampleId, usize> = BTreeMap::new();

    for record in reader.records() {
        let record = record?;
        rows += 1;
        for (i, slot) in missing.iter_mut().enumerate() {
            if record.get(i).map_or(true, |cell| cell.trim().is_empty()) {
                *slot += 1;
            }
        }
        if let Some(id) = record.get(id_col).filter(|s| !s.trim().is_empty()) {
            *seen.entry(SampleId::new(id)).or_default() += 1;
        }
    }

    let duplicate_ids = seen
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(id, _)| id.to_string())
        .collect();
    let audit = TableAudit {
        name: path.display().to_string(),
        rows,
        unique_ids: seen.len(),
        duplicate_ids,
        missing_values: headers.iter().map(str::to_string).zip(missing).collect(),
    };
    Ok((audit, seen.into_keys().collect()))
}

fn find_column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    names
        .iter()
        .find_map(|name| headers.iter().position(|h| h.trim() == *name))
}

fn parse_label_cell(cell: Option<&str>, id: &SampleId) -> Option<Label> {
    let cell = cell.map(str::trim).filter(|c| !c.is_empty() && *c != "-1")?;
    match cell.parse::<Label>() {
        Ok(label) => Some(label),
        Err(e) => {
            warn!("Sample {id}: ignoring ground truth: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TextField;

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_samples_with_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "samples.csv",
            "citing_paper_doi,citing_paper_title,cited_data_paper_title,abstract,full_text,is_data_used_gt,extra\n\
             10.1/a,Paper A,Data X,uses X,,1,foo\n\
             10.1/b,Paper B,Data X,,full body,0,bar\n\
             10.1/c,Paper C,Data X,,,,baz\n\
             10.1/a,Paper A again,Data X,dup,,0,qux\n",
        );

        let samples = load_samples(&path).unwrap();
        assert_eq!(samples.len(), 3);

        let a = samples.get(&"10.1/a".into()).unwrap();
        assert_eq!(a.ground_truth, Some(Label::UsesData));
        assert_eq!(a.text(TextField::Abstract), Some("uses X"));
        assert_eq!(a.text(TextField::FullText), None);
        assert_eq!(a.metadata.citing_paper_title.as_deref(), Some("Paper A"));

        assert_eq!(samples.ground_truth(&"10.1/b".into()), Some(Label::DoesNotUseData));
        assert_eq!(samples.ground_truth(&"10.1/c".into()), None);
    }

    #[test]
    fn test_load_and_write_agree_on_repeated_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "samples.csv",
            "id,sample_id,abstract,is_data_used_gt,ground_truth\n\
             x1,1,a,1,does_not_use_data\n\
             x2,2,b,0,\n",
        );

        let mut samples = load_samples(&path).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples.ground_truth(&"1".into()), Some(Label::DoesNotUseData));
        assert_eq!(samples.ground_truth(&"2".into()), None);

        samples.get_mut(&"2".into()).unwrap().ground_truth = Some(Label::UsesData);
        assert_eq!(write_ground_truth(&path, &samples).unwrap(), 1);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "id,sample_id,abstract,is_data_used_gt,ground_truth\n\
             x1,1,a,1,does_not_use_data\n\
             x2,2,b,0,uses_data\n"
        );
        let reloaded = load_samples(&path).unwrap();
        assert_eq!(reloaded.ground_truth(&"2".into()), Some(Label::UsesData));
    }

    #[test]
    fn test_load_samples_requires_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "samples.csv", "abstract\nno id here\n");
        assert!(matches!(load_samples(&path), Err(VerifyError::Dataset(_))));
    }

    #[test]
    fn test_write_ground_truth_preserves_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "samples.csv",
            "sample_id,abstract,is_data_used_gt,note\n2,b,0,keep\n1,a,1,keep\n",
        );
        let mut samples = load_samples(&path).unwrap();
        samples.get_mut(&"2".into()).unwrap().ground_truth = Some(Label::UsesData);

        assert_eq!(write_ground_truth(&path, &samples).unwrap(), 1);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "sample_id,abstract,is_data_used_gt,note\n2,b,uses_data,keep\n1,a,1,keep\n"
        );

        // Nothing changed: the file is not rewritten
        assert_eq!(write_ground_truth(&path, &samples).unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
    }

    #[test]
    fn test_load_feature_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "features.csv",
            "citing_paper_doi,mention_count,prediction_rule1,prediction_rule2\n\
             a,3,1,0\n\
             b,0,0,-1\n",
        );

        let columns = load_feature_columns(&path).unwrap();
        let names: Vec<&str> = columns.iter().map(PredictionColumn::name).collect();
        assert_eq!(names, vec!["prediction_rule1", "prediction_rule2"]);
        assert_eq!(columns[0].len(), 2);
        assert_eq!(columns[1].len(), 1);
        assert_eq!(columns[1].get(&"a".into()), Some(Label::DoesNotUseData));
    }

    #[test]
    fn test_audit_sample_lists() {
        let dir = tempfile::tempdir().unwrap();
        let targets = write(
            dir.path(),
            "targets.csv",
            "citing_paper_doi,is_data_used_gt\na,1\nb,0\nc,\nc,1\n",
        );
        let samples = write(
            dir.path(),
            "samples.csv",
            "citing_paper_doi,full_text\na,text\nb,\n",
        );

        let audit = audit_sample_lists(&targets, &samples).unwrap();
        assert_eq!(audit.targets.rows, 4);
        assert_eq!(audit.targets.unique_ids, 3);
        assert_eq!(audit.targets.duplicate_ids, vec!["c".to_string()]);
        assert_eq!(audit.missing_from_samples, vec!["c".to_string()]);
        assert_eq!(
            audit.samples.missing_values,
            vec![("citing_paper_doi".to_string(), 0), ("full_text".to_string(), 1)]
        );
        assert!(!audit.is_consistent());
    }
}
