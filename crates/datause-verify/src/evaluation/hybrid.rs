//! Hybrid columns combining rule-based features with LLM predictions.
//!
//! Both combinators produce ordinary [`PredictionColumn`]s, so hybrids are
//! scored exactly like any other column.

use super::PredictionColumn;
use crate::models::Label;
use std::collections::BTreeSet;

/// `uses_data` only when both columns say so; `does_not_use_data` otherwise.
///
/// Defined on samples present in both columns.
#[must_use]
pub fn and_gate(name: &str, rule: &PredictionColumn, llm: &PredictionColumn) -> PredictionColumn {
    PredictionColumn::from_labels(
        name,
        llm.iter().filter_map(|(id, predicted)| {
            rule.get(id).map(|flag| {
                let label = if flag == Label::UsesData && predicted == Label::UsesData {
                    Label::UsesData
                } else {
                    Label::DoesNotUseData
                };
                (id.clone(), label)
            })
        }),
    )
}

/// Three-tier decision:
///
/// 1. `rule` and `primary` both say `uses_data` -> `uses_data`
/// 2. `primary` says `does_not_use_data` -> `does_not_use_data`
/// 3. otherwise the `fallback` prediction, if there is one
#[must_use]
pub fn hierarchical(
    name: &str,
    rule: &PredictionColumn,
    primary: &PredictionColumn,
    fallback: &PredictionColumn,
) -> PredictionColumn {
    let ids: BTreeSet<_> = rule
        .iter()
        .chain(primary.iter())
        .chain(fallback.iter())
        .map(|(id, _)| id.clone())
        .collect();

    PredictionColumn::from_labels(
        name,
        ids.into_iter().filter_map(|id| {
            let label = match (rule.get(&id), primary.get(&id)) {
                (Some(Label::UsesData), Some(Label::UsesData)) => Some(Label::UsesData),
                (_, Some(Label::DoesNotUseData)) => Some(Label::DoesNotUseData),
                _ => fallback.get(&id),
            };
            label.map(|l| (id, l))
        }),
    )
}
