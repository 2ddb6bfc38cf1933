//! Prompt construction.
//!
//! [`PromptBuilder::build`] renders a strategy's template for one sample. It
//! is a pure function of the sample and the builder's templates; a missing
//! text field is an error and never yields a partial prompt.
//!
//! Templates use four placeholders:
//!
//! - `{cited_data_paper_title}` - title of the data paper
//! - `{citing_paper_title}` - title of the citing paper
//! - `{citing_paper_text}` - the strategy's text field (required)
//! - `{examples}` - rendered few-shot exemplars (empty for zero-shot)

use crate::config::PipelineConfig;
use crate::error::{Result, VerifyError};
use crate::models::{truncate_chars, Label, PredictionStrategy, Sample, TextField};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use tracing::debug;

const TEXT_PLACEHOLDER: &str = "{citing_paper_text}";

const ANSWER_FORMAT: &str = r#"Answer with a single JSON object and nothing else:
{"decision": "Used" | "Not Used" | "Uncertain", "reasoning": "<one or two sentences>"}"#;

const CRITERIA: &str = r#"- "Used": the citing paper directly uses the dataset for analysis, model training, evaluation, or comparison.
- "Not Used": the dataset is only mentioned as background, related work, or future outlook.
- "Uncertain": the text does not allow a decision."#;

/// Built-in zero-shot template over the abstract
pub const ABSTRACT_TEMPLATE: &str = r#"You are judging whether a research paper uses the data published in a data paper.

Data paper: "{cited_data_paper_title}"
Citing paper: "{citing_paper_title}"

Criteria:
{criteria}

Abstract of the citing paper:
---
{citing_paper_text}
---

{answer_format}
"#;

/// Built-in zero-shot template over the full text
pub const ZERO_SHOT_TEMPLATE: &str = r#"You are judging whether a research paper uses the data published in a data paper.

Data paper: "{cited_data_paper_title}"
Citing paper: "{citing_paper_title}"

Criteria:
{criteria}

Full text of the citing paper:
---
{citing_paper_text}
---

{answer_format}
"#;

/// Built-in few-shot chain-of-thought template over the full text
pub const FEW_SHOT_COT_TEMPLATE: &str = r#"You are judging whether a research paper uses the data published in a data paper.

Criteria:
{criteria}

Worked examples:
{examples}
Now the paper to judge.

Data paper: "{cited_data_paper_title}"
Citing paper: "{citing_paper_title}"

Full text of the citing paper:
---
{citing_paper_text}
---

Think step by step: find the passages that mention the dataset and decide how it is used.
Write your reasoning first, then end with the JSON verdict.
{answer_format}
"#;

/// One worked example for the few-shot template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exemplar {
    /// Excerpt of a citing paper
    pub text: String,
    /// Correct label
    pub label: Label,
    /// Step-by-step reasoning leading to the label
    pub reasoning: String,
}

/// Default exemplars bundled with the few-shot template
#[must_use]
pub fn default_exemplars() -> Vec<Exemplar> {
    vec![
        Exemplar {
            text: "We trained our segmentation network on the 1,200 annotated scenes released with the benchmark and report results on its test split.".to_string(),
            label: Label::UsesData,
            reasoning: "The dataset is the training and test data of the experiments, so it is directly used.".to_string(),
        },
        Exemplar {
            text: "Several public corpora of this kind exist (e.g., the benchmark dataset), but our study relies on interviews we collected ourselves.".to_string(),
            label: Label::DoesNotUseData,
            reasoning: "The dataset is only mentioned as related work; the analysis uses other data.".to_string(),
        },
        Exemplar {
            text: "Future work could validate the model against the benchmark dataset.".to_string(),
            label: Label::DoesNotUseData,
            reasoning: "The dataset appears only in the outlook and is not part of the reported work.".to_string(),
        },
    ]
}

/// Renders prompts for every strategy.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    templates: BTreeMap<PredictionStrategy, String>,
    exemplars: Vec<Exemplar>,
    max_text_chars: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(30_000)
    }
}

impl PromptBuilder {
    /// Builder with the built-in templates and exemplars
    #[must_use]
    pub fn new(max_text_chars: usize) -> Self {
        let templates = PredictionStrategy::ALL
            .into_iter()
            .map(|s| (s, builtin_template(s).to_string()))
            .collect();
        Self {
            templates,
            exemplars: default_exemplars(),
            max_text_chars,
        }
    }

    /// Builder configured from `config`, loading any template and exemplar
    /// files it names.
    ///
    /// # Errors
    /// Returns an error if a template file cannot be read or lacks the
    /// `{citing_paper_text}` placeholder, or the exemplar file is not a JSON
    /// array of exemplars.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut builder = Self::new(config.max_text_chars);
        if let Some(path) = &config.exemplars_path {
            let text = std::fs::read_to_string(path).map_err(|e| {
                VerifyError::Config(format!("cannot read exemplars {}: {e}", path.display()))
            })?;
            let exemplars: Vec<Exemplar> = serde_json::from_str(&text)?;
            debug!("Loaded {} exemplars from {}", exemplars.len(), path.display());
            builder = builder.with_exemplars(exemplars);
        }
        for strategy in PredictionStrategy::ALL {
            if let Some(path) = config.strategy(strategy).template_path {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    VerifyError::Config(format!(
                        "cannot read template {} for {strategy}: {e}",
                        path.display()
                    ))
                })?;
                debug!("Loaded {strategy} template from {}", path.display());
                builder = builder.with_template(strategy, text)?;
            }
        }
        Ok(builder)
    }

    /// Replace the template for `strategy`.
    ///
    /// # Errors
    /// Returns [`VerifyError::Config`] if the template lacks `{citing_paper_text}`.
    pub fn with_template(mut self, strategy: PredictionStrategy, template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        if !template.contains(TEXT_PLACEHOLDER) {
            return Err(VerifyError::Config(format!(
                "template for {strategy} has no {TEXT_PLACEHOLDER} placeholder"
            )));
        }
        self.templates.insert(strategy, template);
        Ok(self)
    }

    /// Replace the few-shot exemplars
    #[must_use]
    pub fn with_exemplars(mut self, exemplars: Vec<Exemplar>) -> Self {
        self.exemplars = exemplars;
        self
    }

    /// Render the prompt for `sample` under `strategy`.
    ///
    /// Full text is cut to the configured character limit. Missing titles
    /// render as `unknown`.
    ///
    /// # Errors
    /// Returns [`VerifyError::MissingField`] if the strategy's text field is
    /// absent or blank.
    pub fn build(&self, sample: &Sample, strategy: PredictionStrategy) -> Result<String> {
        let field = strategy.text_field();
        let text = sample
            .text(field)
            .ok_or_else(|| VerifyError::MissingField {
                sample_id: sample.id.clone(),
                field,
            })?;
        let text = match field {
            TextField::FullText => truncate_chars(text, self.max_text_chars),
            TextField::Abstract => text,
        };

        let template = self
            .templates
            .get(&strategy)
            .map_or_else(|| builtin_template(strategy), String::as_str);

        let examples = match strategy {
            PredictionStrategy::FulltextFewShotCot => render_exemplars(&self.exemplars),
            PredictionStrategy::Abstract | PredictionStrategy::FulltextZeroShot => String::new(),
        };

        let metadata = &sample.metadata;
        // The paper text goes in last so placeholders inside it stay literal
        Ok(template
            .replace("{criteria}", CRITERIA)
            .replace("{answer_format}", ANSWER_FORMAT)
            .replace("{examples}", &examples)
            .replace(
                "{cited_data_paper_title}",
                metadata.cited_data_paper_title.as_deref().unwrap_or("unknown"),
            )
            .replace(
                "{citing_paper_title}",
                metadata.citing_paper_title.as_deref().unwrap_or("unknown"),
            )
            .replace(TEXT_PLACEHOLDER, text))
    }
}

const fn builtin_template(strategy: PredictionStrategy) -> &'static str {
    match strategy {
        PredictionStrategy::Abstract => ABSTRACT_TEMPLATE,
        PredictionStrategy::FulltextZeroShot => ZERO_SHOT_TEMPLATE,
        PredictionStrategy::FulltextFewShotCot => FEW_SHOT_COT_TEMPLATE,
    }
}

fn render_exemplars(exemplars: &[Exemplar]) -> String {
    let mut out = String::new();
    for (i, example) in exemplars.iter().enumerate() {
        let _ = writeln!(out, "Example {}:", i + 1);
        let _ = writeln!(out, "Text: {}", example.text);
        let _ = writeln!(out, "Reasoning: {}", example.reasoning);
        let _ = writeln!(
            out,
            "{{\"decision\": \"{}\", \"reasoning\": \"{}\"}}",
            example.label.decision_text(),
            example.reasoning
        );
        out.push('\n');
    }
    out
}
