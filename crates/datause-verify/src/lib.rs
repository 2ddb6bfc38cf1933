//! # datause-verify
//!
//! LLM validation and evaluation engine for data-paper usage verification.
//!
//! Given a set of (citing paper, data paper) samples, this crate asks a
//! language model whether each citing paper actually uses the data of the
//! data paper, scores those predictions against human ground truth, and
//! closes the loop by turning disagreements into review prompts and merging
//! reviewer corrections back into ground truth.
//!
//! ## Overview
//!
//! The workflow:
//! 1. Load samples (id, abstract, full text, ground truth) from CSV
//! 2. Run one or more prediction strategies with [`PredictionRunner`]
//! 3. Retry failed predictions until the table is complete
//! 4. Score every strategy column with [`EvaluationEngine`]
//! 5. Generate review prompts for disagreements and apply corrections with
//!    [`ReviewCoordinator`]
//!
//! ## Prediction Strategies
//!
//! - `abstract` - zero-shot prompt over the abstract
//! - `fulltext-zeroshot` - zero-shot prompt over the full text
//! - `fulltext-fewshot-cot` - few-shot chain-of-thought prompt over the full text
//!
//! ## Supported LLM Providers
//!
//! - **Gemini**: `generateContent` API
//! - **`OpenAI`**: any chat-completions compatible endpoint
//!
//! ## Example Usage
//!
//! ```no_run
//! use datause_verify::{
//!     client::{gemini::GeminiBackend, LlmClient},
//!     dataset, EvaluationEngine, PipelineConfig, PredictionColumn, PredictionRunner,
//!     PredictionStrategy, PredictionTable, PromptBuilder, ResponseParser, RunOptions,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = PipelineConfig::default();
//! let samples = dataset::load_samples(Path::new("samples.csv"))?;
//!
//! let backend = GeminiBackend::new(std::env::var("GEMINI_API_KEY")?, None, config.request_timeout())?;
//! let client = LlmClient::new(Arc::new(backend), config.pacing_interval());
//! let runner = PredictionRunner::new(
//!     client,
//!     PromptBuilder::from_config(&config)?,
//!     ResponseParser::new(config.labels.clone()),
//!     &config,
//! );
//!
//! let mut table = PredictionTable::new();
//! let options = RunOptions::default();
//! runner.run(&samples, PredictionStrategy::Abstract, &mut table, &options).await;
//! runner.retry_failed(&samples, PredictionStrategy::Abstract, &mut table, &options).await;
//!
//! let column = PredictionColumn::from_table(&table, PredictionStrategy::Abstract);
//! let result = EvaluationEngine::from_config(&config).compute_metrics(&column, &samples)?;
//! println!("accuracy: {:.3}", result.accuracy);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`models`] - Samples, labels, strategies, prediction records
//! - [`prompt`] - Prompt templates and rendering
//! - [`client`] - Paced, time-bounded LLM access and provider backends
//! - [`parser`] - Verdict extraction from model answers
//! - [`runner`] - Batch prediction, resumption and retry
//! - [`evaluation`] - Confusion matrices, metrics, disagreements, hybrids
//! - [`review`] - Review prompts and ground-truth corrections
//! - [`dataset`] - Sample, feature and audit tables
//! - [`output`] - Prediction persistence and reports
//! - [`config`] - Pipeline configuration

pub mod client;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod models;
pub mod output;
pub mod parser;
pub mod prompt;
pub mod review;
pub mod runner;

pub use client::{Failure, FailureKind, LlmBackend, LlmClient};
pub use config::PipelineConfig;
pub use error::{Result, VerifyError};
pub use evaluation::{EvaluationEngine, EvaluationResult, LabelPolicy, PredictionColumn};
pub use models::*;
pub use parser::ResponseParser;
pub use prompt::PromptBuilder;
pub use review::ReviewCoordinator;
pub use runner::{CancelToken, PredictionRunner, PredictionTable, RunOptions, RunSummary};
