//! Data usage verification CLI
//!
//! Predict, evaluate, review and correct data-paper usage labels.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use datause_verify::{
    client::{gemini::GeminiBackend, openai::OpenAiBackend, LlmBackend, LlmClient},
    config::Provider,
    dataset,
    evaluation::hybrid,
    output, CancelToken, EvaluationEngine, PipelineConfig, PredictionColumn, PredictionRunner,
    PredictionStrategy, PredictionTable, PromptBuilder, ResponseParser, ReviewCoordinator,
    RunOptions, SampleSet, VerifyError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "datause-verify")]
#[command(about = "LLM validation and evaluation of data-paper usage")]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run prediction strategies, then retry failures where enabled
    Predict {
        /// Strategies to run (default: those enabled in the config)
        #[arg(short, long)]
        strategy: Vec<PredictionStrategy>,

        /// Re-predict samples that already have a successful record
        #[arg(long)]
        force: bool,
    },

    /// Retry failed predictions of one strategy
    Retry {
        /// Strategy to retry
        #[arg(short, long)]
        strategy: PredictionStrategy,
    },

    /// Score every prediction column against ground truth
    Evaluate {
        /// Rule-based feature CSV; enables rule and hybrid columns
        /// (default: the configured features file, if present)
        #[arg(long)]
        features: Option<PathBuf>,
    },

    /// List disagreements for one strategy and write review prompts
    Review {
        /// Strategy whose predictions are reviewed
        #[arg(short, long)]
        column: PredictionStrategy,

        /// Output file for the prompts
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Apply reviewer corrections to ground truth
    Correct {
        /// JSON mapping of sample id to corrected label
        #[arg(long)]
        corrections: PathBuf,
    },

    /// Compare the annotation target list with the samples table
    Audit {
        /// Annotation target list CSV
        #[arg(long)]
        targets: PathBuf,
    },

    /// Export the wide prediction table
    Export {
        /// Output CSV (default: <results_dir>/predictions_wide.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "datause_verify=info"
                    .parse()
                    .expect("directive is compile-time constant"),
            ),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Predict { strategy, force } => predict(&config, strategy, force).await?,
        Command::Retry { strategy } => retry(&config, strategy).await?,
        Command::Evaluate { features } => evaluate(&config, features.as_deref())?,
        Command::Review { column, output } => review(&config, column, output)?,
        Command::Correct { corrections } => correct(&config, &corrections)?,
        Command::Audit { targets } => audit(&config, &targets)?,
        Command::Export { output } => export(&config, output)?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Build the paced client for the configured provider
fn build_client(config: &PipelineConfig) -> Result<LlmClient> {
    let backend: Arc<dyn LlmBackend> = match config.provider {
        Provider::Gemini => {
            let api_key = std::env::var("GEMINI_API_KEY")
                .context("GEMINI_API_KEY not set. Run: source .env")?;
            Arc::new(GeminiBackend::new(
                api_key,
                config.api_base.clone(),
                config.request_timeout(),
            )?)
        }
        Provider::OpenAi => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY not set. Run: source .env")?;
            Arc::new(OpenAiBackend::new(
                api_key,
                config.api_base.clone(),
                config.request_timeout(),
            )?)
        }
    };
    info!(
        "Using {} model {} ({} workers, {}ms pacing)",
        backend.name(),
        config.model,
        config.workers,
        config.pacing_interval_ms
    );
    Ok(LlmClient::new(backend, config.pacing_interval()))
}

fn build_runner(config: &PipelineConfig) -> Result<PredictionRunner> {
    Ok(PredictionRunner::new(
        build_client(config)?,
        PromptBuilder::from_config(config)?,
        ResponseParser::new(config.labels.clone()),
        config,
    ))
}

/// Cancel token tripped by Ctrl-C
fn cancel_on_ctrl_c() -> CancelToken {
    let token = CancelToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight samples");
            handle.cancel();
        }
    });
    token
}

async fn predict(
    config: &PipelineConfig,
    strategies: Vec<PredictionStrategy>,
    force: bool,
) -> Result<()> {
    let strategies = if strategies.is_empty() {
        config.enabled_strategies()
    } else {
        strategies
    };
    if strategies.is_empty() {
        bail!("no strategies enabled; pass --strategy or enable one in the config");
    }

    let samples = dataset::load_samples(&config.paths.samples)?;
    let mut table = output::load_predictions(&config.paths.predictions)?;
    let runner = build_runner(config)?;
    let options = RunOptions {
        force_rerun: force,
        cancel: cancel_on_ctrl_c(),
    };

    let mut changed = false;
    for strategy in strategies {
        let summary = runner.run(&samples, strategy, &mut table, &options).await;
        changed |= summary.changed();

        if config.strategy(strategy).retry_failed && !options.cancel.is_cancelled() {
            let retry = runner
                .retry_failed(&samples, strategy, &mut table, &options)
                .await;
            changed |= retry.changed();
        }
        log_status(&table, strategy);

        if options.cancel.is_cancelled() {
            break;
        }
    }

    save_if_changed(config, &table, changed)
}

async fn retry(config: &PipelineConfig, strategy: PredictionStrategy) -> Result<()> {
    let samples = dataset::load_samples(&config.paths.samples)?;
    let mut table = output::load_predictions(&config.paths.predictions)?;
    if table.retryable_ids(strategy).is_empty() {
        info!("No failed {strategy} predictions; nothing to do");
        return Ok(());
    }

    let runner = build_runner(config)?;
    let options = RunOptions {
        force_rerun: false,
        cancel: cancel_on_ctrl_c(),
    };
    let summary = runner
        .retry_failed(&samples, strategy, &mut table, &options)
        .await;
    log_status(&table, strategy);

    save_if_changed(config, &table, summary.changed())
}

fn save_if_changed(config: &PipelineConfig, table: &PredictionTable, changed: bool) -> Result<()> {
    if changed {
        output::save_predictions(&config.paths.predictions, table)?;
    } else {
        info!("Prediction table unchanged; not rewriting {}", config.paths.predictions.display());
    }
    Ok(())
}

fn log_status(table: &PredictionTable, strategy: PredictionStrategy) {
    let counts = table.status_counts(strategy);
    info!(
        "{strategy}: {} success, {} failed, {} unparsable",
        counts.success, counts.failed, counts.unparsable
    );
}

/// LLM columns from the table, plus rule and hybrid columns when features are given
fn prediction_columns(
    table: &PredictionTable,
    features: Option<&Path>,
) -> Result<Vec<PredictionColumn>> {
    let mut columns: Vec<PredictionColumn> = table
        .strategies()
        .into_iter()
        .map(|s| PredictionColumn::from_table(table, s))
        .collect();

    let Some(features) = features else {
        return Ok(columns);
    };
    let rules = dataset::load_feature_columns(features)?;

    if let Some(rule2) = rules.iter().find(|c| c.name() == "prediction_rule2") {
        let llm = |s: PredictionStrategy| columns.iter().find(|c| c.name() == s.column_name());
        let mut hybrids = Vec::new();

        for strategy in [
            PredictionStrategy::FulltextZeroShot,
            PredictionStrategy::FulltextFewShotCot,
        ] {
            if let Some(column) = llm(strategy) {
                let name = format!("prediction_hybrid_and_{}", strategy.id().replace('-', "_"));
                hybrids.push(hybrid::and_gate(&name, rule2, column));
            }
        }
        if let (Some(primary), Some(fallback)) = (
            llm(PredictionStrategy::FulltextZeroShot),
            llm(PredictionStrategy::FulltextFewShotCot),
        ) {
            hybrids.push(hybrid::hierarchical(
                "prediction_hierarchical_hybrid",
                rule2,
                primary,
                fallback,
            ));
        }
        columns.extend(hybrids);
    } else {
        warn!("{} has no prediction_rule2 column; skipping hybrids", features.display());
    }

    let mut all = rules;
    all.extend(columns);
    Ok(all)
}

fn evaluate(config: &PipelineConfig, features: Option<&Path>) -> Result<()> {
    let samples = dataset::load_samples(&config.paths.samples)?;
    let table = output::load_predictions(&config.paths.predictions)?;
    let features = features.or_else(|| {
        let default = config.paths.features.as_path();
        default.exists().then_some(default)
    });
    let columns = prediction_columns(&table, features)?;
    if columns.is_empty() {
        bail!("no prediction columns to evaluate");
    }

    let engine = EvaluationEngine::from_config(config);
    let mut results = Vec::new();
    let mut skipped = Vec::new();

    for column in &columns {
        match engine.compute_metrics(column, &samples) {
            Ok(result) => {
                info!(
                    "{}: accuracy {:.3}, macro F1 {:.3} ({} eligible)",
                    result.column, result.accuracy, result.macro_f1, result.eligible
                );
                results.push(result);
            }
            Err(VerifyError::InsufficientData { column }) => {
                warn!("{column}: no eligible samples; skipped");
                skipped.push(column);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let artifacts = output::save_evaluation(&config.paths.results_dir, &results, &skipped)?;
    println!("{}", output::generate_evaluation_report(&results, &skipped));
    info!("Report saved to {}", artifacts.report.display());
    Ok(())
}

fn review(
    config: &PipelineConfig,
    strategy: PredictionStrategy,
    output_path: Option<PathBuf>,
) -> Result<()> {
    let samples = dataset::load_samples(&config.paths.samples)?;
    let table = output::load_predictions(&config.paths.predictions)?;
    let column = PredictionColumn::from_table(&table, strategy);
    if column.is_empty() {
        bail!("no successful {strategy} predictions in {}", config.paths.predictions.display());
    }

    let engine = EvaluationEngine::from_config(config);
    let cases = engine.find_disagreements(&column, &samples);
    if cases.is_empty() {
        info!("Predictions and ground truth agree on every sample; no review needed");
        return Ok(());
    }

    info!("{} disagreements in {}:", cases.len(), column.name());
    for case in &cases {
        info!(
            "  - {} | {} | human: {} | model: {}",
            case.sample_id,
            case.citing_paper_title.as_deref().unwrap_or("-"),
            case.ground_truth.decision_text(),
            case.predicted.decision_text()
        );
    }

    let coordinator = ReviewCoordinator::new(samples, config.labels.clone());
    let prompts = coordinator.generate_review_prompts(&cases);
    let path = output_path.unwrap_or_else(|| {
        config
            .paths
            .results_dir
            .join(format!("review_prompts_{}.txt", column.name()))
    });
    output::save_review_prompts(&path, &prompts)?;
    println!("Wrote {} review prompts to {}", prompts.len(), path.display());
    Ok(())
}

fn correct(config: &PipelineConfig, corrections_path: &Path) -> Result<()> {
    let samples: SampleSet = dataset::load_samples(&config.paths.samples)?;
    let corrections = output::load_corrections(corrections_path)
        .with_context(|| format!("failed to load corrections {}", corrections_path.display()))?;

    let mut coordinator = ReviewCoordinator::new(samples, config.labels.clone());
    let applied = coordinator.apply_corrections(&corrections)?;
    if applied.is_empty() {
        info!("All corrections already applied; ground truth unchanged");
        return Ok(());
    }

    output::append_corrections_log(&config.paths.corrections_log, &applied)?;
    let rows = dataset::write_ground_truth(&config.paths.samples, coordinator.samples())?;
    println!(
        "Applied {} corrections ({rows} rows updated in {})",
        applied.len(),
        config.paths.samples.display()
    );
    Ok(())
}

fn audit(config: &PipelineConfig, targets: &Path) -> Result<()> {
    let audit = dataset::audit_sample_lists(targets, &config.paths.samples)?;
    println!("{}", output::generate_audit_report(&audit));
    if !audit.is_consistent() {
        warn!("Sample lists are inconsistent");
    }
    Ok(())
}

fn export(config: &PipelineConfig, output_path: Option<PathBuf>) -> Result<()> {
    let samples = dataset::load_samples(&config.paths.samples)?;
    let table = output::load_predictions(&config.paths.predictions)?;
    let path = output_path.unwrap_or_else(|| config.paths.results_dir.join("predictions_wide.csv"));
    let rows = output::export_wide(&path, &table, &samples)?;
    println!("Exported {rows} rows to {}", path.display());
    Ok(())
}
