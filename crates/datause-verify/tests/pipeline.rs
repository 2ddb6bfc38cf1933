//! End-to-end pipeline tests with a scripted backend

use async_trait::async_trait;
use datause_verify::{
    dataset, output, CorrectionRequest, EvaluationEngine, Failure, FailureKind, Label,
    LlmBackend, LlmClient, PipelineConfig, PredictionColumn, PredictionRunner, PredictionStatus,
    PredictionStrategy, PredictionTable, PromptBuilder, ResponseParser, ReviewCoordinator,
    RunOptions, Sample, SampleId, SampleSet,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Answers "Used" when the prompt carries `MARK-USED`, "Not Used" otherwise.
/// Prompts carrying `MARK-STALL` hang while `stall` is set.
#[derive(Default)]
struct ScriptedBackend {
    stall: AtomicBool,
    calls: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedBackend {
    fn stalling() -> Self {
        Self {
            stall: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _model: &str, prompt: &str) -> Result<String, Failure> {
        self.calls.lock().unwrap().push(tokio::time::Instant::now());
        if prompt.contains("MARK-STALL") && self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let decision = if prompt.contains("MARK-USED") {
            "Used"
        } else {
            "Not Used"
        };
        Ok(format!(
            r#"{{"decision": "{decision}", "reasoning": "scripted answer"}}"#
        ))
    }
}

fn runner(backend: Arc<ScriptedBackend>, config: &PipelineConfig) -> PredictionRunner {
    PredictionRunner::new(
        LlmClient::new(backend, config.pacing_interval()),
        PromptBuilder::from_config(config).unwrap(),
        ResponseParser::new(config.labels.clone()),
        config,
    )
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        pacing_interval_ms: 0,
        workers: 2,
        ..PipelineConfig::default()
    }
}

fn sample(id: &str, text: &str, truth: Label) -> Sample {
    Sample::new(id).with_abstract(text).with_ground_truth(truth)
}

#[tokio::test]
async fn test_matching_predictions_score_perfectly() {
    let samples: SampleSet = [
        sample("1", "This study MARK-USED dataset X.", Label::UsesData),
        sample("2", "An unrelated paper.", Label::DoesNotUseData),
    ]
    .into_iter()
    .collect();
    let config = fast_config();
    let backend = Arc::new(ScriptedBackend::default());
    let mut table = PredictionTable::new();

    let summary = runner(backend, &config)
        .run(&samples, PredictionStrategy::Abstract, &mut table, &RunOptions::default())
        .await;
    assert_eq!(summary.succeeded, 2);

    let column = PredictionColumn::from_table(&table, PredictionStrategy::Abstract);
    let engine = EvaluationEngine::from_config(&config);
    let result = engine.compute_metrics(&column, &samples).unwrap();

    assert!((result.accuracy - 1.0).abs() < f64::EPSILON);
    for label in [Label::UsesData, Label::DoesNotUseData] {
        let class = result.class(label).unwrap();
        assert!((class.f1 - 1.0).abs() < f64::EPSILON);
    }
    assert!(engine.find_disagreements(&column, &samples).is_empty());
}

#[tokio::test]
async fn test_disagreement_produces_one_review_prompt() {
    let samples: SampleSet = [
        sample("1", "This study MARK-USED dataset X.", Label::UsesData),
        sample("2", "An unrelated paper.", Label::DoesNotUseData),
        sample("3", "Dataset X appears only in related work.", Label::UsesData),
    ]
    .into_iter()
    .collect();
    let config = fast_config();
    let mut table = PredictionTable::new();
    runner(Arc::new(ScriptedBackend::default()), &config)
        .run(&samples, PredictionStrategy::Abstract, &mut table, &RunOptions::default())
        .await;

    let column = PredictionColumn::from_table(&table, PredictionStrategy::Abstract);
    let cases = EvaluationEngine::from_config(&config).find_disagreements(&column, &samples);
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].sample_id, SampleId::new("3"));
    assert_eq!(cases[0].ground_truth, Label::UsesData);
    assert_eq!(cases[0].predicted, Label::DoesNotUseData);
    assert_eq!(cases[0].rationale.as_deref(), Some("scripted answer"));

    let coordinator = ReviewCoordinator::new(samples, config.labels.clone());
    let prompts = coordinator.generate_review_prompts(&cases);
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Dataset X appears only in related work."));
    assert!(prompts[0].contains("* My label: Used"));
    assert!(prompts[0].contains("* AI model label: Not Used"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_retry_only_touches_failed_sample() {
    let samples: SampleSet = [
        sample("1", "This study MARK-USED dataset X.", Label::UsesData),
        sample("2", "An unrelated paper.", Label::DoesNotUseData),
        sample("4", "MARK-STALL MARK-USED", Label::UsesData),
    ]
    .into_iter()
    .collect();
    let config = PipelineConfig {
        request_timeout_secs: 30,
        ..fast_config()
    };
    let backend = Arc::new(ScriptedBackend::stalling());
    let runner = runner(backend.clone(), &config);
    let mut table = PredictionTable::new();
    let options = RunOptions::default();

    let first = runner
        .run(&samples, PredictionStrategy::Abstract, &mut table, &options)
        .await;
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.failed, 1);

    let id4 = SampleId::new("4");
    let failed = table.get(&id4, PredictionStrategy::Abstract).unwrap();
    assert_eq!(failed.status, PredictionStatus::Failed);
    assert_eq!(failed.failure, Some(FailureKind::Timeout));
    assert!(failed.label.is_none());

    let before_1 = table
        .get(&SampleId::new("1"), PredictionStrategy::Abstract)
        .cloned();
    let before_2 = table
        .get(&SampleId::new("2"), PredictionStrategy::Abstract)
        .cloned();

    backend.stall.store(false, Ordering::SeqCst);
    let retry = runner
        .retry_failed(&samples, PredictionStrategy::Abstract, &mut table, &options)
        .await;
    assert_eq!(retry.attempted, 1);
    assert_eq!(retry.succeeded, 1);

    let fixed = table.get(&id4, PredictionStrategy::Abstract).unwrap();
    assert_eq!(fixed.status, PredictionStatus::Success);
    assert_eq!(fixed.label, Some(Label::UsesData));
    assert_eq!(
        table.get(&SampleId::new("1"), PredictionStrategy::Abstract).cloned(),
        before_1
    );
    assert_eq!(
        table.get(&SampleId::new("2"), PredictionStrategy::Abstract).cloned(),
        before_2
    );
}

#[tokio::test(start_paused = true)]
async fn test_pacing_holds_across_workers() {
    let samples: SampleSet = (1..=4)
        .map(|i| sample(&i.to_string(), "text", Label::DoesNotUseData))
        .collect();
    let config = PipelineConfig {
        pacing_interval_ms: 1000,
        workers: 4,
        ..PipelineConfig::default()
    };
    let backend = Arc::new(ScriptedBackend::default());
    let mut table = PredictionTable::new();

    runner(backend.clone(), &config)
        .run(&samples, PredictionStrategy::Abstract, &mut table, &RunOptions::default())
        .await;

    let mut starts = backend.calls.lock().unwrap().clone();
    starts.sort();
    assert_eq!(starts.len(), 4);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(1000));
    }
}

#[tokio::test]
async fn test_noop_retry_leaves_saved_table_identical() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("predictions.csv");
    let samples: SampleSet = [
        sample("1", "This study MARK-USED dataset X.", Label::UsesData),
        sample("2", "An unrelated paper.", Label::DoesNotUseData),
    ]
    .into_iter()
    .collect();
    let config = fast_config();
    let backend = Arc::new(ScriptedBackend::default());
    let runner = runner(backend.clone(), &config);

    let mut table = PredictionTable::new();
    runner
        .run(&samples, PredictionStrategy::Abstract, &mut table, &RunOptions::default())
        .await;
    output::save_predictions(&path, &table).unwrap();
    let saved = std::fs::read(&path).unwrap();
    let calls = backend.call_count();

    let mut reloaded = output::load_predictions(&path).unwrap();
    assert_eq!(reloaded, table);
    let summary = runner
        .retry_failed(
            &samples,
            PredictionStrategy::Abstract,
            &mut reloaded,
            &RunOptions::default(),
        )
        .await;

    assert!(!summary.changed());
    assert_eq!(backend.call_count(), calls);
    assert_eq!(reloaded, table);
    assert_eq!(std::fs::read(&path).unwrap(), saved);
}

#[tokio::test]
async fn test_resume_skips_successful_samples() {
    let samples: SampleSet = [
        sample("1", "MARK-USED", Label::UsesData),
        sample("2", "plain", Label::DoesNotUseData),
        sample("10", "plain", Label::DoesNotUseData),
    ]
    .into_iter()
    .collect();
    let config = fast_config();
    let backend = Arc::new(ScriptedBackend::default());
    let runner = runner(backend.clone(), &config);
    let mut table = PredictionTable::new();

    runner
        .run(&samples, PredictionStrategy::Abstract, &mut table, &RunOptions::default())
        .await;
    let second = runner
        .run(&samples, PredictionStrategy::Abstract, &mut table, &RunOptions::default())
        .await;

    assert_eq!(second.attempted, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(backend.call_count(), 3);

    let ids: Vec<&str> = table.records().map(|r| r.sample_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "10"]);
}

#[tokio::test]
async fn test_correction_round_trip_through_csv() {
    let dir = TempDir::new().unwrap();
    let samples_path = dir.path().join("samples.csv");
    std::fs::write(
        &samples_path,
        "sample_id,citing_paper_title,abstract,ground_truth,notes\n\
         1,First,MARK-USED dataset X,uses_data,keep\n\
         2,Second,unrelated,does_not_use_data,keep\n\
         3,Third,related work only,uses_data,check\n",
    )
    .unwrap();

    let config = fast_config();
    let samples = dataset::load_samples(&samples_path).unwrap();
    let mut table = PredictionTable::new();
    runner(Arc::new(ScriptedBackend::default()), &config)
        .run(&samples, PredictionStrategy::Abstract, &mut table, &RunOptions::default())
        .await;

    let column = PredictionColumn::from_table(&table, PredictionStrategy::Abstract);
    let engine = EvaluationEngine::from_config(&config);
    let before = engine.compute_metrics(&column, &samples).unwrap();
    assert_eq!(engine.find_disagreements(&column, &samples).len(), 1);

    let corrections: BTreeMap<SampleId, CorrectionRequest> = [(
        SampleId::new("3"),
        CorrectionRequest {
            label: "Not Used".to_string(),
            justification: "Only named in related work.".to_string(),
        },
    )]
    .into_iter()
    .collect();
    let mut coordinator = ReviewCoordinator::new(samples, config.labels.clone());
    let applied = coordinator.apply_corrections(&corrections).unwrap();
    assert_eq!(applied.len(), 1);

    let changed = dataset::write_ground_truth(&samples_path, coordinator.samples()).unwrap();
    assert_eq!(changed, 1);
    let written = std::fs::read_to_string(&samples_path).unwrap();
    assert!(written.contains("notes"));
    assert!(written.contains("check"));

    let reloaded = dataset::load_samples(&samples_path).unwrap();
    assert_eq!(
        reloaded.ground_truth(&SampleId::new("3")),
        Some(Label::DoesNotUseData)
    );
    let after = engine.compute_metrics(&column, &reloaded).unwrap();
    assert!(after.accuracy > before.accuracy);
    assert!(engine.find_disagreements(&column, &reloaded).is_empty());
}
