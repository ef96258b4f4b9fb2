//! Evaluation driver
//!
//! Runs the redactor over a held-out window of the dataset, scores each
//! prediction against the gold redaction and reports the mean as a
//! percentage. Calls fan out over a bounded number of in-flight requests.

use crate::config::Settings;
use crate::dataset::{
    eval_window, eval_window_randomized, DatasetCache, DatasetRow, DatasetWindow, HubRowSource,
    IndexedExample,
};
use crate::llm::{ChatModel, LlmClient, ModelSpec};
use crate::redactor::{Configuration, Redactor};
use crate::scoring::{score, ScoreResult, ScoringPolicy};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use futures::stream::{self, StreamExt};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How the evaluation rows were picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    Sequential { offset: usize },
    Randomized { seed: Option<u64> },
}

impl SamplingMode {
    pub fn describe(&self) -> String {
        match self {
            SamplingMode::Sequential { offset } => format!("sequential (offset={})", offset),
            SamplingMode::Randomized { seed: Some(seed) } => format!("randomized (seed={})", seed),
            SamplingMode::Randomized { seed: None } => "randomized (unseeded)".to_string(),
        }
    }
}

/// Result for one evaluated row.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleOutcome {
    pub index: usize,
    pub row_id: String,
    pub text: String,
    pub gold: String,
    pub prediction: Option<String>,
    pub error: Option<String>,
    pub score: f64,
    pub feedback: String,
}

impl ExampleOutcome {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub run_id: Uuid,
    pub model: String,
    pub configuration: &'static str,
    pub sampling: SamplingMode,
    pub policy: ScoringPolicy,
    /// Mean score in percent.
    pub score: f64,
    pub examples: usize,
    pub failed: usize,
    pub cost: f64,
    pub log_path: Option<PathBuf>,
}

/// Pick the evaluation window for `total` rows.
pub fn select_window(
    settings: &Settings,
    total: usize,
    randomize: bool,
) -> Result<(DatasetWindow, SamplingMode)> {
    if randomize {
        let window = eval_window_randomized(
            total,
            settings.evaluate_size,
            settings.optimization_end(),
            settings.evaluate_seed,
            settings.shortfall_policy(),
        )?;
        Ok((
            window,
            SamplingMode::Randomized {
                seed: settings.evaluate_seed,
            },
        ))
    } else {
        if settings.evaluate_offset < settings.optimization_end() {
            warn!(
                offset = settings.evaluate_offset,
                optimization_end = settings.optimization_end(),
                "Evaluation offset falls inside the optimization rows"
            );
        }
        let window = eval_window(total, settings.evaluate_size, settings.evaluate_offset);
        Ok((
            window,
            SamplingMode::Sequential {
                offset: settings.evaluate_offset,
            },
        ))
    }
}

/// Rows the cache must hold before the window can be chosen.
pub fn rows_needed(settings: &Settings, randomize: bool) -> usize {
    if randomize {
        settings
            .dataset_max_rows
            .max(settings.optimization_end() + settings.evaluate_size)
    } else {
        settings
            .evaluate_offset
            .saturating_add(settings.evaluate_size)
    }
}

async fn score_one<C: ChatModel>(
    redactor: &Redactor<C>,
    item: &IndexedExample,
    policy: ScoringPolicy,
) -> ExampleOutcome {
    let gold = &item.example.redacted_text;
    let (prediction, error, result) = match redactor.redact(&item.example.text).await {
        Ok(prediction) => {
            let result = score(policy, gold, &prediction.redacted_text);
            (Some(prediction.redacted_text), None, result)
        }
        Err(err) => {
            warn!(row = %item.row_id, "Redaction failed: {:#}", err);
            let result = ScoreResult {
                score: 0.0,
                feedback: format!("Redaction failed: {:#}", err),
            };
            (None, Some(format!("{:#}", err)), result)
        }
    };
    debug!(row = %item.row_id, score = result.score, "Scored example");
    ExampleOutcome {
        index: item.index,
        row_id: item.row_id.clone(),
        text: item.example.text.clone(),
        gold: gold.clone(),
        prediction,
        error,
        score: result.score,
        feedback: result.feedback,
    }
}

/// Score every example with at most `threads` calls in flight.
///
/// Outcomes come back ordered by row index.
pub async fn score_examples<C: ChatModel>(
    redactor: &Redactor<C>,
    examples: &[IndexedExample],
    policy: ScoringPolicy,
    threads: usize,
) -> Vec<ExampleOutcome> {
    let total = examples.len();
    let mut outcomes: Vec<ExampleOutcome> = stream::iter(examples)
        .map(|item| score_one(redactor, item, policy))
        .buffer_unordered(threads.max(1))
        .collect()
        .await;
    outcomes.sort_by_key(|o| o.index);
    info!(examples = total, "Scored evaluation set");
    outcomes
}

/// Mean score in percent; 0 for an empty set.
pub fn aggregate_percent(outcomes: &[ExampleOutcome]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let sum: f64 = outcomes.iter().map(|o| o.score).sum();
    sum / outcomes.len() as f64 * 100.0
}

/// Render the per-run evaluation log.
pub fn render_log(
    report: &EvaluationReport,
    started: DateTime<Local>,
    instructions: &str,
    outcomes: &[ExampleOutcome],
) -> String {
    let mut out = String::new();
    let rule = "=".repeat(72);
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "PII redaction evaluation");
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Run:           {}", report.run_id);
    let _ = writeln!(out, "Started:       {}", started.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Model:         {}", report.model);
    let _ = writeln!(out, "Configuration: {}", report.configuration);
    let _ = writeln!(out, "Sampling:      {}", report.sampling.describe());
    let _ = writeln!(out, "Policy:        {}", report.policy.as_str());
    let _ = writeln!(out, "Examples:      {}", report.examples);
    let _ = writeln!(out);
    let _ = writeln!(out, "--- Instructions ---");
    let _ = writeln!(out, "{}", instructions);

    for (n, outcome) in outcomes.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "--- Example {}/{} (row {}, id {}) ---",
            n + 1,
            outcomes.len(),
            outcome.index,
            outcome.row_id
        );
        let _ = writeln!(out, "Text:\n{}", outcome.text);
        let _ = writeln!(out, "Gold:\n{}", outcome.gold);
        match (&outcome.prediction, &outcome.error) {
            (Some(prediction), _) => {
                let _ = writeln!(out, "Prediction:\n{}", prediction);
            }
            (None, Some(error)) => {
                let _ = writeln!(out, "Error:\n{}", error);
            }
            (None, None) => {}
        }
        let _ = writeln!(out, "Score: {:.2}", outcome.score);
        let _ = writeln!(out, "Feedback:\n{}", outcome.feedback.trim_end());
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Score:  {:.2}%", report.score);
    let _ = writeln!(out, "Failed: {}", report.failed);
    let _ = writeln!(out, "Cost:   ${:.4}", report.cost);
    out
}

fn write_log(dir: &Path, started: DateTime<Local>, content: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory '{}'", dir.display()))?;
    let path = dir.join(format!("eval_{}.log", started.format("%Y%m%d_%H%M%S")));
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write evaluation log '{}'", path.display()))?;
    Ok(path)
}

/// Evaluate already-downloaded rows with `client`.
pub async fn evaluate_rows<C: ChatModel>(
    settings: &Settings,
    client: Arc<C>,
    rows: &[DatasetRow],
    randomize: bool,
    policy: ScoringPolicy,
) -> Result<EvaluationReport> {
    let started = Local::now();
    let (window, sampling) = select_window(settings, rows.len(), randomize)?;
    let examples = window.examples(rows);
    info!(
        "Prepared {} eval examples, {}",
        examples.len(),
        sampling.describe()
    );

    let configuration = Configuration::resolve(&settings.optimized_config_path)?;
    match &configuration {
        Configuration::Optimized(_) => info!("Evaluating optimized model"),
        Configuration::Default => info!("No optimized model found, evaluating base redactor"),
    }
    let redactor = Redactor::new(client.clone(), configuration.redactor_config());

    let outcomes = score_examples(&redactor, &examples, policy, settings.evaluate_threads).await;

    let mut report = EvaluationReport {
        run_id: Uuid::new_v4(),
        model: client.model_id().to_string(),
        configuration: configuration.kind(),
        sampling,
        policy,
        score: aggregate_percent(&outcomes),
        examples: outcomes.len(),
        failed: outcomes.iter().filter(|o| o.failed()).count(),
        cost: client.total_cost(),
        log_path: None,
    };
    info!("Evaluation score: {:.2}", report.score);
    info!("Evaluation cost: ${:.4}", report.cost);

    if settings.generate_logs {
        let content = render_log(
            &report,
            started,
            &redactor.config().system_prompt(),
            &outcomes,
        );
        let path = write_log(&settings.log_dir, started, &content)?;
        info!(path = %path.display(), "Wrote evaluation log");
        report.log_path = Some(path);
    }
    Ok(report)
}

/// Full evaluation: fetch rows, build the client, score, report.
pub async fn run_evaluation(settings: &Settings, randomize: bool) -> Result<EvaluationReport> {
    let api_key = settings.require_api_key()?;
    let cache = DatasetCache::new(&settings.dataset_cache_path);
    let rows = cache
        .ensure_rows(&HubRowSource::default(), rows_needed(settings, randomize))
        .await?;
    let client = Arc::new(
        LlmClient::new(api_key, ModelSpec::new(&settings.model)).with_endpoint(&settings.endpoint),
    );
    evaluate_rows(settings, client, &rows, randomize, ScoringPolicy::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fake::{last_user, ScriptedModel};
    use crate::redactor::OptimizedConfig;
    use tempfile::tempdir;

    fn rows(n: usize) -> Vec<DatasetRow> {
        (0..n)
            .map(|i| DatasetRow {
                id: format!("row-{}", i),
                source_text: format!("Call Ann at 555-01{:02}", i % 100),
                target_text: "Call [GIVENNAME1] at [TEL]".to_string(),
                language: "English".to_string(),
            })
            .collect()
    }

    fn settings_in(dir: &Path, vars: &[(&str, &str)]) -> Settings {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut settings = Settings::from_lookup(|name| {
            vars.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
        });
        settings.optimized_config_path = dir.join("optimized_model/pii_redactor.json");
        settings.log_dir = dir.join("logs");
        settings.dataset_cache_path = dir.join("data/english.json");
        settings
    }

    /// Answers with the gold redaction for even rows and drops the name on odd ones.
    fn half_right_model() -> Arc<ScriptedModel> {
        Arc::new(
            ScriptedModel::new("test/model", |messages| {
                let text = last_user(messages);
                let digits: u32 = text
                    .rsplit('-')
                    .next()
                    .and_then(|d| d.parse().ok())
                    .unwrap_or(0);
                let redacted = if digits % 2 == 0 {
                    "Call [GIVENNAME1] at [TEL]"
                } else {
                    "Call Ann at [TEL]"
                };
                Ok(format!(r#"{{"entities": [], "redacted_text": "{}"}}"#, redacted))
            })
            .with_cost(0.001),
        )
    }

    #[test]
    fn test_default_offset_follows_optimization_window() {
        let dir = tempdir().unwrap();
        let settings = settings_in(
            dir.path(),
            &[
                ("OPTIMIZE_TRAIN_SIZE", "800"),
                ("OPTIMIZE_VAL_SIZE", "200"),
                ("EVALUATE_SIZE", "100"),
            ],
        );
        let (window, sampling) = select_window(&settings, 2000, false).unwrap();
        assert_eq!(sampling, SamplingMode::Sequential { offset: 1000 });
        assert_eq!(window.indices, (1000..1100).collect::<Vec<_>>());
        assert_eq!(rows_needed(&settings, false), 1100);
    }

    #[test]
    fn test_randomized_window_is_reproducible() {
        let dir = tempdir().unwrap();
        let settings = settings_in(
            dir.path(),
            &[
                ("OPTIMIZE_TRAIN_SIZE", "80"),
                ("OPTIMIZE_VAL_SIZE", "20"),
                ("EVALUATE_SIZE", "30"),
                ("EVALUATE_SEED", "7"),
            ],
        );
        let (first, sampling) = select_window(&settings, 500, true).unwrap();
        let (second, _) = select_window(&settings, 500, true).unwrap();
        assert_eq!(sampling, SamplingMode::Randomized { seed: Some(7) });
        assert_eq!(first, second);
        assert_eq!(first.len(), 30);
        assert!(first.indices.iter().all(|&i| i >= 100));
    }

    #[test]
    fn test_strict_sampling_rejects_shortfall() {
        let dir = tempdir().unwrap();
        let settings = settings_in(
            dir.path(),
            &[("EVALUATE_SIZE", "600"), ("EVALUATE_STRICT_SAMPLE", "yes")],
        );
        assert!(select_window(&settings, 700, true).is_err());
    }

    #[test]
    fn test_aggregate_percent() {
        assert_eq!(aggregate_percent(&[]), 0.0);
        let outcome = |score| ExampleOutcome {
            index: 0,
            row_id: String::new(),
            text: String::new(),
            gold: String::new(),
            prediction: None,
            error: None,
            score,
            feedback: String::new(),
        };
        let pct = aggregate_percent(&[outcome(1.0), outcome(0.5)]);
        assert!((pct - 75.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_evaluate_rows_scores_and_orders_outcomes() {
        let dir = tempdir().unwrap();
        let settings = settings_in(
            dir.path(),
            &[
                ("OPTIMIZE_TRAIN_SIZE", "4"),
                ("OPTIMIZE_VAL_SIZE", "2"),
                ("EVALUATE_SIZE", "4"),
                ("EVALUATE_THREADS", "3"),
            ],
        );
        let model = half_right_model();
        let report = evaluate_rows(&settings, model.clone(), &rows(20), false, ScoringPolicy::Hybrid)
            .await
            .unwrap();

        // rows 6..10: two exact, two missing one of two labels (0.75 * 0.5 + 0.25 * 1.0)
        assert_eq!(report.examples, 4);
        assert_eq!(report.failed, 0);
        assert!((report.score - (1.0 + 1.0 + 0.625 + 0.625) / 4.0 * 100.0).abs() < 1e-9);
        assert_eq!(report.configuration, "default");
        assert_eq!(model.calls(), 4);
        assert!((report.cost - 0.004).abs() < 1e-12);
        assert!(report.log_path.is_none());
    }

    #[tokio::test]
    async fn test_failed_calls_score_zero_and_are_logged() {
        let dir = tempdir().unwrap();
        let settings = settings_in(
            dir.path(),
            &[
                ("OPTIMIZE_TRAIN_SIZE", "0"),
                ("OPTIMIZE_VAL_SIZE", "0"),
                ("EVALUATE_SIZE", "3"),
                ("GENERATE_LOGS", "1"),
            ],
        );
        let model = Arc::new(ScriptedModel::new("test/model", |messages| {
            if last_user(messages).ends_with("555-0101") {
                anyhow::bail!("Rate limited by the model provider.")
            }
            Ok(r#"{"redacted_text": "Call [GIVENNAME1] at [TEL]"}"#.to_string())
        }));
        let report = evaluate_rows(&settings, model, &rows(3), false, ScoringPolicy::Hybrid)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert!((report.score - 200.0 / 3.0).abs() < 1e-9);

        let log_path = report.log_path.expect("log written");
        let name = log_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("eval_") && name.ends_with(".log"));
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("--- Instructions ---"));
        assert!(log.contains("Use these labels"));
        assert!(log.contains("--- Example 2/3 (row 1, id row-1) ---"));
        assert!(log.contains("Error:\nRate limited by the model provider."));
        assert!(log.contains("Score:  66.67%"));
    }

    #[tokio::test]
    async fn test_uses_optimized_instructions_when_present() {
        let dir = tempdir().unwrap();
        let settings = settings_in(
            dir.path(),
            &[
                ("OPTIMIZE_TRAIN_SIZE", "0"),
                ("OPTIMIZE_VAL_SIZE", "0"),
                ("EVALUATE_SIZE", "1"),
            ],
        );
        OptimizedConfig {
            instructions: "Tuned instructions.".to_string(),
            model: "test/model".to_string(),
            val_score: 0.9,
            baseline_score: 0.8,
            rounds: 1,
            created_at: chrono::Utc::now(),
        }
        .save(&settings.optimized_config_path)
        .unwrap();

        let model = half_right_model();
        let report = evaluate_rows(&settings, model.clone(), &rows(1), false, ScoringPolicy::ExactMatch)
            .await
            .unwrap();
        assert_eq!(report.configuration, "optimized");
        assert_eq!(report.score, 100.0);
        let requests = model.requests();
        assert!(requests[0][0].content.starts_with("Tuned instructions."));
    }
}
