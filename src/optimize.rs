//! Prompt optimization driver
//!
//! The driver owns the data windows, the metric and persistence. The search
//! itself sits behind [`PromptOptimizer`]; [`ReflectiveOptimizer`] is a
//! bounded greedy loop that asks a reflection model to rewrite the
//! instructions from failing feedback and keeps a rewrite only when the
//! validation score improves.

use crate::config::Settings;
use crate::dataset::{train_val_split, DatasetCache, Example, HubRowSource, IndexedExample};
use crate::evaluate::score_examples;
use crate::llm::{parse_json_object, ChatMessage, ChatModel, LlmClient, ModelSpec};
use crate::redactor::{OptimizedConfig, Redactor, RedactorConfig};
use crate::scoring::ScoringPolicy;
use crate::util::truncate;
use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const MINIBATCH_SIZE: usize = 8;
const OPTIMIZE_THREADS: usize = 4;
/// Failures quoted back to the reflection model per round
const MAX_FEEDBACK_ITEMS: usize = 6;
const FEEDBACK_TEXT_CHARS: usize = 600;

const REFLECTION_SYSTEM: &str = r#"You improve the instructions given to an assistant that finds personally identifiable information (PII) in text and replaces each span with a bracketed label such as [GIVENNAME1] or [TEL].

You will see the current instructions and examples the assistant got wrong, each with scoring feedback. Missing PII is a privacy leak and matters most. Using the wrong label matters less. Redacting extra text is tolerated.

Write improved instructions that fix the failure patterns you see. Keep them general; do not quote the example texts. The label list and output format are appended automatically, so do not repeat them.

Respond with a single JSON object: {"instructions": "..."}"#;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationOutcome {
    pub instructions: String,
    /// Mean hybrid score on the validation set, in [0, 1].
    pub val_score: f64,
    pub baseline_score: f64,
    pub rounds: usize,
    pub accepted: usize,
}

impl OptimizationOutcome {
    pub fn improved(&self) -> bool {
        self.val_score > self.baseline_score
    }
}

/// Search for better instructions for `student`.
pub trait PromptOptimizer {
    fn optimize<C: ChatModel>(
        &self,
        student: &Redactor<C>,
        trainset: &[Example],
        valset: &[Example],
    ) -> impl Future<Output = Result<OptimizationOutcome>>;
}

#[derive(Deserialize)]
struct Proposal {
    instructions: String,
}

pub struct ReflectiveOptimizer<R> {
    reflection: Arc<R>,
    rounds: usize,
    minibatch: usize,
    threads: usize,
}

impl<R: ChatModel> ReflectiveOptimizer<R> {
    pub fn new(reflection: Arc<R>, rounds: usize) -> Self {
        Self {
            reflection,
            rounds,
            minibatch: MINIBATCH_SIZE,
            threads: OPTIMIZE_THREADS,
        }
    }

    pub fn with_minibatch(mut self, minibatch: usize) -> Self {
        self.minibatch = minibatch.max(1);
        self
    }

    async fn mean_score<C: ChatModel>(
        &self,
        student: &Redactor<C>,
        config: &RedactorConfig,
        examples: &[IndexedExample],
    ) -> f64 {
        if examples.is_empty() {
            return 0.0;
        }
        let redactor = Redactor::new(student.client().clone(), config.clone());
        let outcomes =
            score_examples(&redactor, examples, ScoringPolicy::Hybrid, self.threads).await;
        outcomes.iter().map(|o| o.score).sum::<f64>() / outcomes.len() as f64
    }

    async fn propose(&self, current: &str, failures: &[(String, String)]) -> Result<String> {
        let mut user = String::new();
        let _ = writeln!(user, "Current instructions:\n{}\n", current.trim());
        for (n, (text, feedback)) in failures.iter().enumerate() {
            let _ = writeln!(user, "### Failure {}", n + 1);
            let _ = writeln!(user, "Text:\n{}", truncate(text, FEEDBACK_TEXT_CHARS));
            let _ = writeln!(user, "Feedback:\n{}\n", feedback.trim_end());
        }
        let response = self
            .reflection
            .chat(
                vec![ChatMessage::system(REFLECTION_SYSTEM), ChatMessage::user(user)],
                true,
            )
            .await?;
        let proposal: Proposal = parse_json_object(&response.content)?;
        let instructions = proposal.instructions.trim().to_string();
        if instructions.is_empty() {
            anyhow::bail!("Reflection model proposed empty instructions");
        }
        Ok(instructions)
    }
}

fn indexed(examples: &[Example], prefix: &str) -> Vec<IndexedExample> {
    examples
        .iter()
        .enumerate()
        .map(|(index, example)| IndexedExample {
            index,
            row_id: format!("{}-{}", prefix, index),
            example: example.clone(),
        })
        .collect()
}

/// Minibatch for `round`, walking the train set cyclically.
fn minibatch(train: &[IndexedExample], round: usize, size: usize) -> Vec<IndexedExample> {
    if train.is_empty() {
        return Vec::new();
    }
    let size = size.min(train.len());
    let start = (round * size) % train.len();
    (0..size)
        .map(|i| train[(start + i) % train.len()].clone())
        .collect()
}

impl<R: ChatModel> PromptOptimizer for ReflectiveOptimizer<R> {
    async fn optimize<C: ChatModel>(
        &self,
        student: &Redactor<C>,
        trainset: &[Example],
        valset: &[Example],
    ) -> Result<OptimizationOutcome> {
        let train = indexed(trainset, "train");
        let val = indexed(valset, "val");

        let mut best = student.config().clone();
        let baseline = self.mean_score(student, &best, &val).await;
        info!("Baseline validation score: {:.4}", baseline);
        let mut best_score = baseline;
        let mut accepted = 0;

        for round in 0..self.rounds {
            let batch = minibatch(&train, round, self.minibatch);
            let redactor = Redactor::new(student.client().clone(), best.clone());
            let outcomes =
                score_examples(&redactor, &batch, ScoringPolicy::Hybrid, self.threads).await;
            let failures: Vec<(String, String)> = outcomes
                .into_iter()
                .filter(|o| o.score < 1.0)
                .take(MAX_FEEDBACK_ITEMS)
                .map(|o| (o.text, o.feedback))
                .collect();
            if failures.is_empty() {
                info!(round = round + 1, "Minibatch fully correct; nothing to reflect on");
                continue;
            }

            let candidate = match self.propose(&best.instructions, &failures).await {
                Ok(instructions) => best.with_instructions(instructions),
                Err(err) => {
                    warn!(round = round + 1, "Reflection failed: {:#}", err);
                    continue;
                }
            };
            let score = self.mean_score(student, &candidate, &val).await;
            if score > best_score {
                info!(
                    round = round + 1,
                    "Accepted new instructions ({:.4} -> {:.4})",
                    best_score,
                    score
                );
                best = candidate;
                best_score = score;
                accepted += 1;
            } else {
                info!(
                    round = round + 1,
                    "Rejected candidate ({:.4} <= {:.4})",
                    score,
                    best_score
                );
            }
        }

        Ok(OptimizationOutcome {
            instructions: best.instructions,
            val_score: best_score,
            baseline_score: baseline,
            rounds: self.rounds,
            accepted,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationReport {
    pub outcome: OptimizationOutcome,
    pub saved_to: PathBuf,
    pub student_cost: f64,
    /// Only set when a separate reflection model was used.
    pub reflection_cost: Option<f64>,
}

impl OptimizationReport {
    pub fn total_cost(&self) -> f64 {
        self.student_cost + self.reflection_cost.unwrap_or(0.0)
    }
}

/// Run the optimizer on prepared windows and persist the result.
pub async fn optimize_with<C, R, O>(
    settings: &Settings,
    student: Arc<C>,
    reflection: Option<Arc<R>>,
    optimizer: &O,
    trainset: &[Example],
    valset: &[Example],
) -> Result<OptimizationReport>
where
    C: ChatModel,
    R: ChatModel,
    O: PromptOptimizer,
{
    info!("Prepared {} train, {} val examples", trainset.len(), valset.len());
    let redactor = Redactor::new(student.clone(), RedactorConfig::default_config());
    let outcome = optimizer.optimize(&redactor, trainset, valset).await?;

    let config = OptimizedConfig {
        instructions: outcome.instructions.clone(),
        model: student.model_id().to_string(),
        val_score: outcome.val_score,
        baseline_score: outcome.baseline_score,
        rounds: outcome.rounds,
        created_at: Utc::now(),
    };
    config.save(&settings.optimized_config_path)?;
    info!(
        "Optimized model saved to {}",
        settings.optimized_config_path.display()
    );

    Ok(OptimizationReport {
        outcome,
        saved_to: settings.optimized_config_path.clone(),
        student_cost: student.total_cost(),
        reflection_cost: reflection.map(|r| r.total_cost()),
    })
}

/// Full optimization: fetch rows, build clients, optimize, save.
pub async fn run_optimization(settings: &Settings) -> Result<OptimizationReport> {
    let api_key = settings.require_api_key()?;
    let cache = DatasetCache::new(&settings.dataset_cache_path);
    let rows = cache
        .ensure_rows(&HubRowSource::default(), settings.optimization_end())
        .await?;
    let (train, val) = train_val_split(
        &rows,
        settings.optimize_train_size,
        settings.optimize_val_size,
    );
    let trainset: Vec<Example> = train.iter().map(Example::from).collect();
    let valset: Vec<Example> = val.iter().map(Example::from).collect();

    let client = |model: &str| {
        Arc::new(
            LlmClient::new(api_key, ModelSpec::new(model)).with_endpoint(&settings.endpoint),
        )
    };
    let student = client(settings.model.as_str());
    let reflection = settings.reflection_model.as_deref().map(client);
    let optimizer = ReflectiveOptimizer::new(
        reflection.clone().unwrap_or_else(|| student.clone()),
        settings.optimize_rounds,
    );

    info!(
        "Starting reflective optimization ({} rounds, reflection model {})...",
        settings.optimize_rounds,
        settings
            .reflection_model
            .as_deref()
            .unwrap_or(settings.model.as_str())
    );
    optimize_with(settings, student, reflection, &optimizer, &trainset, &valset).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fake::ScriptedModel;
    use crate::redactor::load_optimized;
    use tempfile::tempdir;

    const GOLD: &str = "Call [GIVENNAME1] at [TEL]";

    fn examples(n: usize) -> Vec<Example> {
        (0..n)
            .map(|i| Example::new(format!("Call Ann at 555-01{:02}", i), GOLD))
            .collect()
    }

    /// Gets names right only once the instructions mention them.
    fn student() -> Arc<ScriptedModel> {
        Arc::new(
            ScriptedModel::new("test/student", |messages| {
                let redacted = if messages[0].content.contains("given names") {
                    GOLD
                } else {
                    "Call Ann at [TEL]"
                };
                Ok(format!(r#"{{"redacted_text": "{}"}}"#, redacted))
            })
            .with_cost(0.001),
        )
    }

    fn reflection(reply: &'static str) -> Arc<ScriptedModel> {
        Arc::new(ScriptedModel::new("test/reflection", move |_| Ok(reply.to_string())).with_cost(0.01))
    }

    #[test]
    fn test_minibatch_wraps_around() {
        let train = indexed(&examples(5), "train");
        let batch = minibatch(&train, 1, 3);
        let indices: Vec<usize> = batch.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![3, 4, 0]);
        assert!(minibatch(&[], 0, 3).is_empty());
        assert_eq!(minibatch(&train, 0, 10).len(), 5);
    }

    #[tokio::test]
    async fn test_accepts_improving_instructions() {
        let reflector = reflection(r#"{"instructions": "Redact all given names and phone numbers."}"#);
        let optimizer = ReflectiveOptimizer::new(reflector.clone(), 2).with_minibatch(2);
        let redactor = Redactor::new(student(), RedactorConfig::new("Find PII.", Vec::new()));

        let outcome = optimizer
            .optimize(&redactor, &examples(4), &examples(2))
            .await
            .unwrap();

        assert_eq!(outcome.instructions, "Redact all given names and phone numbers.");
        assert!((outcome.baseline_score - 0.625).abs() < 1e-9);
        assert!((outcome.val_score - 1.0).abs() < 1e-9);
        assert_eq!(outcome.accepted, 1);
        assert!(outcome.improved());
        // second round sees a perfect minibatch and skips reflection
        assert_eq!(reflector.calls(), 1);
        let request = &reflector.requests()[0];
        assert!(request[1].content.contains("Current instructions:\nFind PII."));
        assert!(request[1].content.contains("CRITICAL"));
    }

    #[tokio::test]
    async fn test_rejects_candidates_that_do_not_improve() {
        let reflector = reflection(r#"{"instructions": "Be careful."}"#);
        let optimizer = ReflectiveOptimizer::new(reflector.clone(), 3).with_minibatch(2);
        let redactor = Redactor::new(student(), RedactorConfig::new("Find PII.", Vec::new()));

        let outcome = optimizer
            .optimize(&redactor, &examples(4), &examples(2))
            .await
            .unwrap();

        assert_eq!(outcome.instructions, "Find PII.");
        assert_eq!(outcome.accepted, 0);
        assert!(!outcome.improved());
        assert_eq!(reflector.calls(), 3);
    }

    #[tokio::test]
    async fn test_malformed_reflection_skips_round() {
        let reflector = reflection("no idea");
        let optimizer = ReflectiveOptimizer::new(reflector, 1).with_minibatch(2);
        let redactor = Redactor::new(student(), RedactorConfig::new("Find PII.", Vec::new()));
        let outcome = optimizer
            .optimize(&redactor, &examples(2), &examples(2))
            .await
            .unwrap();
        assert_eq!(outcome.instructions, "Find PII.");
    }

    #[tokio::test]
    async fn test_optimize_with_saves_config_and_splits_cost() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.optimized_config_path = dir.path().join("optimized_model/pii_redactor.json");

        let student = student();
        let reflector = reflection(r#"{"instructions": "Redact all given names and phone numbers."}"#);
        let optimizer = ReflectiveOptimizer::new(reflector.clone(), 1).with_minibatch(2);
        let report = optimize_with(
            &settings,
            student.clone(),
            Some(reflector),
            &optimizer,
            &examples(2),
            &examples(2),
        )
        .await
        .unwrap();

        // baseline 2 + minibatch 2 + candidate 2 student calls, 1 reflection call
        assert_eq!(student.calls(), 6);
        assert!((report.student_cost - 0.006).abs() < 1e-12);
        assert_eq!(report.reflection_cost, Some(0.01));
        assert!((report.total_cost() - 0.016).abs() < 1e-12);

        let saved = load_optimized(&report.saved_to).unwrap().unwrap();
        assert_eq!(saved.instructions, "Redact all given names and phone numbers.");
        assert_eq!(saved.model, "test/student");
        assert!((saved.val_score - 1.0).abs() < 1e-9);
        assert_eq!(saved.rounds, 1);
    }
}
