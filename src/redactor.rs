//! Single-call PII redaction
//!
//! A [`Redactor`] sends one chat request per input: the instructions and label
//! taxonomy as the system message, the few-shot demonstrations as prior
//! user/assistant turns, then the text to redact. The reply is a JSON object
//! with the detected entities and the redacted text.

use crate::dataset::Example;
use crate::fewshot;
use crate::labels::{taxonomy_lines, PiiEntity};
use crate::llm::{parse_json_object, ChatMessage, ChatModel};
use crate::util::write_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const BASE_INSTRUCTIONS: &str =
    "Identify all PII entities in the text and produce a redacted version.";

const OUTPUT_FORMAT: &str = r#"Respond with a single JSON object and nothing else:
{
  "reasoning": "brief step-by-step notes on what is and is not PII",
  "entities": [{"value": "exact substring of the text", "label": "LABEL"}],
  "redacted_text": "the text with each PII value replaced by [LABEL]"
}"#;

/// Instructions and demonstrations for a redactor. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RedactorConfig {
    pub instructions: String,
    pub demos: Vec<Example>,
}

impl RedactorConfig {
    pub fn new(instructions: impl Into<String>, demos: Vec<Example>) -> Self {
        Self {
            instructions: instructions.into(),
            demos,
        }
    }

    /// Base instructions with the bundled demonstration bank.
    pub fn default_config() -> Self {
        Self::new(BASE_INSTRUCTIONS, fewshot::demos().to_vec())
    }

    /// Same demonstrations, different instructions.
    pub fn with_instructions(&self, instructions: impl Into<String>) -> Self {
        Self::new(instructions, self.demos.clone())
    }

    /// Full system prompt sent ahead of the demonstrations.
    pub fn system_prompt(&self) -> String {
        format!(
            "{}\n\nUse these labels (from ai4privacy/pii-masking-300k):\n{}\n\n{}",
            self.instructions.trim(),
            taxonomy_lines(),
            OUTPUT_FORMAT
        )
    }
}

/// Tuned instructions written by the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedConfig {
    pub instructions: String,
    pub model: String,
    pub val_score: f64,
    pub baseline_score: f64,
    pub rounds: usize,
    pub created_at: DateTime<Utc>,
}

impl OptimizedConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(path, &content)
            .with_context(|| format!("Failed to save optimized configuration to '{}'", path.display()))
    }
}

/// Read a persisted configuration. A missing file is `Ok(None)`.
pub fn load_optimized(path: &Path) -> Result<Option<OptimizedConfig>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read '{}'", path.display()))
        }
    };
    let config = serde_json::from_str(&content)
        .with_context(|| format!("Invalid optimized configuration in '{}'", path.display()))?;
    Ok(Some(config))
}

/// Which instructions a run uses.
#[derive(Debug, Clone, PartialEq)]
pub enum Configuration {
    Optimized(OptimizedConfig),
    Default,
}

impl Configuration {
    pub fn resolve(path: &Path) -> Result<Self> {
        Ok(match load_optimized(path)? {
            Some(config) => Configuration::Optimized(config),
            None => Configuration::Default,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Configuration::Optimized(_) => "optimized",
            Configuration::Default => "default",
        }
    }

    pub fn redactor_config(&self) -> RedactorConfig {
        let base = RedactorConfig::default_config();
        match self {
            Configuration::Optimized(config) => base.with_instructions(config.instructions.clone()),
            Configuration::Default => base,
        }
    }
}

/// Model output for one text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Prediction {
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub entities: Vec<PiiEntity>,
    pub redacted_text: String,
}

pub struct Redactor<C> {
    client: Arc<C>,
    config: RedactorConfig,
}

impl<C: ChatModel> Redactor<C> {
    pub fn new(client: Arc<C>, config: RedactorConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn config(&self) -> &RedactorConfig {
        &self.config
    }

    pub fn build_messages(&self, text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2 + self.config.demos.len() * 2);
        messages.push(ChatMessage::system(self.config.system_prompt()));
        for demo in &self.config.demos {
            messages.push(ChatMessage::user(user_turn(&demo.text)));
            messages.push(ChatMessage::assistant(demo_answer(demo)));
        }
        messages.push(ChatMessage::user(user_turn(text)));
        messages
    }

    /// One model call; malformed output is an error for this call only.
    pub async fn redact(&self, text: &str) -> Result<Prediction> {
        let response = self.client.chat(self.build_messages(text), true).await?;
        let prediction: Prediction = parse_json_object(&response.content)?;
        let unknown = prediction
            .entities
            .iter()
            .filter(|e| !e.is_well_formed())
            .count();
        if unknown > 0 {
            debug!(unknown, "Model used labels outside the taxonomy");
        }
        Ok(prediction)
    }
}

fn user_turn(text: &str) -> String {
    format!("Text: {}", text)
}

fn demo_answer(demo: &Example) -> String {
    serde_json::json!({
        "entities": demo.entities,
        "redacted_text": demo.redacted_text,
    })
    .to_string()
}
