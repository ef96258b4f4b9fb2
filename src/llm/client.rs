use super::models::{ModelSpec, Usage};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use tracing::debug;

/// OpenRouter chat completions endpoint (OpenAI-compatible)
pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Response from LLM including content and usage stats
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
}

/// One completed call, kept for cost accounting and `--verbose` output.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub response: String,
    pub usage: Option<Usage>,
}

/// Anything that answers a chat exchange and tracks what it spent.
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &str;

    fn chat(
        &self,
        messages: Vec<ChatMessage>,
        json_mode: bool,
    ) -> impl Future<Output = Result<LlmResponse>> + Send;

    /// Sum of reported costs across every call made so far.
    fn total_cost(&self) -> f64;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    usage: UsageRequest,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize)]
struct UsageRequest {
    include: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for one model. Every call is appended to an in-memory history.
pub struct LlmClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: ModelSpec,
    history: Mutex<Vec<HistoryEntry>>,
}

impl LlmClient {
    pub fn new(api_key: impl Into<String>, model: ModelSpec) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: OPENROUTER_URL.to_string(),
            api_key: api_key.into(),
            model,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// The last `n` calls, oldest first.
    pub fn last_calls(&self, n: usize) -> Vec<HistoryEntry> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let start = history.len().saturating_sub(n);
        history[start..].to_vec()
    }

    fn record(&self, entry: HistoryEntry) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }
}

impl ChatModel for LlmClient {
    fn model_id(&self) -> &str {
        self.model.id()
    }

    async fn chat(&self, messages: Vec<ChatMessage>, json_mode: bool) -> Result<LlmResponse> {
        let response_format = if json_mode {
            Some(ResponseFormat {
                format_type: "json_object".to_string(),
            })
        } else {
            None
        };

        let request = ChatRequest {
            model: self.model.id(),
            messages: &messages,
            max_tokens: self.model.max_tokens(),
            stream: false,
            response_format,
            usage: UsageRequest { include: true },
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("X-Title", "pii-redact")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let error_msg = match status.as_u16() {
                401 => "Invalid API key. Check OPENROUTER_API_KEY.".to_string(),
                429 => "Rate limited by the model provider. Try again in a few minutes.".to_string(),
                500..=599 => format!(
                    "Model provider error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!("API error {}: {}", status, truncate_str(&text, 200)),
            };
            return Err(anyhow!("{}", error_msg));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            anyhow!(
                "Failed to parse model response: {}\n{}",
                e,
                truncate_str(&text, 500)
            )
        })?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(anyhow!("API returned empty response"));
        }

        let model = parsed.model.unwrap_or_else(|| self.model.id().to_string());
        debug!(
            model = %model,
            cost = parsed.usage.as_ref().map(Usage::cost).unwrap_or(0.0),
            "LLM call complete"
        );

        self.record(HistoryEntry {
            timestamp: Utc::now(),
            model: model.clone(),
            messages,
            response: content.clone(),
            usage: parsed.usage.clone(),
        });

        Ok(LlmResponse {
            content,
            usage: parsed.usage,
            model,
        })
    }

    fn total_cost(&self) -> f64 {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|entry| entry.usage.as_ref())
            .map(Usage::cost)
            .sum()
    }
}

/// Render the last `n` exchanges for humans.
pub fn format_history(entries: &[HistoryEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&format!(
            "[{}] {}\n",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.model
        ));
        for message in &entry.messages {
            out.push_str(&format!(
                "\n{}:\n{}\n",
                message.role.as_str().to_uppercase(),
                message.content
            ));
        }
        out.push_str(&format!("\nRESPONSE:\n{}\n", entry.response));
        if let Some(usage) = &entry.usage {
            out.push_str(&format!(
                "\n(tokens: {} prompt + {} completion, cost ${:.4})\n",
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.cost()
            ));
        }
    }
    out
}

/// Truncate a string for display (Unicode-safe)
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    if s.chars().count() <= max_chars {
        s
    } else {
        let byte_idx = s
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        &s[..byte_idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_openai_shape() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "m",
            messages: &messages,
            max_tokens: 10,
            stream: false,
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_string(),
            }),
            usage: UsageRequest { include: true },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hi");
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["usage"]["include"], true);
    }

    #[test]
    fn test_response_with_null_content_parses() {
        let json = r#"{"choices":[{"message":{"content":null}}],"usage":null}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }

    #[test]
    fn test_history_cost_and_window() {
        let client = LlmClient::new("sk-test", ModelSpec::default());
        for cost in [Some(0.01), None, Some(0.02)] {
            client.record(HistoryEntry {
                timestamp: Utc::now(),
                model: "m".to_string(),
                messages: vec![ChatMessage::user("q")],
                response: "a".to_string(),
                usage: Some(Usage {
                    cost,
                    ..Usage::default()
                }),
            });
        }
        assert_eq!(client.call_count(), 3);
        assert!((client.total_cost() - 0.03).abs() < 1e-12);
        assert_eq!(client.last_calls(2).len(), 2);
        assert_eq!(client.last_calls(10).len(), 3);
    }

    #[test]
    fn test_format_history_lists_roles_and_response() {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            model: "m".to_string(),
            messages: vec![ChatMessage::system("rules"), ChatMessage::user("text")],
            response: "{\"redacted_text\": \"x\"}".to_string(),
            usage: None,
        };
        let rendered = format_history(&[entry]);
        assert!(rendered.contains("SYSTEM:\nrules"));
        assert!(rendered.contains("USER:\ntext"));
        assert!(rendered.contains("RESPONSE:\n{\"redacted_text\": \"x\"}"));
    }

    #[test]
    fn test_truncate_str_unicode() {
        assert_eq!(truncate_str("héllo", 2), "hé");
        assert_eq!(truncate_str("hi", 10), "hi");
    }
}
