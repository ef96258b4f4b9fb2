use serde::Deserialize;

/// Default hosted model for redaction.
pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-001";

/// Maximum completion tokens per call
const MODEL_MAX_TOKENS: u32 = 8192;

/// A hosted model plus the request knobs sent with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    id: String,
    max_tokens: u32,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            max_tokens: MODEL_MAX_TOKENS,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL)
    }
}

/// API usage information from OpenRouter
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Actual cost in USD as reported by the provider.
    /// OpenRouter returns this as `cost` (older responses: `total_cost`).
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

impl Usage {
    /// Reported cost, or 0.0 when the provider didn't send one.
    /// Costs are never estimated locally.
    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model() {
        let model = ModelSpec::default();
        assert!(model.id().contains("gemini"));
        assert_eq!(model.max_tokens(), MODEL_MAX_TOKENS);
        assert_eq!(ModelSpec::new("x").with_max_tokens(10).max_tokens(), 10);
    }

    #[test]
    fn test_usage_returns_actual_cost() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 1000,
            total_tokens: 2000,
            cost: Some(0.05),
        };
        assert_eq!(usage.cost(), 0.05);
    }

    #[test]
    fn test_usage_returns_zero_when_no_cost() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 1000,
            total_tokens: 2000,
            cost: None,
        };
        assert_eq!(usage.cost(), 0.0);
    }

    #[test]
    fn test_usage_deserialize_with_total_cost() {
        let json = r#"{"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150, "total_cost": 0.0025}"#;
        let usage: Usage = serde_json::from_str(json).unwrap();
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 50);
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(usage.cost(), 0.0025);
    }

    #[test]
    fn test_usage_deserialize_with_cost() {
        let json = r#"{"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15, "cost": 0.001}"#;
        let usage: Usage = serde_json::from_str(json).unwrap();
        assert_eq!(usage.cost(), 0.001);
    }
}
