//! In-process chat model for tests.

use super::client::{ChatMessage, ChatModel, LlmResponse};
use super::models::Usage;
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Responder = dyn Fn(&[ChatMessage]) -> Result<String> + Send + Sync;

/// Answers every call through a closure and charges a fixed cost per call.
pub(crate) struct ScriptedModel {
    id: String,
    cost_per_call: f64,
    responder: Box<Responder>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub(crate) fn new<F>(id: &str, responder: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            cost_per_call: 0.0,
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_cost(mut self, cost_per_call: f64) -> Self {
        self.cost_per_call = cost_per_call;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

/// Content of the last user message in a request.
pub(crate) fn last_user(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == super::Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

impl ChatModel for ScriptedModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, messages: Vec<ChatMessage>, _json_mode: bool) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.clone());
        let content = (self.responder)(&messages)?;
        Ok(LlmResponse {
            content,
            usage: Some(Usage {
                cost: Some(self.cost_per_call),
                ..Usage::default()
            }),
            model: self.id.clone(),
        })
    }

    fn total_cost(&self) -> f64 {
        self.calls() as f64 * self.cost_per_call
    }
}
