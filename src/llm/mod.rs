pub mod client;
#[cfg(test)]
pub(crate) mod fake;
pub mod models;
pub mod parse;

pub use client::{format_history, ChatMessage, ChatModel, HistoryEntry, LlmClient, LlmResponse, Role};
pub use models::{ModelSpec, Usage, DEFAULT_MODEL};
pub use parse::parse_json_object;
