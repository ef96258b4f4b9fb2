//! pii-redact library crate
//!
//! LLM-backed PII redaction, label-aware scoring, dataset windowing, and the
//! optimization and evaluation drivers behind the `pii-redact` binary.

pub mod config;
pub mod dataset;
pub mod evaluate;
pub mod fewshot;
pub mod keyring;
pub mod labels;
pub mod llm;
pub mod optimize;
pub mod redactor;
pub mod scoring;
pub mod util;
