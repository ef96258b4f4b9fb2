//! Runtime settings
//!
//! Everything is read from environment variables once at startup. Unset or
//! empty variables take the defaults below; unparseable numbers fall back to
//! the default with a warning.

use crate::dataset::{ShortfallPolicy, DATASET_CACHE_PATH};
use crate::llm::client::OPENROUTER_URL;
use crate::llm::DEFAULT_MODEL;
use crate::util::parse_flag;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

pub const OPTIMIZED_CONFIG_PATH: &str = "optimized_model/pii_redactor.json";
pub const LOG_DIR: &str = "logs";

pub const DEFAULT_TRAIN_SIZE: usize = 450;
pub const DEFAULT_VAL_SIZE: usize = 50;
pub const DEFAULT_EVAL_SIZE: usize = 500;
pub const DEFAULT_OPTIMIZE_ROUNDS: usize = 4;
pub const DEFAULT_EVAL_THREADS: usize = 20;
pub const DEFAULT_DATASET_MAX_ROWS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    /// Separate model used to critique failures during optimization
    pub reflection_model: Option<String>,
    pub optimize_train_size: usize,
    pub optimize_val_size: usize,
    pub optimize_rounds: usize,
    pub evaluate_size: usize,
    pub evaluate_offset: usize,
    pub evaluate_seed: Option<u64>,
    pub evaluate_threads: usize,
    /// Fail instead of capping when the random pool is too small
    pub strict_sample: bool,
    pub dataset_max_rows: usize,
    pub generate_logs: bool,
    pub optimized_config_path: PathBuf,
    pub dataset_cache_path: PathBuf,
    pub log_dir: PathBuf,
}

fn parse_or<T: FromStr>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Ignoring {}={:?}: not a valid number", name, value);
                default
            }
        },
        None => default,
    }
}

impl Settings {
    /// Resolve settings from the process environment, then the keychain for
    /// the API key.
    pub fn from_env() -> Self {
        let mut settings = Self::from_lookup(|name| std::env::var(name).ok());
        if settings.api_key.is_none() {
            settings.api_key = crate::keyring::get_api_key();
        }
        settings
    }

    /// Resolve settings from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let optimize_train_size = parse_or(
            "OPTIMIZE_TRAIN_SIZE",
            var("OPTIMIZE_TRAIN_SIZE"),
            DEFAULT_TRAIN_SIZE,
        );
        let optimize_val_size =
            parse_or("OPTIMIZE_VAL_SIZE", var("OPTIMIZE_VAL_SIZE"), DEFAULT_VAL_SIZE);
        let evaluate_seed = var("EVALUATE_SEED").and_then(|raw| match raw.trim().parse::<u64>() {
            Ok(seed) => Some(seed),
            Err(_) => {
                warn!("Ignoring EVALUATE_SEED={:?}: not a valid integer", raw);
                None
            }
        });

        Self {
            api_key: var("OPENROUTER_API_KEY"),
            endpoint: var("LLM_BASE_URL").unwrap_or_else(|| OPENROUTER_URL.to_string()),
            model: var("PII_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            reflection_model: var("PII_REFLECTION_MODEL"),
            optimize_train_size,
            optimize_val_size,
            optimize_rounds: parse_or(
                "OPTIMIZE_ROUNDS",
                var("OPTIMIZE_ROUNDS"),
                DEFAULT_OPTIMIZE_ROUNDS,
            ),
            evaluate_size: parse_or("EVALUATE_SIZE", var("EVALUATE_SIZE"), DEFAULT_EVAL_SIZE),
            evaluate_offset: parse_or(
                "EVALUATE_OFFSET",
                var("EVALUATE_OFFSET"),
                optimize_train_size.saturating_add(optimize_val_size),
            ),
            evaluate_seed,
            evaluate_threads: parse_or(
                "EVALUATE_THREADS",
                var("EVALUATE_THREADS"),
                DEFAULT_EVAL_THREADS,
            )
            .max(1),
            strict_sample: var("EVALUATE_STRICT_SAMPLE")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            dataset_max_rows: parse_or(
                "DATASET_MAX_ROWS",
                var("DATASET_MAX_ROWS"),
                DEFAULT_DATASET_MAX_ROWS,
            ),
            generate_logs: var("GENERATE_LOGS")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            optimized_config_path: PathBuf::from(OPTIMIZED_CONFIG_PATH),
            dataset_cache_path: PathBuf::from(DATASET_CACHE_PATH),
            log_dir: PathBuf::from(LOG_DIR),
        }
    }

    pub fn require_api_key(&self) -> anyhow::Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No API key configured. Set OPENROUTER_API_KEY or store one in the system keychain (service 'pii-redact')."
            )
        })
    }

    /// First row index past the optimization window.
    pub fn optimization_end(&self) -> usize {
        self.optimize_train_size
            .saturating_add(self.optimize_val_size)
    }

    pub fn shortfall_policy(&self) -> ShortfallPolicy {
        if self.strict_sample {
            ShortfallPolicy::Reject
        } else {
            ShortfallPolicy::Cap
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
