//! Few-shot demonstration bank
//!
//! Curated rows from the source dataset shown to the model as in-context
//! demonstrations. Their row ids are excluded from every scored split.

use crate::dataset::Example;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::OnceLock;

const BANK_JSON: &str = include_str!("../assets/fewshot.json");

#[derive(Debug, Deserialize)]
struct FewShotBank {
    excluded_row_ids: Vec<String>,
    demos: Vec<Example>,
}

struct LoadedBank {
    excluded: HashSet<String>,
    demos: Vec<Example>,
}

fn bank() -> &'static LoadedBank {
    static BANK: OnceLock<LoadedBank> = OnceLock::new();
    BANK.get_or_init(|| {
        let parsed: FewShotBank =
            serde_json::from_str(BANK_JSON).expect("embedded few-shot bank is valid JSON");
        LoadedBank {
            excluded: parsed.excluded_row_ids.into_iter().collect(),
            demos: parsed.demos,
        }
    })
}

/// The demonstration examples, in presentation order.
pub fn demos() -> &'static [Example] {
    &bank().demos
}

/// Dataset row ids that back the demonstrations.
pub fn excluded_row_ids() -> &'static HashSet<String> {
    &bank().excluded
}
