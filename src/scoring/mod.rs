//! Redaction scoring
//!
//! Compares a gold redacted string with a predicted one. Three strategies are
//! kept side by side so older reports stay reproducible:
//!
//! - [`ScoringPolicy::ExactMatch`]: trimmed string equality, 0 or 1.
//! - [`ScoringPolicy::LabelF1`]: F1 over the multisets of `[LABEL]` tokens.
//! - [`ScoringPolicy::Hybrid`]: detection recall weighted over label
//!   accuracy. Missing a span is a leak; redacting too much is tolerated.
//!
//! Every function here is total: empty inputs and zero denominators map to a
//! fixed value instead of an error.

use crate::labels::{extract_labels, label_counts};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Weight of detection recall in the hybrid score.
pub const DETECTION_WEIGHT: f64 = 0.75;
/// Weight of classification accuracy in the hybrid score.
pub const CLASSIFICATION_WEIGHT: f64 = 0.25;

/// Selectable scoring strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoringPolicy {
    ExactMatch,
    LabelF1,
    #[default]
    Hybrid,
}

impl ScoringPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringPolicy::ExactMatch => "exact",
            ScoringPolicy::LabelF1 => "label-f1",
            ScoringPolicy::Hybrid => "hybrid",
        }
    }

    pub fn parse(name: &str) -> Option<ScoringPolicy> {
        match name.trim().to_ascii_lowercase().as_str() {
            "exact" | "exact-match" => Some(ScoringPolicy::ExactMatch),
            "label-f1" | "f1" => Some(ScoringPolicy::LabelF1),
            "hybrid" => Some(ScoringPolicy::Hybrid),
            _ => None,
        }
    }
}

/// Scalar reward plus the explanation handed to humans and the optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreResult {
    pub score: f64,
    pub feedback: String,
}

/// Precision/recall/F1 over label tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelF1 {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

/// Detection/classification breakdown of the hybrid policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridScore {
    pub detection_recall: f64,
    pub classification_accuracy: f64,
    pub score: f64,
    /// Items whose label matched gold exactly.
    pub correct: usize,
    pub detected: usize,
    pub total_gold: usize,
    pub total_pred: usize,
}

impl HybridScore {
    pub fn missed(&self) -> usize {
        self.total_gold - self.detected
    }

    pub fn mislabeled(&self) -> usize {
        self.detected - self.correct
    }

    pub fn over_redacted(&self) -> usize {
        self.total_pred.saturating_sub(self.total_gold)
    }
}

fn normalized(text: &str) -> &str {
    text.trim()
}

pub fn exact_match(gold: &str, predicted: &str) -> bool {
    normalized(gold) == normalized(predicted)
}

/// Size of the multiset intersection.
fn intersection_size(a: &HashMap<String, usize>, b: &HashMap<String, usize>) -> usize {
    a.iter()
        .map(|(label, count)| (*count).min(b.get(label).copied().unwrap_or(0)))
        .sum()
}

/// `a - b` as a multiset, sorted for stable output.
fn residual(a: &HashMap<String, usize>, b: &HashMap<String, usize>) -> Vec<String> {
    let mut out = Vec::new();
    for (label, count) in a {
        let left = count.saturating_sub(b.get(label).copied().unwrap_or(0));
        out.extend(std::iter::repeat_n(label.clone(), left));
    }
    out.sort();
    out
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

pub fn label_f1(gold: &str, predicted: &str) -> LabelF1 {
    let gold_labels = extract_labels(gold);
    let pred_labels = extract_labels(predicted);

    if gold_labels.is_empty() && pred_labels.is_empty() {
        return LabelF1 {
            precision: 1.0,
            recall: 1.0,
            f1: 1.0,
            true_positives: 0,
            false_positives: 0,
            false_negatives: 0,
        };
    }

    let gold_counts = label_counts(&gold_labels);
    let pred_counts = label_counts(&pred_labels);
    let tp = intersection_size(&gold_counts, &pred_counts);
    let fp = pred_labels.len() - tp;
    let fn_ = gold_labels.len() - tp;

    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };

    LabelF1 {
        precision,
        recall,
        f1,
        true_positives: tp,
        false_positives: fp,
        false_negatives: fn_,
    }
}

pub fn hybrid_score(gold: &str, predicted: &str) -> HybridScore {
    let gold_labels = extract_labels(gold);
    let pred_labels = extract_labels(predicted);
    let total_gold = gold_labels.len();
    let total_pred = pred_labels.len();

    let gold_counts = label_counts(&gold_labels);
    let pred_counts = label_counts(&pred_labels);
    let correct = intersection_size(&gold_counts, &pred_counts);
    let detected = total_gold.min(total_pred);

    // nothing to find: redacting extra text is free
    let (detection_recall, classification_accuracy) = if total_gold == 0 {
        (1.0, 1.0)
    } else {
        (ratio(detected, total_gold), ratio(correct, detected))
    };

    HybridScore {
        detection_recall,
        classification_accuracy,
        score: DETECTION_WEIGHT * detection_recall + CLASSIFICATION_WEIGHT * classification_accuracy,
        correct,
        detected,
        total_gold,
        total_pred,
    }
}

fn normalize_answer_tokens(text: &str) -> Vec<String> {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect();
    lowered
        .split_whitespace()
        .filter(|t| !matches!(*t, "a" | "an" | "the"))
        .map(str::to_string)
        .collect()
}

/// Whole-string token F1, reported for reference only.
pub fn token_f1(gold: &str, predicted: &str) -> f64 {
    let gold_tokens = normalize_answer_tokens(gold);
    let pred_tokens = normalize_answer_tokens(predicted);
    if gold_tokens.is_empty() && pred_tokens.is_empty() {
        return 1.0;
    }
    if gold_tokens.is_empty() || pred_tokens.is_empty() {
        return 0.0;
    }
    let common = intersection_size(&label_counts(&gold_tokens), &label_counts(&pred_tokens));
    if common == 0 {
        return 0.0;
    }
    let precision = common as f64 / pred_tokens.len() as f64;
    let recall = common as f64 / gold_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

const CORRECT_FEEDBACK: &str = "Correct. The redacted text matches exactly.";

fn push_diff_tail(out: &mut String, gold: &str, predicted: &str) {
    let _ = write!(
        out,
        "Full-text token F1={:.2} (reference only)\n\nExpected:\n{}\n\nGot:\n{}",
        token_f1(gold, predicted),
        gold,
        predicted
    );
}

fn label_list(labels: &[String]) -> String {
    if labels.is_empty() {
        "none".to_string()
    } else {
        labels.join(", ")
    }
}

/// Score one pair under `policy`.
pub fn score(policy: ScoringPolicy, gold: &str, predicted: &str) -> ScoreResult {
    if exact_match(gold, predicted) {
        return ScoreResult {
            score: 1.0,
            feedback: CORRECT_FEEDBACK.to_string(),
        };
    }
    match policy {
        ScoringPolicy::ExactMatch => score_exact_mismatch(gold, predicted),
        ScoringPolicy::LabelF1 => score_label_f1(gold, predicted),
        ScoringPolicy::Hybrid => score_hybrid(gold, predicted),
    }
}

fn score_exact_mismatch(gold: &str, predicted: &str) -> ScoreResult {
    let mut feedback = String::from("Incorrect. The redacted text differs from the reference.\n");
    push_diff_tail(&mut feedback, gold, predicted);
    ScoreResult {
        score: 0.0,
        feedback,
    }
}

fn score_label_f1(gold: &str, predicted: &str) -> ScoreResult {
    let f1 = label_f1(gold, predicted);
    let gold_counts = label_counts(&extract_labels(gold));
    let pred_counts = label_counts(&extract_labels(predicted));

    let mut feedback = String::new();
    let _ = writeln!(
        feedback,
        "Label F1={:.2} (precision={:.2}, recall={:.2})",
        f1.f1, f1.precision, f1.recall
    );
    if f1.false_negatives > 0 {
        let _ = writeln!(
            feedback,
            "Missing labels: {}",
            label_list(&residual(&gold_counts, &pred_counts))
        );
    }
    if f1.false_positives > 0 {
        let _ = writeln!(
            feedback,
            "Unexpected labels: {}",
            label_list(&residual(&pred_counts, &gold_counts))
        );
    }
    push_diff_tail(&mut feedback, gold, predicted);
    ScoreResult {
        score: f1.f1,
        feedback,
    }
}

fn score_hybrid(gold: &str, predicted: &str) -> ScoreResult {
    let hybrid = hybrid_score(gold, predicted);
    let gold_counts = label_counts(&extract_labels(gold));
    let pred_counts = label_counts(&extract_labels(predicted));
    let missing = residual(&gold_counts, &pred_counts);
    let unexpected = residual(&pred_counts, &gold_counts);

    let mut feedback = String::new();
    let _ = writeln!(
        feedback,
        "Score={:.2} (detection_recall={:.2}, classification_acc={:.2})",
        hybrid.score, hybrid.detection_recall, hybrid.classification_accuracy
    );

    if hybrid.missed() > 0 {
        let _ = writeln!(
            feedback,
            "CRITICAL: {} of {} PII item(s) were left unredacted. Under-redaction leaks personal data. Missing labels: {}",
            hybrid.missed(),
            hybrid.total_gold,
            label_list(&missing)
        );
    }
    if hybrid.mislabeled() > 0 {
        let _ = writeln!(
            feedback,
            "Minor: {} detected item(s) used the wrong label. Missing labels: {}. Unexpected labels: {}",
            hybrid.mislabeled(),
            label_list(&missing),
            label_list(&unexpected)
        );
    }
    if hybrid.over_redacted() > 0 {
        let _ = writeln!(
            feedback,
            "Note: Over-redacted {} extra item(s) ({}). This is acceptable and not penalised.",
            hybrid.over_redacted(),
            label_list(&unexpected)
        );
    }
    if hybrid.missed() == 0 && hybrid.mislabeled() == 0 && hybrid.over_redacted() == 0 {
        feedback.push_str("Labels match; the difference is in the surrounding text.\n");
    }

    push_diff_tail(&mut feedback, gold, predicted);
    ScoreResult {
        score: hybrid.score,
        feedback,
    }
}
