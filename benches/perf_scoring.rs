use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pii_redact::dataset::eval_indices_randomized;
use pii_redact::dataset::ShortfallPolicy;
use pii_redact::scoring::{hybrid_score, score, ScoringPolicy};

const TAGS: [&str; 8] = [
    "GIVENNAME1",
    "LASTNAME1",
    "TEL",
    "EMAIL",
    "STREET",
    "CITY",
    "DATE",
    "PASSPORT",
];

fn synthetic_pairs(count: usize) -> Vec<(String, String)> {
    (0..count)
        .map(|i| {
            let mut gold = String::new();
            let mut pred = String::new();
            for j in 0..(4 + i % 9) {
                let tag = TAGS[(i + j) % TAGS.len()];
                gold.push_str(&format!("Some words about [{}] and more text. ", tag));
                match j % 5 {
                    0 => pred.push_str("Some words about the raw value and more text. "),
                    1 => pred.push_str(&format!("Some words about [{}] and more text. ", TAGS[(i + j + 1) % TAGS.len()])),
                    _ => pred.push_str(&format!("Some words about [{}] and more text. ", tag)),
                }
            }
            (gold, pred)
        })
        .collect()
}

fn bench_hybrid_metric(c: &mut Criterion) {
    let pairs = synthetic_pairs(500);
    c.bench_function("hybrid_score_500", |b| {
        b.iter(|| {
            for (gold, pred) in &pairs {
                black_box(hybrid_score(black_box(gold), black_box(pred)));
            }
        })
    });
    c.bench_function("hybrid_feedback_500", |b| {
        b.iter(|| {
            for (gold, pred) in &pairs {
                black_box(score(ScoringPolicy::Hybrid, black_box(gold), black_box(pred)));
            }
        })
    });
}

fn bench_random_window(c: &mut Criterion) {
    c.bench_function("eval_indices_randomized_10k", |b| {
        b.iter(|| {
            black_box(eval_indices_randomized(
                black_box(10_000),
                500,
                500,
                Some(42),
                ShortfallPolicy::Cap,
            ))
        })
    });
}

criterion_group!(perf_scoring, bench_hybrid_metric, bench_random_window);
criterion_main!(perf_scoring);
