use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kteval_core::fusion::{late_all, late_mean, late_vote};
use kteval_core::metrics::{roc_auc, score};

/// Deterministic pseudo-random sample: labels alternate in blocks,
/// scores follow a simple LCG.
fn sample(n: usize) -> (Vec<u8>, Vec<f64>) {
    let mut state: u64 = 42;
    let mut labels = Vec::with_capacity(n);
    let mut scores = Vec::with_capacity(n);
    for i in 0..n {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let noise = (state >> 11) as f64 / (1u64 << 53) as f64;
        let label = u8::from(i % 3 != 0);
        labels.push(label);
        scores.push((noise + f64::from(label) * 0.3).min(1.0));
    }
    (labels, scores)
}

fn bench_auc(c: &mut Criterion) {
    let mut group = c.benchmark_group("roc_auc");
    for n in [1_000usize, 100_000] {
        let (labels, scores) = sample(n);
        group.bench_function(format!("n={n}"), |b| {
            b.iter(|| roc_auc(black_box(&labels), black_box(&scores)))
        });
    }
    group.finish();
}

fn bench_score(c: &mut Criterion) {
    let (labels, scores) = sample(10_000);
    c.bench_function("score n=10000", |b| {
        b.iter(|| score(black_box(&labels), black_box(&scores)))
    });
}

fn bench_late_fusion(c: &mut Criterion) {
    let preds = [0.91, 0.42, 0.55, 0.73, 0.08];
    c.bench_function("late fusion 5 rows", |b| {
        b.iter(|| {
            (
                late_mean(black_box(&preds)),
                late_vote(black_box(&preds)),
                late_all(black_box(&preds)),
            )
        })
    });
}

criterion_group!(benches, bench_auc, bench_score, bench_late_fusion);
criterion_main!(benches);
