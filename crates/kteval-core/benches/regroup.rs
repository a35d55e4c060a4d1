use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use kteval_core::dataset::{batches, parse_dataset_str};
use kteval_core::fusion::fuse;
use kteval_core::regroup::{regroup, CarryForward, LaneFrame};
use kteval_core::stepper::StepRecord;

/// 200 learners of 300 interactions, every third row continuing a question.
fn dataset_jsonl() -> String {
    let mut out = String::new();
    for u in 0..200 {
        let n = 300;
        let concepts: Vec<String> = (0..n).map(|i| ((i * 7 + u) % 50).to_string()).collect();
        let repeat: Vec<&str> = (0..n).map(|i| if i % 3 == 2 { "1" } else { "0" }).collect();
        let responses: Vec<String> = (0..n)
            .map(|i| {
                let first = if i % 3 == 2 { i - 1 } else { i };
                ((first + u) % 2).to_string()
            })
            .collect();
        out.push_str(&format!(
            "{{\"uid\": \"u{u}\", \"concepts\": [{}], \"responses\": [{}], \"is_repeat\": [{}]}}\n",
            concepts.join(","),
            responses.join(","),
            repeat.join(",")
        ));
    }
    out
}

fn frames() -> Vec<Vec<LaneFrame>> {
    let ds = parse_dataset_str(&dataset_jsonl(), "bench").expect("valid bench data");
    batches(ds.question_lanes(64), 32)
        .into_iter()
        .map(|batch| {
            batch
                .iter()
                .map(|lane| {
                    let records = lane
                        .targets
                        .iter()
                        .enumerate()
                        .filter(|(_, t)| t.selected)
                        .map(|(pos, t)| StepRecord {
                            position: pos,
                            group: t.group,
                            truth: lane.interactions[pos].response,
                            probability: 0.6,
                            label: 1,
                            representation: None,
                            history: None,
                        })
                        .collect();
                    LaneFrame::build(lane, records).expect("records cover every selected row")
                })
                .collect()
        })
        .collect()
}

fn bench_regroup(c: &mut Criterion) {
    let input = frames();
    c.bench_function("regroup+fuse 200x300", |b| {
        b.iter_batched(
            || input.clone(),
            |batches| {
                let mut carry = CarryForward::new();
                let mut groups = 0;
                for frames in batches {
                    let (emission, next) = regroup(carry, frames);
                    carry = next;
                    groups += fuse(black_box(&emission.rows), None).map(|g| g.len()).unwrap_or(0);
                }
                groups
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_regroup);
criterion_main!(benches);
