//! JSON Lines dataset loader and lane layouts.
//!
//! One learner sequence per line:
//!
//! ```text
//! {"uid": "u1", "concepts": [3, 4, 3], "responses": [1, 1, 0],
//!  "questions": [10, 10, 11], "is_repeat": [0, 1, 0]}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{FieldSet, ForgetFeatures, Interaction, Lane, Sequence, Target};
use crate::stepper::{chunk_bounds, warmup_len};

#[derive(Debug, Deserialize)]
struct RawSequence {
    uid: String,
    concepts: Vec<i64>,
    responses: Vec<i64>,
    #[serde(default)]
    questions: Option<Vec<i64>>,
    #[serde(default)]
    timestamps: Option<Vec<i64>>,
    #[serde(default)]
    is_repeat: Option<Vec<u8>>,
    #[serde(default)]
    forget: Option<RawForget>,
}

#[derive(Debug, Deserialize)]
struct RawForget {
    repeat_gaps: Vec<i64>,
    sequence_gaps: Vec<i64>,
    past_counts: Vec<i64>,
    #[serde(default)]
    interval_times: Option<Vec<i64>>,
    #[serde(default)]
    time_labels: Option<Vec<i64>>,
    #[serde(default)]
    prev_time_labels: Option<Vec<i64>>,
}

/// A loaded dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub sequences: Vec<Sequence>,
    /// Responses of `-1` read as `0`.
    pub coerced_responses: usize,
}

/// Counts describing a dataset, carried into reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub name: String,
    pub sequences: usize,
    pub interactions: usize,
    pub groups: usize,
    pub fields: FieldSet,
}

fn check_len(name: &str, len: usize, expected: usize) -> Result<()> {
    if len != expected {
        bail!("`{name}` has {len} entries, expected {expected} (one per concept)");
    }
    Ok(())
}

fn optional<T: Copy>(values: &Option<Vec<T>>, i: usize) -> Option<T> {
    values.as_ref().map(|v| v[i])
}

fn convert(raw: RawSequence, coerced: &mut usize) -> Result<Sequence> {
    let n = raw.concepts.len();
    check_len("responses", raw.responses.len(), n)?;
    for (name, values) in [("questions", &raw.questions), ("timestamps", &raw.timestamps)] {
        if let Some(v) = values {
            check_len(name, v.len(), n)?;
        }
    }
    if let Some(v) = &raw.is_repeat {
        check_len("is_repeat", v.len(), n)?;
    }
    if let Some(f) = &raw.forget {
        check_len("forget.repeat_gaps", f.repeat_gaps.len(), n)?;
        check_len("forget.sequence_gaps", f.sequence_gaps.len(), n)?;
        check_len("forget.past_counts", f.past_counts.len(), n)?;
        for (name, values) in [
            ("forget.interval_times", &f.interval_times),
            ("forget.time_labels", &f.time_labels),
            ("forget.prev_time_labels", &f.prev_time_labels),
        ] {
            if let Some(v) = values {
                check_len(name, v.len(), n)?;
            }
        }
    }

    let mut interactions = Vec::with_capacity(n);
    for i in 0..n {
        let response = match raw.responses[i] {
            -1 => {
                *coerced += 1;
                0
            }
            r @ (0 | 1) => r as u8,
            other => bail!("response {other} at position {i} is not 0, 1 or -1"),
        };
        let forget = raw.forget.as_ref().map(|f| ForgetFeatures {
            repeat_gap: f.repeat_gaps[i],
            sequence_gap: f.sequence_gaps[i],
            past_count: f.past_counts[i],
            interval_time: optional(&f.interval_times, i),
            time_label: optional(&f.time_labels, i),
            prev_time_label: optional(&f.prev_time_labels, i),
        });
        interactions.push(Interaction {
            concept: raw.concepts[i],
            question: optional(&raw.questions, i),
            timestamp: optional(&raw.timestamps, i),
            response,
            is_repeat: optional(&raw.is_repeat, i).is_some_and(|f| f != 0),
            forget,
        });
    }

    Ok(Sequence {
        id: raw.uid,
        interactions,
    })
}

/// Parse a dataset from a string (useful for testing).
pub fn parse_dataset_str(content: &str, name: &str) -> Result<Dataset> {
    let mut sequences = Vec::new();
    let mut coerced = 0;
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let raw: RawSequence = serde_json::from_str(line)
            .with_context(|| format!("{name}: line {} is not a valid sequence record", idx + 1))?;
        let seq = convert(raw, &mut coerced)
            .with_context(|| format!("{name}: line {}", idx + 1))?;
        sequences.push(seq);
    }
    Ok(Dataset {
        name: name.to_string(),
        sequences,
        coerced_responses: coerced,
    })
}

/// Load a JSON Lines dataset from disk.
pub fn load_dataset(path: &Path) -> Result<Dataset> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read dataset: {}", path.display()))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    parse_dataset_str(&content, &name)
}

impl Dataset {
    /// Auxiliary fields carried by every interaction of every sequence.
    pub fn fields(&self) -> FieldSet {
        let mut fields: Option<FieldSet> = None;
        for it in self.sequences.iter().flat_map(|s| &s.interactions) {
            let own = FieldSet::of(it);
            fields = Some(match fields {
                Some(acc) => acc.intersect(&own),
                None => own,
            });
        }
        fields.unwrap_or_default()
    }

    pub fn interaction_count(&self) -> usize {
        self.sequences.iter().map(|s| s.interactions.len()).sum()
    }

    pub fn group_count(&self) -> usize {
        self.sequences.iter().map(Sequence::group_count).sum()
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            name: self.name.clone(),
            sequences: self.sequences.len(),
            interactions: self.interaction_count(),
            groups: self.group_count(),
            fields: self.fields(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lane layouts
// ---------------------------------------------------------------------------

/// How sequences are cut into lanes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaneLayout {
    /// Windows of at most `max_len` rows, every row but the first scored.
    Question { max_len: usize },
    /// One lane per sequence; a warm-up prefix of groups is context only.
    Split { train_ratio: f64 },
}

impl std::fmt::Display for LaneLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaneLayout::Question { max_len } => write!(f, "question (max_len {max_len})"),
            LaneLayout::Split { train_ratio } => write!(f, "split (train_ratio {train_ratio})"),
        }
    }
}

/// Global group id and remaining-row count for every row of every sequence.
fn annotate(sequences: &[Sequence]) -> Vec<Vec<(i64, u32)>> {
    let mut next_group = 0i64;
    sequences
        .iter()
        .map(|seq| {
            let flags: Vec<bool> = seq.interactions.iter().map(|i| i.is_repeat).collect();
            let mut rows = Vec::with_capacity(flags.len());
            for chunk in chunk_bounds(&flags) {
                let end = chunk.end;
                for i in chunk {
                    rows.push((next_group, (end - i - 1) as u32));
                }
                next_group += 1;
            }
            rows
        })
        .collect()
}

fn lane(row: usize, seq: &Sequence, ann: &[(i64, u32)], range: std::ops::Range<usize>, selected_from: usize) -> Lane {
    let targets = range
        .clone()
        .map(|i| Target {
            group: ann[i].0,
            rest: ann[i].1,
            row: row as i64,
            selected: i >= selected_from,
        })
        .collect();
    Lane {
        row: row as i64,
        sequence_id: seq.id.clone(),
        interactions: seq.interactions[range].to_vec(),
        targets,
    }
}

impl Dataset {
    pub fn lanes(&self, layout: LaneLayout) -> Vec<Lane> {
        match layout {
            LaneLayout::Question { max_len } => self.question_lanes(max_len),
            LaneLayout::Split { train_ratio } => self.split_lanes(train_ratio),
        }
    }

    /// Windowed layout. Each window after the first starts with the
    /// previous window's last row as an unselected seed.
    pub fn question_lanes(&self, max_len: usize) -> Vec<Lane> {
        let max_len = max_len.max(2);
        let annotations = annotate(&self.sequences);
        let mut lanes = Vec::new();
        for (row, (seq, ann)) in self.sequences.iter().zip(&annotations).enumerate() {
            let n = seq.interactions.len();
            if n == 0 {
                continue;
            }
            let mut start = 0;
            loop {
                let end = (start + max_len).min(n);
                lanes.push(lane(row, seq, ann, start..end, start + 1));
                if end == n {
                    break;
                }
                start = end - 1;
            }
        }
        lanes
    }

    /// Train/predict split layout, one lane per sequence.
    pub fn split_lanes(&self, train_ratio: f64) -> Vec<Lane> {
        let annotations = annotate(&self.sequences);
        self.sequences
            .iter()
            .zip(&annotations)
            .enumerate()
            .filter(|(_, (seq, _))| !seq.interactions.is_empty())
            .map(|(row, (seq, ann))| {
                let flags: Vec<bool> = seq.interactions.iter().map(|i| i.is_repeat).collect();
                let warmup = warmup_len(&flags, train_ratio);
                lane(row, seq, ann, 0..seq.interactions.len(), warmup)
            })
            .collect()
    }
}

/// Minibatches of at most `lanes_per_batch` lanes, in lane order.
pub fn batches(lanes: Vec<Lane>, lanes_per_batch: usize) -> Vec<Vec<Lane>> {
    let size = lanes_per_batch.max(1);
    let mut out = Vec::with_capacity(lanes.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for lane in lanes {
        current.push(lane);
        if current.len() == size {
            out.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A warning from dataset validation.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    /// The sequence id (if applicable).
    pub sequence_id: Option<String>,
    /// Warning message.
    pub message: String,
}

/// Validate a dataset for common issues.
pub fn validate_dataset(dataset: &Dataset) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if dataset.sequences.is_empty() {
        warnings.push(ValidationWarning {
            sequence_id: None,
            message: "dataset contains no sequences".into(),
        });
    }

    if dataset.coerced_responses > 0 {
        warnings.push(ValidationWarning {
            sequence_id: None,
            message: format!("{} responses of -1 were read as 0", dataset.coerced_responses),
        });
    }

    let mut seen = HashSet::new();
    for seq in &dataset.sequences {
        let id = Some(seq.id.clone());
        if !seen.insert(&seq.id) {
            warnings.push(ValidationWarning {
                sequence_id: id.clone(),
                message: format!("duplicate sequence id: {}", seq.id),
            });
        }
        if seq.interactions.len() < 2 {
            warnings.push(ValidationWarning {
                sequence_id: id.clone(),
                message: "fewer than 2 interactions, nothing to predict in the question layout"
                    .into(),
            });
        }
        if seq.interactions.first().is_some_and(|i| i.is_repeat) {
            warnings.push(ValidationWarning {
                sequence_id: id.clone(),
                message: "first interaction is flagged as a repeat; it opens a new group".into(),
            });
        }
        let flags: Vec<bool> = seq.interactions.iter().map(|i| i.is_repeat).collect();
        for chunk in chunk_bounds(&flags) {
            let rows = &seq.interactions[chunk.clone()];
            if rows.iter().any(|r| r.response != rows[0].response) {
                warnings.push(ValidationWarning {
                    sequence_id: id.clone(),
                    message: format!(
                        "rows {}..{} share a question but disagree on the response",
                        chunk.start, chunk.end
                    ),
                });
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# two learners
{"uid": "u1", "concepts": [1, 2, 3, 4, 5, 6], "responses": [1, 1, 0, 1, 1, 1], "questions": [10, 10, 11, 12, 12, 12], "is_repeat": [0, 1, 0, 0, 1, 1], "timestamps": [100, 100, 160, 220, 220, 220]}

{"uid": "u2", "concepts": [7, 8], "responses": [-1, 1]}
"#;

    #[test]
    fn parse_sample() {
        let ds = parse_dataset_str(SAMPLE, "sample").unwrap();
        assert_eq!(ds.sequences.len(), 2);
        assert_eq!(ds.coerced_responses, 1);
        assert_eq!(ds.sequences[1].interactions[0].response, 0);
        assert!(ds.sequences[0].interactions[1].is_repeat);
        assert_eq!(ds.group_count(), 3 + 2);
        // u2 has no questions, so only the intersection survives
        assert_eq!(ds.fields(), FieldSet::default());
    }

    #[test]
    fn length_mismatch_names_the_line() {
        let bad = r#"{"uid": "u1", "concepts": [1, 2], "responses": [1]}"#;
        let err = parse_dataset_str(bad, "bad").unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("line 1"));
        assert!(msg.contains("responses"));
    }

    #[test]
    fn rejects_non_binary_response() {
        let bad = r#"{"uid": "u1", "concepts": [1], "responses": [2]}"#;
        assert!(parse_dataset_str(bad, "bad").is_err());
    }

    #[test]
    fn question_lanes_assign_global_groups() {
        let ds = parse_dataset_str(SAMPLE, "sample").unwrap();
        let lanes = ds.question_lanes(200);
        assert_eq!(lanes.len(), 2);
        let t: Vec<(i64, u32, bool)> = lanes[0]
            .targets
            .iter()
            .map(|t| (t.group, t.rest, t.selected))
            .collect();
        assert_eq!(
            t,
            vec![
                (0, 1, false),
                (0, 0, true),
                (1, 0, true),
                (2, 2, true),
                (2, 1, true),
                (2, 0, true)
            ]
        );
        assert_eq!(lanes[1].targets[0].group, 3);
        assert_eq!(lanes[1].targets[1].group, 4);
    }

    #[test]
    fn windows_select_every_row_once() {
        let ds = parse_dataset_str(SAMPLE, "sample").unwrap();
        let lanes = ds.question_lanes(3);
        let u1: Vec<&Lane> = lanes.iter().filter(|l| l.sequence_id == "u1").collect();
        // rows 0..3, 2..5, 4..6
        assert_eq!(u1.len(), 3);
        assert_eq!(u1[1].interactions[0].concept, 3);
        assert!(!u1[1].targets[0].selected);
        let selected: usize = u1.iter().map(|l| l.selected_count()).sum();
        assert_eq!(selected, 5);
    }

    #[test]
    fn split_lanes_warm_up_on_groups() {
        let ds = parse_dataset_str(SAMPLE, "sample").unwrap();
        let lanes = ds.split_lanes(0.5);
        // u1 has 3 groups -> floor(1.5) = 1 warm-up group (rows 0..2)
        assert_eq!(lanes[0].warmup(), 2);
        // u2 has 2 single-row groups -> 1 warm-up group
        assert_eq!(lanes[1].warmup(), 1);
    }

    #[test]
    fn batches_keep_lane_order() {
        let ds = parse_dataset_str(SAMPLE, "sample").unwrap();
        let lanes = ds.question_lanes(2);
        let total = lanes.len();
        let b = batches(lanes, 2);
        assert_eq!(b.iter().map(Vec::len).sum::<usize>(), total);
        assert!(b.iter().all(|batch| batch.len() <= 2));
        assert_eq!(b[0][0].sequence_id, "u1");
    }

    #[test]
    fn validation_warnings() {
        let content = r#"
{"uid": "a", "concepts": [1], "responses": [1], "is_repeat": [1]}
{"uid": "a", "concepts": [1, 2], "responses": [1, 0], "is_repeat": [0, 1]}
"#;
        let ds = parse_dataset_str(content, "v").unwrap();
        let warnings = validate_dataset(&ds);
        assert!(warnings.iter().any(|w| w.message.contains("duplicate")));
        assert!(warnings.iter().any(|w| w.message.contains("fewer than 2")));
        assert!(warnings.iter().any(|w| w.message.contains("repeat")));
        assert!(warnings.iter().any(|w| w.message.contains("disagree")));

        let empty = parse_dataset_str("", "empty").unwrap();
        assert!(validate_dataset(&empty)
            .iter()
            .any(|w| w.message.contains("no sequences")));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learners.jsonl");
        std::fs::write(&path, SAMPLE).unwrap();
        let ds = load_dataset(&path).unwrap();
        assert_eq!(ds.name, "learners");
        assert_eq!(ds.summary().interactions, 8);
    }
}
