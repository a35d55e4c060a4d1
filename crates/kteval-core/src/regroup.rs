//! Batch regrouping and the carry-forward buffer.
//!
//! Minibatch boundaries rarely line up with group boundaries: the last
//! lanes of a batch may hold the start of a group whose remaining rows
//! arrive in the next batch. Each batch's lanes are appended to the lanes
//! carried from before; everything up to and including the last *closed*
//! lane is emitted, the rest is carried again.

use std::collections::BTreeMap;

use crate::error::EvalError;
use crate::model::Lane;
use crate::stepper::StepRecord;
use crate::traits::Representation;

/// Group id of the marker row that opens every lane frame.
pub const SENTINEL_GROUP: i64 = -1;

/// One row of a lane frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRow {
    pub group: i64,
    pub rest: u32,
    pub row: i64,
    pub sequence_id: String,
    pub position: usize,
    pub selected: bool,
    pub concept: i64,
    pub question: Option<i64>,
    pub response: u8,
    pub probability: f64,
    pub representation: Option<Representation>,
}

/// Selected rows of one lane joined with their predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneFrame {
    pub sequence_id: String,
    pub rows: Vec<FrameRow>,
}

impl LaneFrame {
    /// Joins a lane with its step records. Every selected row must have
    /// exactly one record.
    pub fn build(lane: &Lane, records: Vec<StepRecord>) -> Result<Self, EvalError> {
        let mut by_position: BTreeMap<usize, StepRecord> =
            records.into_iter().map(|r| (r.position, r)).collect();

        let mut rows = Vec::with_capacity(lane.interactions.len() + 1);
        rows.push(FrameRow {
            group: SENTINEL_GROUP,
            rest: 0,
            row: lane.row,
            sequence_id: lane.sequence_id.clone(),
            position: 0,
            selected: false,
            concept: -1,
            question: None,
            response: 0,
            probability: 0.0,
            representation: None,
        });

        for (pos, (it, target)) in lane.interactions.iter().zip(&lane.targets).enumerate() {
            let record = by_position.remove(&pos);
            if target.selected && record.is_none() {
                return Err(EvalError::integrity(
                    target.group,
                    format!(
                        "no prediction for sequence {} position {pos}",
                        lane.sequence_id
                    ),
                ));
            }
            let (probability, representation) = record
                .map(|r| (r.probability, r.representation))
                .unwrap_or((0.0, None));
            rows.push(FrameRow {
                group: target.group,
                rest: target.rest,
                row: target.row,
                sequence_id: lane.sequence_id.clone(),
                position: pos,
                selected: target.selected,
                concept: it.concept,
                question: it.question,
                response: it.response,
                probability,
                representation,
            });
        }
        rows.retain(|r| r.selected);

        Ok(Self {
            sequence_id: lane.sequence_id.clone(),
            rows,
        })
    }

    /// `true` when every group in the frame ends inside it.
    pub fn is_closed(&self) -> bool {
        let mut last_rest: BTreeMap<i64, u32> = BTreeMap::new();
        for row in &self.rows {
            last_rest.insert(row.group, row.rest);
        }
        last_rest.values().all(|rest| *rest == 0)
    }
}

/// Rows released for fusion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Emission {
    pub rows: Vec<FrameRow>,
}

impl Emission {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Lanes deferred to the next minibatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarryForward {
    lanes: Vec<LaneFrame>,
}

impl CarryForward {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn row_count(&self) -> usize {
        self.lanes.iter().map(|l| l.rows.len()).sum()
    }

    /// Drops every carried lane of a sequence.
    pub fn purge_sequence(&mut self, sequence_id: &str) {
        self.lanes.retain(|l| l.sequence_id != sequence_id);
    }

    /// Releases the residual buffer at the end of a run. Groups whose last
    /// row closes them are emitted; the ids of the others are returned as
    /// discarded.
    pub fn flush(self) -> (Emission, Vec<i64>) {
        let rows: Vec<FrameRow> = self.lanes.into_iter().flat_map(|l| l.rows).collect();
        let mut last_rest: BTreeMap<i64, u32> = BTreeMap::new();
        for row in &rows {
            last_rest.insert(row.group, row.rest);
        }
        let discarded: Vec<i64> = last_rest
            .iter()
            .filter(|(_, rest)| **rest > 0)
            .map(|(g, _)| *g)
            .collect();
        let rows = rows
            .into_iter()
            .filter(|r| last_rest.get(&r.group) == Some(&0))
            .collect();
        (Emission { rows }, discarded)
    }
}

/// Appends `frames` to the carried lanes and splits them after the last
/// closed lane. With no closed lane, nothing is emitted.
pub fn regroup(carry: CarryForward, frames: Vec<LaneFrame>) -> (Emission, CarryForward) {
    let mut lanes = carry.lanes;
    lanes.extend(frames);

    match lanes.iter().rposition(LaneFrame::is_closed) {
        Some(split) => {
            let deferred = lanes.split_off(split + 1);
            let rows = lanes.into_iter().flat_map(|l| l.rows).collect();
            (Emission { rows }, CarryForward { lanes: deferred })
        }
        None => (Emission::default(), CarryForward { lanes }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Interaction, Target};

    /// A one-row lane for group `group` with `rest` rows still to come.
    fn single(seq: &str, group: i64, rest: u32, p: f64) -> LaneFrame {
        let lane = Lane {
            row: 0,
            sequence_id: seq.into(),
            interactions: vec![Interaction {
                concept: group,
                question: Some(group),
                timestamp: None,
                response: 1,
                is_repeat: rest > 0,
                forget: None,
            }],
            targets: vec![Target {
                group,
                rest,
                row: 0,
                selected: true,
            }],
        };
        let rec = StepRecord {
            position: 0,
            group,
            truth: 1,
            probability: p,
            label: 1,
            representation: None,
            history: None,
        };
        LaneFrame::build(&lane, vec![rec]).unwrap()
    }

    fn groups(e: &Emission) -> Vec<i64> {
        e.rows.iter().map(|r| r.group).collect()
    }

    #[test]
    fn build_drops_sentinel_and_unselected_rows() {
        let lane = Lane {
            row: 3,
            sequence_id: "u1".into(),
            interactions: vec![
                Interaction {
                    concept: 1,
                    question: None,
                    timestamp: None,
                    response: 0,
                    is_repeat: false,
                    forget: None,
                };
                2
            ],
            targets: vec![
                Target { group: 0, rest: 0, row: 3, selected: false },
                Target { group: 1, rest: 0, row: 3, selected: true },
            ],
        };
        let rec = StepRecord {
            position: 1,
            group: 1,
            truth: 0,
            probability: 0.25,
            label: 0,
            representation: None,
            history: None,
        };
        let frame = LaneFrame::build(&lane, vec![rec]).unwrap();
        assert_eq!(frame.rows.len(), 1);
        assert_eq!(frame.rows[0].group, 1);
        assert_eq!(frame.rows[0].probability, 0.25);
        assert!(frame.is_closed());
    }

    #[test]
    fn build_rejects_missing_prediction() {
        let lane = Lane {
            row: 0,
            sequence_id: "u1".into(),
            interactions: vec![Interaction {
                concept: 1,
                question: None,
                timestamp: None,
                response: 0,
                is_repeat: false,
                forget: None,
            }],
            targets: vec![Target { group: 7, rest: 0, row: 0, selected: true }],
        };
        let err = LaneFrame::build(&lane, vec![]).unwrap_err();
        assert!(matches!(err, EvalError::GroupIntegrity { group: 7, .. }));
    }

    #[test]
    fn straddling_group_is_deferred_then_emitted_whole() {
        // groups of sizes [2, 1, 3] over minibatches of 4 and 2 lanes
        let batch1 = vec![
            single("u1", 0, 1, 0.9),
            single("u1", 0, 0, 0.8),
            single("u1", 1, 0, 0.3),
            single("u1", 2, 2, 0.6),
        ];
        let batch2 = vec![single("u1", 2, 1, 0.7), single("u1", 2, 0, 0.2)];

        let (first, carry) = regroup(CarryForward::new(), batch1);
        assert_eq!(groups(&first), vec![0, 0, 1]);
        assert_eq!(carry.lane_count(), 1);
        assert_eq!(carry.lanes[0].rows[0].group, 2);

        let (second, carry) = regroup(carry, batch2);
        assert_eq!(groups(&second), vec![2, 2, 2]);
        let probs: Vec<f64> = second.rows.iter().map(|r| r.probability).collect();
        assert_eq!(probs, vec![0.6, 0.7, 0.2]);
        assert!(carry.is_empty());
    }

    #[test]
    fn no_closed_lane_defers_everything() {
        let (emitted, carry) = regroup(
            CarryForward::new(),
            vec![single("u1", 0, 2, 0.5), single("u1", 0, 1, 0.5)],
        );
        assert!(emitted.is_empty());
        assert_eq!(carry.row_count(), 2);
    }

    #[test]
    fn flush_emits_complete_and_discards_open_groups() {
        let carry = CarryForward {
            lanes: vec![
                single("u1", 4, 0, 0.1),
                single("u2", 5, 1, 0.2),
            ],
        };
        let (emitted, discarded) = carry.flush();
        assert_eq!(groups(&emitted), vec![4]);
        assert_eq!(discarded, vec![5]);
    }

    #[test]
    fn purge_removes_only_that_sequence() {
        let mut carry = CarryForward {
            lanes: vec![single("u1", 0, 1, 0.1), single("u2", 1, 1, 0.2)],
        };
        carry.purge_sequence("u1");
        assert_eq!(carry.lane_count(), 1);
        assert_eq!(carry.lanes[0].sequence_id, "u2");
    }
}
