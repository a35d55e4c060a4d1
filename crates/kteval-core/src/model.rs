//! Core data model types for knowledge-tracing evaluation.
//!
//! Sequences are immutable once loaded. Lanes are the unit the stepper
//! and the regrouping buffer operate on: a slice of one sequence, with
//! every row annotated by its group id, the number of rows of that group
//! still to come, and whether the row is scored.

use serde::{Deserialize, Serialize};

/// Forget/time-aware feature tuple attached to an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgetFeatures {
    /// Bucketed gap since the last attempt on the same concept.
    pub repeat_gap: i64,
    /// Bucketed gap since the previous interaction in the sequence.
    pub sequence_gap: i64,
    /// Bucketed number of past attempts on the same concept.
    pub past_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_label: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_time_label: Option<i64>,
}

/// A single learner interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub concept: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<i64>,
    /// Unix timestamp in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Ground-truth response, 0 or 1.
    pub response: u8,
    /// `true` when this row continues the previous row's question.
    #[serde(default)]
    pub is_repeat: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forget: Option<ForgetFeatures>,
}

/// An ordered list of interactions for one learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    pub interactions: Vec<Interaction>,
}

impl Sequence {
    /// Number of groups, i.e. rows that do not continue a previous question.
    pub fn group_count(&self) -> usize {
        self.interactions
            .iter()
            .enumerate()
            .filter(|(i, it)| *i == 0 || !it.is_repeat)
            .count()
    }
}

/// Which auxiliary fields are available (or required).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSet {
    pub questions: bool,
    pub timestamps: bool,
    pub forget: bool,
    pub interval_time: bool,
}

impl FieldSet {
    /// Every field.
    pub const ALL: FieldSet = FieldSet {
        questions: true,
        timestamps: true,
        forget: true,
        interval_time: true,
    };

    /// Field names present in `self` but absent from `available`.
    pub fn missing(&self, available: &FieldSet) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.questions && !available.questions {
            out.push("questions");
        }
        if self.timestamps && !available.timestamps {
            out.push("timestamps");
        }
        if self.forget && !available.forget {
            out.push("forget");
        }
        if self.interval_time && !available.interval_time {
            out.push("interval_time");
        }
        out
    }

    /// Fields actually carried by one interaction.
    pub fn of(interaction: &Interaction) -> FieldSet {
        FieldSet {
            questions: interaction.question.is_some(),
            timestamps: interaction.timestamp.is_some(),
            forget: interaction.forget.is_some(),
            interval_time: interaction
                .forget
                .is_some_and(|f| f.interval_time.is_some()),
        }
    }

    /// Fields present in both sets.
    pub fn intersect(&self, other: &FieldSet) -> FieldSet {
        FieldSet {
            questions: self.questions && other.questions,
            timestamps: self.timestamps && other.timestamps,
            forget: self.forget && other.forget,
            interval_time: self.interval_time && other.interval_time,
        }
    }

    /// Fields present in either set.
    pub fn union(&self, other: &FieldSet) -> FieldSet {
        FieldSet {
            questions: self.questions || other.questions,
            timestamps: self.timestamps || other.timestamps,
            forget: self.forget || other.forget,
            interval_time: self.interval_time || other.interval_time,
        }
    }

    /// Names of the fields set to `true`.
    pub fn names(&self) -> Vec<&'static str> {
        self.missing(&FieldSet::default())
    }
}

/// Group annotation for one lane row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Global group id, assigned in first-appearance order.
    pub group: i64,
    /// Rows of the same group that follow this one in the sequence.
    pub rest: u32,
    /// Row index of the source sequence in the dataset.
    pub row: i64,
    /// Whether this row is scored. Unselected rows are context only.
    pub selected: bool,
}

/// One lane of a minibatch: a contiguous slice of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lane {
    pub row: i64,
    pub sequence_id: String,
    pub interactions: Vec<Interaction>,
    /// One target per interaction.
    pub targets: Vec<Target>,
}

impl Lane {
    /// Length of the leading run of unselected rows.
    pub fn warmup(&self) -> usize {
        self.targets.iter().take_while(|t| !t.selected).count()
    }

    /// Distinct group ids of the selected rows, in order.
    pub fn group_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = Vec::new();
        for t in self.targets.iter().filter(|t| t.selected) {
            if ids.last() != Some(&t.group) {
                ids.push(t.group);
            }
        }
        ids
    }

    pub fn selected_count(&self) -> usize {
        self.targets.iter().filter(|t| t.selected).count()
    }
}

/// Label feedback policy for the stepper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Ground-truth labels are appended after each step.
    #[default]
    TeacherForced,
    /// Thresholded predictions are appended instead of ground truth.
    Autoregressive,
}

impl std::fmt::Display for StepMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepMode::TeacherForced => write!(f, "teacher_forced"),
            StepMode::Autoregressive => write!(f, "autoregressive"),
        }
    }
}

/// Thresholded label: 1 iff `probability >= 0.5`.
pub fn threshold(probability: f64) -> u8 {
    u8::from(probability >= 0.5)
}
