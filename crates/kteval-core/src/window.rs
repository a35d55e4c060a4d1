//! Bounded context window with lockstep auxiliary streams.
//!
//! The window keeps at most `max_len - 1` history rows so that the query
//! position always fits into a model input of length `max_len`. Every
//! parallel stream is pushed and evicted together.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::model::{ForgetFeatures, Interaction};

/// Marker for an unavailable question id.
pub const NO_QUESTION: i64 = -1;
/// Marker for an unavailable timestamp.
pub const NO_TIMESTAMP: i64 = -1;

/// Default maximum model input length.
pub const DEFAULT_MAX_LEN: usize = 200;

/// Visible history at one prediction step.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    max_len: usize,
    concepts: VecDeque<i64>,
    labels: VecDeque<u8>,
    questions: VecDeque<i64>,
    timestamps: VecDeque<i64>,
    forget: VecDeque<Option<ForgetFeatures>>,
}

/// Immutable copy of a window, in model-input order (oldest first).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub concepts: Vec<i64>,
    pub labels: Vec<u8>,
    pub questions: Vec<i64>,
    pub timestamps: Vec<i64>,
    pub forget: Vec<Option<ForgetFeatures>>,
}

impl WindowSnapshot {
    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }

    /// `concept:label` pairs joined by commas.
    pub fn history_string(&self) -> String {
        self.concepts
            .iter()
            .zip(&self.labels)
            .map(|(c, l)| format!("{c}:{l}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl ContextWindow {
    /// Creates an empty window. `max_len` is clamped to at least 1.
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        let cap = max_len.saturating_sub(1);
        Self {
            max_len,
            concepts: VecDeque::with_capacity(cap),
            labels: VecDeque::with_capacity(cap),
            questions: VecDeque::with_capacity(cap),
            timestamps: VecDeque::with_capacity(cap),
            forget: VecDeque::with_capacity(cap),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }

    /// Appends an interaction with the label to feed back, then evicts from
    /// the front so at most `max_len - 1` rows remain.
    pub fn append(&mut self, interaction: &Interaction, label: u8) {
        self.concepts.push_back(interaction.concept);
        self.labels.push_back(label);
        self.questions
            .push_back(interaction.question.unwrap_or(NO_QUESTION));
        self.timestamps
            .push_back(interaction.timestamp.unwrap_or(NO_TIMESTAMP));
        self.forget.push_back(interaction.forget);
        self.truncate(self.max_len);
    }

    /// Drops the oldest rows until the history plus one query position
    /// fits into `max_len`.
    pub fn truncate(&mut self, max_len: usize) {
        let keep = max_len.max(1) - 1;
        while self.concepts.len() > keep {
            self.concepts.pop_front();
            self.labels.pop_front();
            self.questions.pop_front();
            self.timestamps.pop_front();
            self.forget.pop_front();
        }
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            concepts: self.concepts.iter().copied().collect(),
            labels: self.labels.iter().copied().collect(),
            questions: self.questions.iter().copied().collect(),
            timestamps: self.timestamps.iter().copied().collect(),
            forget: self.forget.iter().copied().collect(),
        }
    }

    /// Lengths of every parallel stream, primary first.
    pub fn stream_lengths(&self) -> [usize; 5] {
        [
            self.concepts.len(),
            self.labels.len(),
            self.questions.len(),
            self.timestamps.len(),
            self.forget.len(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(concept: i64, ts: Option<i64>) -> Interaction {
        Interaction {
            concept,
            question: Some(concept * 10),
            timestamp: ts,
            response: 1,
            is_repeat: false,
            forget: None,
        }
    }

    #[test]
    fn keeps_room_for_query() {
        let mut w = ContextWindow::new(4);
        for c in 0..10 {
            w.append(&row(c, Some(c)), (c % 2) as u8);
            assert!(w.len() <= 3);
        }
        let snap = w.snapshot();
        assert_eq!(snap.concepts, vec![7, 8, 9]);
        assert_eq!(snap.labels, vec![1, 0, 1]);
        assert_eq!(snap.questions, vec![70, 80, 90]);
        assert_eq!(snap.timestamps, vec![7, 8, 9]);
    }

    #[test]
    fn missing_fields_use_sentinels() {
        let mut w = ContextWindow::new(10);
        let mut it = row(3, None);
        it.question = None;
        w.append(&it, 0);
        let snap = w.snapshot();
        assert_eq!(snap.questions, vec![NO_QUESTION]);
        assert_eq!(snap.timestamps, vec![NO_TIMESTAMP]);
        assert_eq!(snap.history_string(), "3:0");
    }

    #[test]
    fn length_one_window_holds_no_history() {
        let mut w = ContextWindow::new(1);
        w.append(&row(1, None), 1);
        assert!(w.is_empty());
        assert_eq!(w.stream_lengths(), [0; 5]);
    }

    #[test]
    fn explicit_truncate_is_lockstep() {
        let mut w = ContextWindow::new(50);
        for c in 0..20 {
            w.append(&row(c, Some(100 + c)), 1);
        }
        w.truncate(6);
        let lens = w.stream_lengths();
        assert!(lens.iter().all(|l| *l == 5));
        let snap = w.snapshot();
        assert_eq!(snap.concepts.first(), Some(&15));
        assert_eq!(snap.timestamps.first(), Some(&115));
    }
}
