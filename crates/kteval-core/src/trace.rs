//! Append-only, tab-separated prediction traces.
//!
//! Group trace columns:
//! `row sequence group questions concepts concept_preds late_trues
//! late_mean late_vote late_all [early_trues early_preds]`
//!
//! Step trace columns:
//! `row sequence step group history truth prediction label`
//!
//! Lists are comma-joined. Floats use Rust's shortest round-trip form, so
//! re-parsing a trace reproduces the in-memory values bit for bit. Every
//! stream ends with a status line: `#end\t<records>` or
//! `#truncated\t<reason>`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::error::EvalError;
use crate::fusion::GroupResult;
use crate::metrics::{MetricReport, MetricsAccumulator};
use crate::stepper::StepRecord;

const END_MARKER: &str = "#end";
const TRUNCATED_MARKER: &str = "#truncated";

pub const GROUP_COLUMNS: &[&str] = &[
    "row",
    "sequence",
    "group",
    "questions",
    "concepts",
    "concept_preds",
    "late_trues",
    "late_mean",
    "late_vote",
    "late_all",
];
pub const EARLY_COLUMNS: &[&str] = &["early_trues", "early_preds"];
pub const STEP_COLUMNS: &[&str] = &[
    "row",
    "sequence",
    "step",
    "group",
    "history",
    "truth",
    "prediction",
    "label",
];

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Removes characters that would break the line/column structure.
fn clean(field: &str) -> String {
    field.replace(['\t', '\n', '\r'], " ")
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// A single trace stream.
pub struct TraceWriter {
    out: Box<dyn Write + Send>,
    records: usize,
    early: bool,
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("records", &self.records)
            .field("early", &self.early)
            .finish()
    }
}

impl TraceWriter {
    /// Creates a group trace and writes its header.
    pub fn groups(out: Box<dyn Write + Send>, early: bool) -> std::io::Result<Self> {
        let mut columns: Vec<&str> = GROUP_COLUMNS.to_vec();
        if early {
            columns.extend_from_slice(EARLY_COLUMNS);
        }
        Self::start(out, &columns, early)
    }

    /// Creates a step trace and writes its header.
    pub fn steps(out: Box<dyn Write + Send>) -> std::io::Result<Self> {
        Self::start(out, STEP_COLUMNS, false)
    }

    /// Opens `path` for writing, truncating any previous content.
    pub fn create_file(path: &Path) -> std::io::Result<Box<dyn Write + Send>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }

    fn start(mut out: Box<dyn Write + Send>, columns: &[&str], early: bool) -> std::io::Result<Self> {
        writeln!(out, "{}", columns.join("\t"))?;
        Ok(Self {
            out,
            records: 0,
            early,
        })
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn write_group(&mut self, g: &GroupResult) -> std::io::Result<()> {
        let mut fields = vec![
            g.row.to_string(),
            clean(&g.sequence_id),
            g.group.to_string(),
            join(&g.questions),
            join(&g.concepts),
            join(&g.predictions),
            g.truth.to_string(),
            g.late_mean.to_string(),
            g.late_vote.to_string(),
            g.late_all.to_string(),
        ];
        if self.early {
            let early = g.early.map(|p| p.to_string()).unwrap_or_default();
            fields.push(g.truth.to_string());
            fields.push(early);
        }
        writeln!(self.out, "{}", fields.join("\t"))?;
        self.records += 1;
        Ok(())
    }

    pub fn write_step(&mut self, row: i64, sequence_id: &str, r: &StepRecord) -> std::io::Result<()> {
        let history = r
            .history
            .as_ref()
            .map(|h| h.history_string())
            .unwrap_or_default();
        writeln!(
            self.out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row,
            clean(sequence_id),
            r.position,
            r.group,
            history,
            r.truth,
            r.probability,
            r.label
        )?;
        self.records += 1;
        Ok(())
    }

    /// Flushes buffered records, keeping the stream open.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }

    /// Writes the success marker and flushes.
    pub fn finish(mut self) -> std::io::Result<usize> {
        writeln!(self.out, "{END_MARKER}\t{}", self.records)?;
        self.out.flush()?;
        Ok(self.records)
    }

    /// Writes the truncation marker. Errors are only logged, since the
    /// run is already failing.
    pub fn abort(mut self, reason: &str) {
        let result = writeln!(self.out, "{TRUNCATED_MARKER}\t{}", clean(reason))
            .and_then(|_| self.out.flush());
        if let Err(e) = result {
            tracing::error!("could not mark trace as truncated: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// How a trace stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceStatus {
    Complete { records: usize },
    Truncated { reason: String },
    /// No status line: the writer died without marking the stream.
    Unterminated,
}

/// A re-parsed group trace.
#[derive(Debug, Clone)]
pub struct GroupTrace {
    pub has_early: bool,
    pub groups: Vec<GroupResult>,
    pub status: TraceStatus,
}

impl GroupTrace {
    /// Recomputes the metric levels from the parsed records.
    pub fn metrics(&self) -> Result<BTreeMap<String, MetricReport>, EvalError> {
        let mut acc = MetricsAccumulator::new();
        acc.extend(&self.groups);
        acc.finish()
    }
}

fn parse_list<T: std::str::FromStr>(field: &str) -> Result<Vec<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split(',')
        .map(|v| v.parse::<T>().map_err(anyhow::Error::from))
        .collect()
}

fn parse_group_line(line: &str, has_early: bool) -> Result<GroupResult> {
    let cols: Vec<&str> = line.split('\t').collect();
    let expected = GROUP_COLUMNS.len() + if has_early { EARLY_COLUMNS.len() } else { 0 };
    if cols.len() != expected {
        bail!("expected {expected} columns, found {}", cols.len());
    }
    let early = if has_early && !cols[11].is_empty() {
        Some(cols[11].parse()?)
    } else {
        None
    };
    Ok(GroupResult {
        row: cols[0].parse()?,
        sequence_id: cols[1].to_string(),
        group: cols[2].parse()?,
        questions: parse_list(cols[3])?,
        concepts: parse_list(cols[4])?,
        predictions: parse_list(cols[5])?,
        truth: cols[6].parse()?,
        late_mean: cols[7].parse()?,
        late_vote: cols[8].parse()?,
        late_all: cols[9].parse()?,
        early,
    })
}

/// Parses a group trace from any reader.
pub fn parse_group_trace(reader: impl BufRead) -> Result<GroupTrace> {
    let mut lines = reader.lines().enumerate();
    let header = match lines.next() {
        Some((_, line)) => line.context("failed to read trace header")?,
        None => bail!("empty trace"),
    };
    let columns: Vec<&str> = header.split('\t').collect();
    if !columns.starts_with(GROUP_COLUMNS) {
        bail!("not a group trace header: {header}");
    }
    let has_early = columns.len() > GROUP_COLUMNS.len();

    let mut groups = Vec::new();
    let mut status = TraceStatus::Unterminated;
    for (idx, line) in lines {
        let line = line.with_context(|| format!("failed to read trace line {}", idx + 1))?;
        if let Some(rest) = line.strip_prefix(END_MARKER) {
            let records = rest.trim().parse().unwrap_or(groups.len());
            status = TraceStatus::Complete { records };
            break;
        }
        if let Some(rest) = line.strip_prefix(TRUNCATED_MARKER) {
            status = TraceStatus::Truncated {
                reason: rest.trim().to_string(),
            };
            break;
        }
        if line.is_empty() {
            continue;
        }
        let group = parse_group_line(&line, has_early)
            .with_context(|| format!("malformed trace line {}", idx + 1))?;
        groups.push(group);
    }

    Ok(GroupTrace {
        has_early,
        groups,
        status,
    })
}

/// Reads a group trace from disk.
pub fn read_group_trace(path: &Path) -> Result<GroupTrace> {
    let file = File::open(path)
        .with_context(|| format!("failed to open trace {}", path.display()))?;
    parse_group_trace(BufReader::new(file))
        .with_context(|| format!("failed to parse trace {}", path.display()))
}
