use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::debug;

use framestat_runtime::dump::format_complex_stack;
use framestat_runtime::tsc::{cycles_to_ms, ms_to_cycles};
use framestat_runtime::{
    CaptureReader, CaptureVisitor, ComplexField, ComplexRawStatStackNode, StatMessage, StatName,
    StatsThreadState,
};

use crate::error::Error;

/// Per-stat averages over every valid frame of a capture.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StatSummary {
    pub name: String,
    pub group: Option<String>,
    /// Frames the stat appeared in.
    pub frames: u32,
    pub calls: f64,
    pub inclusive_ms: f64,
    pub max_inclusive_ms: f64,
    pub exclusive_ms: f64,
}

#[derive(Default)]
struct Totals {
    frames: u32,
    calls: u64,
    inclusive: u64,
    max_inclusive: u32,
    exclusive: u64,
}

/// Gathers per-stat totals while a capture loads.
#[derive(Default)]
pub struct Summarizer {
    totals: IndexMap<StatName, Totals>,
    frames: u32,
    seconds_per_cycle: Option<f64>,
}

impl CaptureVisitor for Summarizer {
    fn process_frame(&mut self, state: &StatsThreadState, frame: i64) {
        let (Ok(inclusive), Ok(exclusive)) = (
            state.inclusive_aggregate_stack_stats(frame, None, false, None),
            state.exclusive_aggregate_stack_stats(frame, None, false),
        ) else {
            return;
        };
        if self.seconds_per_cycle.is_none() {
            self.seconds_per_cycle = state.seconds_per_cycle(frame);
        }
        self.frames += 1;
        for item in inclusive.iter().filter(|m| m.is_packed()) {
            let totals = self.totals.entry(item.name).or_default();
            totals.frames += 1;
            totals.calls += item.call_count() as u64;
            totals.inclusive += item.duration() as u64;
            totals.max_inclusive = totals.max_inclusive.max(item.duration());
        }
        for item in exclusive.iter().filter(|m| m.is_packed()) {
            self.totals.entry(item.name).or_default().exclusive += item.duration() as u64;
        }
    }
}

impl Summarizer {
    pub fn seconds_per_cycle(&self) -> f64 {
        self.seconds_per_cycle
            .unwrap_or_else(framestat_runtime::tsc::seconds_per_cycle)
    }

    /// Averages over the frames seen, in duration order.
    pub fn finish(&self) -> Vec<StatSummary> {
        let spc = self.seconds_per_cycle();
        let frames = self.frames.max(1) as f64;
        let mut out: Vec<StatSummary> = self
            .totals
            .iter()
            .map(|(name, t)| StatSummary {
                name: name.short_name().as_str().to_string(),
                group: name.group_name().map(|g| g.as_str().to_string()),
                frames: t.frames,
                calls: t.calls as f64 / frames,
                inclusive_ms: cycles_to_ms(t.inclusive as f64 / frames, spc),
                max_inclusive_ms: cycles_to_ms(t.max_inclusive as f64, spc),
                exclusive_ms: cycles_to_ms(t.exclusive as f64 / frames, spc),
            })
            .collect();
        out.sort_by(|a, b| {
            b.inclusive_ms
                .total_cmp(&a.inclusive_ms)
                .then_with(|| b.calls.total_cmp(&a.calls))
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }
}

/// A condensed capture loaded into memory.
pub struct Capture {
    pub path: PathBuf,
    pub state: StatsThreadState,
    pub summaries: Vec<StatSummary>,
    pub seconds_per_cycle: f64,
}

impl Capture {
    pub fn valid_frames(&self) -> Vec<i64> {
        self.state.valid_frames()
    }

    /// `frame`, or the newest frame when `None`.
    pub fn resolve_frame(&self, frame: Option<i64>) -> Result<i64, Error> {
        let (Some(first), Some(last)) = (
            self.state.oldest_valid_frame(),
            self.state.latest_valid_frame(),
        ) else {
            return Err(Error::NoFrames(self.path.clone()));
        };
        let frame = frame.unwrap_or(last);
        if !self.state.is_frame_valid(frame) {
            return Err(Error::FrameNotFound {
                frame,
                path: self.path.clone(),
                first,
                last,
            });
        }
        Ok(frame)
    }
}

/// Read every frame of a condensed capture.
pub fn load_capture(path: &Path) -> Result<Capture, Error> {
    let mut reader = CaptureReader::open(path)?;
    if reader.is_raw() {
        return Err(Error::RawCapture(path.to_path_buf()));
    }
    let mut summarizer = Summarizer::default();
    let (_stage, state) = reader.read_and_process(&mut summarizer)?;
    if state.valid_frames().is_empty() {
        return Err(Error::NoFrames(path.to_path_buf()));
    }
    debug!(
        path = %path.display(),
        frames = state.valid_frames().len(),
        stats = summarizer.finish().len(),
        "capture loaded"
    );
    Ok(Capture {
        path: path.to_path_buf(),
        summaries: summarizer.finish(),
        seconds_per_cycle: summarizer.seconds_per_cycle(),
        state,
    })
}

/// Header fields and table sizes of a capture.
pub fn format_info(reader: &CaptureReader) -> String {
    let header = reader.header();
    let mut out = String::new();
    let _ = writeln!(out, "{:<16} {}", "Path", reader.path().display());
    let _ = writeln!(out, "{:<16} {}", "Version", header.version);
    let _ = writeln!(out, "{:<16} {}", "Platform", header.platform);
    let kind = if header.is_raw { "raw" } else { "condensed" };
    let _ = writeln!(out, "{:<16} {kind}", "Kind");
    let _ = writeln!(out, "{:<16} {}", "Finalized", header.is_finalized());
    match reader.num_frames() {
        Some(frames) => {
            let _ = writeln!(out, "{:<16} {frames}", "Blocks");
        }
        None => {
            let _ = writeln!(out, "{:<16} unknown (not finalized)", "Blocks");
        }
    }
    let table = reader.frame_table();
    if let (Some(first), Some(last)) = (table.first(), table.last())
        && !header.is_raw
    {
        let _ = writeln!(out, "{:<16} {}..={}", "Frames", first.frame, last.frame);
    }
    let _ = writeln!(out, "{:<16} {}", "Names", header.name_count);
    let _ = writeln!(out, "{:<16} {}", "Metadata", header.metadata_count);

    let mut threads: IndexMap<u32, (i64, u32)> = IndexMap::new();
    for entry in table {
        for (thread_id, cycles) in &entry.thread_cycles {
            let slot = threads.entry(*thread_id).or_default();
            slot.0 += cycles;
            slot.1 += 1;
        }
    }
    if !threads.is_empty() {
        let names = thread_names(reader.metadata());
        out.push('\n');
        let _ = writeln!(out, "{:<40} {:>12}", "Thread", "Avg cycles");
        let _ = writeln!(out, "{}", "-".repeat(53));
        for (thread_id, (cycles, frames)) in &threads {
            let name = names
                .iter()
                .find(|(id, _)| id == thread_id)
                .map_or_else(|| format!("thread {thread_id:x}"), |(_, n)| n.to_string());
            let _ = writeln!(out, "{:<40} {:>12}", name, cycles / (*frames).max(1) as i64);
        }
    }
    out
}

fn thread_names(metadata: &[StatMessage]) -> Vec<(u32, &'static str)> {
    metadata
        .iter()
        .filter_map(|m| {
            let id = m
                .name
                .description()
                .and_then(framestat_runtime::name::parse_thread_id)?;
            Some((id, m.name.short_name().as_str()))
        })
        .collect()
}

/// Stat table in duration order; `limit` of 0 shows everything.
pub fn format_top(summaries: &[StatSummary], limit: usize) -> String {
    let shown = if limit == 0 {
        summaries
    } else {
        &summaries[..limit.min(summaries.len())]
    };
    let mut out = String::new();
    out.push_str(&format!(
        "{:<40} {:>8} {:>10} {:>10} {:>10}\n",
        "Stat", "Calls", "Incl", "Max", "Self"
    ));
    out.push_str(&format!("{}\n", "-".repeat(82)));
    for s in shown {
        out.push_str(&format!(
            "{:<40} {:>8.1} {:>8.3}ms {:>8.3}ms {:>8.3}ms\n",
            s.name, s.calls, s.inclusive_ms, s.max_inclusive_ms, s.exclusive_ms
        ));
    }
    out
}

pub fn format_top_json(summaries: &[StatSummary], limit: usize) -> Result<String, Error> {
    let shown = if limit == 0 {
        summaries
    } else {
        &summaries[..limit.min(summaries.len())]
    };
    Ok(serde_json::to_string_pretty(shown)?)
}

/// Average inclusive time per stat, before and after.
pub fn diff_summaries(a: &[StatSummary], b: &[StatSummary]) -> String {
    let mut names: Vec<&str> = a.iter().chain(b).map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();

    let lookup = |set: &[StatSummary], name: &str| {
        set.iter()
            .find(|s| s.name == name)
            .map_or(0.0, |s| s.inclusive_ms)
    };

    let mut out = String::new();
    out.push_str(&format!(
        "{:<40} {:>10} {:>10} {:>10}\n",
        "Stat", "Before", "After", "Delta"
    ));
    out.push_str(&format!("{}\n", "-".repeat(74)));
    for name in names {
        let before = lookup(a, name);
        let after = lookup(b, name);
        out.push_str(&format!(
            "{:<40} {:>8.3}ms {:>8.3}ms {:>+8.3}ms\n",
            name,
            before,
            after,
            after - before
        ));
    }
    out
}

/// How a multi-frame summary combines frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SummaryMode {
    Average,
    Max,
    Sum,
}

impl SummaryMode {
    fn field(self) -> ComplexField {
        match self {
            SummaryMode::Average => ComplexField::IncAve,
            SummaryMode::Max => ComplexField::IncMax,
            SummaryMode::Sum => ComplexField::IncSum,
        }
    }
}

/// Merge the call trees of every valid frame.
pub fn merged_stack(state: &StatsThreadState) -> Result<Option<ComplexRawStatStackNode>, Error> {
    let frames = state.valid_frames();
    let mut merged: Option<ComplexRawStatStackNode> = None;
    for &frame in &frames {
        let mut raw = state.uncondense_stack_stats(frame, None, None)?;
        raw.add_self();
        merged
            .get_or_insert_with(|| ComplexRawStatStackNode::from_raw(&raw))
            .merge_add_and_max(&raw);
    }
    if let Some(root) = merged.as_mut() {
        root.divide(frames.len() as u32);
        root.copy_exclusives_from_self();
    }
    Ok(merged)
}

pub fn format_summary(
    capture: &Capture,
    mode: SummaryMode,
    min_ms: f64,
    depth: Option<u32>,
) -> Result<String, Error> {
    let Some(mut root) = merged_stack(&capture.state)? else {
        return Err(Error::NoFrames(capture.path.clone()));
    };
    if min_ms > 0.0 {
        root.cull_by_cycles(ms_to_cycles(min_ms, capture.seconds_per_cycle));
    }
    if let Some(depth) = depth {
        root.cull_by_depth(depth + 1);
    }
    let frames = capture.valid_frames();
    let mut out = format!(
        "{} frames ({}..={})\n\n",
        frames.len(),
        frames.first().copied().unwrap_or_default(),
        frames.last().copied().unwrap_or_default()
    );
    out.push_str(&format_complex_stack(
        &root,
        mode.field(),
        capture.seconds_per_cycle,
    ));
    Ok(out)
}
