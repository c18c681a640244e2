//! Text renderings of frames and multi-frame summaries.
//!
//! Every `format_*` function returns a `String`; printing is left to the
//! caller. Times are converted from cycles to milliseconds here and only
//! here.

use std::fmt::Write as _;

use crate::complex::{ComplexField, ComplexRawStatStackNode};
use crate::error::Result;
use crate::message::{StatMessage, StatValue};
use crate::name::StatName;
use crate::stack::{NonStackStats, RawStatStackNode, StatFilter};
use crate::state::{EventData, StatsThreadState, ThreadBreakdown};
use crate::tsc::{cycles_to_ms, ms_to_cycles};

const RULE: usize = 72;

/// Options for a single-frame dump.
#[derive(Clone, Debug, Default)]
pub struct DumpOptions {
    /// Hide stack nodes cheaper than this many milliseconds.
    pub min_ms: f64,
    /// Stop descending after this many levels below the thread roots.
    pub max_depth: Option<u32>,
    /// Keep only stats whose short name contains this text.
    pub filter: Option<String>,
}

struct NameContains<'a>(&'a str);

impl StatFilter for NameContains<'_> {
    fn keep(&self, item: &StatMessage) -> bool {
        item.name.short_name().as_str().contains(self.0)
    }
}

fn display_name(name: StatName) -> &'static str {
    name.short_name().as_str()
}

fn header(out: &mut String, title: &str) {
    let _ = writeln!(out, "{title}");
    let _ = writeln!(out, "{}", "-".repeat(RULE));
}

/// `1.234ms (   3)  name`, indented two spaces per level.
pub fn format_call(item: &StatMessage, depth: usize, seconds_per_cycle: f64) -> String {
    let ms = cycles_to_ms(item.duration() as f64, seconds_per_cycle);
    format!(
        "{:>9.3}ms ({:>4})  {}{}",
        ms,
        item.call_count(),
        "  ".repeat(depth),
        display_name(item.name)
    )
}

/// The call tree below the synthetic root.
pub fn format_stack(root: &RawStatStackNode, seconds_per_cycle: f64) -> String {
    fn walk(node: &RawStatStackNode, depth: usize, spc: f64, out: &mut String) {
        for child in node.children.values() {
            let _ = writeln!(out, "{}", format_call(&child.meta, depth, spc));
            walk(child, depth + 1, spc, out);
        }
    }
    let mut out = String::new();
    walk(root, 0, seconds_per_cycle, &mut out);
    out
}

/// A merged multi-frame tree: `field` and the exclusive average per node.
pub fn format_complex_stack(
    root: &ComplexRawStatStackNode,
    field: ComplexField,
    seconds_per_cycle: f64,
) -> String {
    fn walk(
        node: &ComplexRawStatStackNode,
        field: ComplexField,
        depth: usize,
        spc: f64,
        out: &mut String,
    ) {
        for child in node.children.values() {
            let complex = &child.complex;
            let ms = |f| cycles_to_ms(complex.duration(f) as f64, spc);
            let _ = writeln!(
                out,
                "{:>9.3}ms {:>9.3}ms ({:>4})  {}{}",
                ms(field),
                ms(ComplexField::ExcAve),
                complex.call_count(field),
                "  ".repeat(depth),
                display_name(complex.name())
            );
            walk(child, field, depth + 1, spc, out);
        }
    }
    let label = match field {
        ComplexField::IncSum => "Sum",
        ComplexField::IncAve => "Avg",
        ComplexField::IncMax => "Max",
        ComplexField::ExcAve => "SelfAvg",
        ComplexField::ExcMax => "SelfMax",
    };
    let mut out = String::new();
    let _ = writeln!(out, "{label:>11} {:>11} {:>6}  Stat", "Self", "Calls");
    let _ = writeln!(out, "{}", "-".repeat(RULE));
    walk(root, field, 0, seconds_per_cycle, &mut out);
    out
}

/// Flat per-stat totals in the order given.
pub fn format_flat(title: &str, stats: &[StatMessage], seconds_per_cycle: f64) -> String {
    let mut out = String::new();
    header(&mut out, title);
    for item in stats {
        if item.is_cycle() {
            let _ = writeln!(out, "{}", format_call(item, 0, seconds_per_cycle));
        } else {
            let _ = writeln!(out, "{:>16}  {}", format_value(item), display_name(item.name));
        }
    }
    out
}

fn format_value(item: &StatMessage) -> String {
    match item.value {
        StatValue::Int64(v) => v.to_string(),
        StatValue::Double(v) => format!("{v:.3}"),
        StatValue::Ptr(v) => format!("{v:#x}"),
        StatValue::Name(name) => name.as_str().to_string(),
        StatValue::None => "-".to_string(),
    }
}

/// Counters and accumulators gathered outside the call tree.
pub fn format_non_frame(stats: &NonStackStats) -> String {
    let mut out = String::new();
    header(&mut out, "Non-frame stats");
    let mut sorted: Vec<&StatMessage> = stats.values().collect();
    sorted.sort_by(|a, b| display_name(a.name).cmp(display_name(b.name)));
    for item in sorted {
        let _ = writeln!(out, "{:>16}  {}", format_value(item), display_name(item.name));
    }
    out
}

/// Per-thread flat totals.
pub fn format_thread_breakdown(breakdown: &ThreadBreakdown, seconds_per_cycle: f64) -> String {
    let mut out = String::new();
    for (thread, stats) in breakdown {
        let _ = write!(
            out,
            "{}",
            format_flat(
                &format!("Thread {}", display_name(*thread)),
                stats,
                seconds_per_cycle
            )
        );
    }
    out
}

fn format_stack_path(stack: &[StatName]) -> String {
    stack
        .iter()
        .map(|name| display_name(*name))
        .collect::<Vec<_>>()
        .join(" > ")
}

/// Wait/trigger pairs, longest wait first.
pub fn format_events(events: &[(u32, EventData)], seconds_per_cycle: f64) -> String {
    let mut out = String::new();
    header(&mut out, "Events");
    let mut sorted: Vec<&(u32, EventData)> = events.iter().collect();
    sorted.sort_by_key(|(id, event)| (std::cmp::Reverse(event.duration()), *id));
    for (id, event) in sorted {
        let ms = cycles_to_ms(event.duration() as f64, seconds_per_cycle);
        let _ = writeln!(out, "{ms:>9.3}ms  event {id}");
        if event.has_valid_stacks() {
            let _ = writeln!(out, "    wait:    {}", format_stack_path(&event.wait_stack));
            let _ = writeln!(out, "    trigger: {}", format_stack_path(&event.trigger_stack));
        } else {
            let _ = writeln!(out, "    (incomplete)");
        }
    }
    out
}

/// Everything known about one valid frame.
pub fn format_frame(state: &StatsThreadState, frame: i64, options: &DumpOptions) -> Result<String> {
    let spc = state
        .seconds_per_cycle(frame)
        .unwrap_or_else(crate::tsc::seconds_per_cycle);
    let filter = options.filter.as_deref().map(NameContains);
    let filter = filter.as_ref().map(|f| f as &dyn StatFilter);

    let mut non_stack = NonStackStats::new();
    let mut stack = state.uncondense_stack_stats(frame, None, Some(&mut non_stack))?;
    if options.min_ms > 0.0 {
        stack.cull_by_cycles(ms_to_cycles(options.min_ms, spc));
    }
    if let Some(depth) = options.max_depth {
        // Thread roots are the first level.
        stack.cull_by_depth(depth + 1);
    }
    if let Some(f) = filter {
        non_stack.retain(|_, item| f.keep(item));
    }

    let mut breakdown = ThreadBreakdown::new();
    let inclusive = state.inclusive_aggregate_stack_stats(frame, filter, false, Some(&mut breakdown))?;
    let exclusive = state.exclusive_aggregate_stack_stats(frame, filter, false)?;

    let mut out = String::new();
    let _ = writeln!(out, "Frame {frame}");
    out.push('\n');
    header(&mut out, "Stack");
    out.push_str(&format_stack(&stack, spc));
    out.push('\n');
    out.push_str(&format_flat("Inclusive", &inclusive, spc));
    out.push('\n');
    out.push_str(&format_flat("Exclusive", &exclusive, spc));
    out.push('\n');
    out.push_str(&format_thread_breakdown(&breakdown, spc));
    out.push('\n');
    out.push_str(&format_non_frame(&non_stack));
    let events = state.events_for_frame(frame);
    if !events.is_empty() {
        out.push('\n');
        out.push_str(&format_events(&events, spc));
    }
    Ok(out)
}
