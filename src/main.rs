use std::path::{Path, PathBuf};
use std::process;
use std::thread;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use framestat::error::Error;
use framestat::report::{
    SummaryMode, diff_summaries, format_info, format_summary, format_top, format_top_json,
    load_capture,
};
use framestat_runtime::dump::{DumpOptions, format_frame};
use framestat_runtime::{CaptureReader, StatsConfig, StatsThread, ThreadType};

#[derive(Parser)]
#[command(
    name = "framestat",
    about = "Inspect frame-based stats captures",
    version,
    after_help = "Workflow: framestat demo run.fstats, then framestat top run.fstats"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a capture's header, frame range and per-thread totals.
    Info {
        /// Capture file (.fstats or .fstatsraw).
        capture: PathBuf,
    },
    /// Dump one frame: call tree, inclusive and exclusive totals, threads,
    /// non-frame stats and events.
    Frame {
        capture: PathBuf,

        /// Frame number (defaults to the newest valid frame).
        #[arg(long)]
        frame: Option<i64>,

        /// Fold call tree nodes cheaper than MS milliseconds.
        #[arg(long, value_name = "MS", default_value_t = 0.0)]
        ms: f64,

        /// Levels of the call tree to show below each thread.
        #[arg(long)]
        depth: Option<u32>,

        /// Keep only stats whose name contains TEXT.
        #[arg(long, value_name = "TEXT")]
        filter: Option<String>,
    },
    /// Merge every frame's call tree into one.
    Summary {
        capture: PathBuf,

        #[arg(long, value_enum, default_value_t = SummaryMode::Average)]
        mode: SummaryMode,

        /// Hide nodes whose average is below MS milliseconds.
        #[arg(long, value_name = "MS", default_value_t = 0.0)]
        ms: f64,

        /// Levels of the call tree to show below each thread.
        #[arg(long)]
        depth: Option<u32>,
    },
    /// Per-stat averages across all frames, most expensive first.
    Top {
        capture: PathBuf,

        /// Number of stats to show (0 for all).
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Compare average inclusive time per stat between two captures.
    Diff {
        /// Baseline capture.
        a: PathBuf,
        /// Capture to compare against the baseline.
        b: PathBuf,
    },
    /// Record a synthetic capture with a game, render and worker thread.
    Demo {
        /// Output path; a .fstatsraw extension records raw packets.
        out: PathBuf,

        /// Frames to record.
        #[arg(long, default_value_t = 30)]
        frames: i64,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FRAMESTAT_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Info { capture } => cmd_info(&capture),
        Commands::Frame {
            capture,
            frame,
            ms,
            depth,
            filter,
        } => cmd_frame(
            &capture,
            frame,
            DumpOptions {
                min_ms: ms,
                max_depth: depth,
                filter,
            },
        ),
        Commands::Summary {
            capture,
            mode,
            ms,
            depth,
        } => cmd_summary(&capture, mode, ms, depth),
        Commands::Top {
            capture,
            limit,
            json,
        } => cmd_top(&capture, limit, json),
        Commands::Diff { a, b } => cmd_diff(&a, &b),
        Commands::Demo { out, frames } => cmd_demo(&out, frames),
    }
}

fn cmd_info(path: &Path) -> Result<(), Error> {
    let reader = CaptureReader::open(path)?;
    anstream::print!("{}", format_info(&reader));
    Ok(())
}

fn cmd_frame(path: &Path, frame: Option<i64>, options: DumpOptions) -> Result<(), Error> {
    let capture = load_capture(path)?;
    let frame = capture.resolve_frame(frame)?;
    anstream::print!("{}", format_frame(&capture.state, frame, &options)?);
    Ok(())
}

fn cmd_summary(path: &Path, mode: SummaryMode, ms: f64, depth: Option<u32>) -> Result<(), Error> {
    let capture = load_capture(path)?;
    anstream::print!("{}", format_summary(&capture, mode, ms, depth)?);
    Ok(())
}

fn cmd_top(path: &Path, limit: usize, json: bool) -> Result<(), Error> {
    let capture = load_capture(path)?;
    if json {
        anstream::println!("{}", format_top_json(&capture.summaries, limit)?);
    } else {
        anstream::print!("{}", format_top(&capture.summaries, limit));
    }
    Ok(())
}

fn cmd_diff(a: &Path, b: &Path) -> Result<(), Error> {
    let before = load_capture(a)?;
    let after = load_capture(b)?;
    anstream::print!("{}", diff_summaries(&before.summaries, &after.summaries));
    Ok(())
}

/// Spin for roughly `micros` microseconds so scopes have visible cost.
fn busy_wait(micros: u64) {
    let start = std::time::Instant::now();
    while start.elapsed() < std::time::Duration::from_micros(micros) {
        std::hint::spin_loop();
    }
}

fn cmd_demo(out: &Path, frames: i64) -> Result<(), Error> {
    let (stats, collector) = StatsThread::start(StatsConfig::from_env())?;
    stats.start_capture(out)?;

    let frame_stat = collector.declare_cycle_stat("STAT_Frame", "STATGROUP_Demo");
    let tick = collector.declare_cycle_stat("STAT_Tick", "STATGROUP_Demo");
    let physics = collector.declare_cycle_stat("STAT_Physics", "STATGROUP_Demo");
    let wait_render = collector.declare_cycle_stat("STAT_WaitForRender", "STATGROUP_Demo");
    let draw = collector.declare_cycle_stat("STAT_Draw", "STATGROUP_Demo");
    let job = collector.declare_cycle_stat("STAT_Job", "STATGROUP_Demo");
    let entities = collector.declare_counter("STAT_Entities", "STATGROUP_Demo");
    let jobs_run = collector.declare_accumulator("STAT_JobsRun", "STATGROUP_Demo");

    let game = collector.thread_stats("GameThread", ThreadType::Game);
    let render = collector.thread_stats("RenderThread", ThreadType::Renderer);

    for frame in 1..=frames {
        let event_id = frame as u32;
        {
            let _frame = game.scope(frame_stat);
            {
                let _tick = game.scope(tick);
                game.set(entities, 100 + frame % 7);
                busy_wait(200);
                {
                    let _physics = game.scope(physics);
                    busy_wait(100 + (frame as u64 % 5) * 20);
                }
            }
            let worker_collector = collector.clone();
            let worker = thread::spawn(move || {
                let worker = worker_collector.thread_stats("DemoWorker", ThreadType::Other);
                for _ in 0..3 {
                    let _job = worker.scope(job);
                    worker.add(jobs_run, 1);
                    busy_wait(50);
                }
            });
            {
                let _wait = game.scope(wait_render);
                game.event_wait(event_id);
                {
                    let _draw = render.scope(draw);
                    busy_wait(150);
                    render.event_trigger(event_id);
                }
                let _ = worker.join();
            }
        }
        render.advance_render_frame(frame + 1, false);
        game.advance_frame(frame + 1, false);
    }
    drop(game);
    drop(render);

    let summary = stats.stop_capture()?;
    stats.shutdown()?;
    if let Some(summary) = summary {
        eprintln!(
            "wrote {} block(s), {} bytes to {}",
            summary.blocks,
            summary.bytes,
            summary.path.display()
        );
    }
    Ok(())
}
