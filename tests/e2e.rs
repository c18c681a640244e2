//! End-to-end test: record a demo capture, then inspect it with every subcommand.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn framestat(args: &[&str], files: &[&Path]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_framestat"))
        .args(args)
        .args(files)
        .env_remove("FRAMESTAT_HISTORY_FRAMES")
        .env_remove("FRAMESTAT_FRAME_SLOP")
        .output()
        .expect("failed to run framestat")
}

fn stdout_of(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        output.status.success(),
        "framestat failed:\nstderr: {stderr}\nstdout: {stdout}"
    );
    stdout
}

fn record(dir: &Path, name: &str, frames: u32) -> PathBuf {
    let path = dir.join(name);
    let output = framestat(&["demo", "--frames", &frames.to_string()], &[&path]);
    stdout_of(&output);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("wrote"), "demo should report the file: {stderr}");
    assert!(path.exists(), "capture should exist at {}", path.display());
    path
}

#[test]
fn demo_capture_reports_through_every_subcommand() {
    let tmp = tempfile::tempdir().unwrap();
    let capture = record(tmp.path(), "run.fstats", 8);

    let info = stdout_of(&framestat(&["info"], &[&capture]));
    assert!(info.contains("condensed"), "info: {info}");
    assert!(info.contains("Finalized        true"), "info: {info}");
    assert!(info.contains("Frames           1..=8"), "info: {info}");
    assert!(info.contains("GameThread"), "thread table: {info}");

    let frame = stdout_of(&framestat(&["frame", "--frame", "3"], &[&capture]));
    assert!(frame.starts_with("Frame 3\n"), "frame: {frame}");
    for stat in ["STAT_Frame", "STAT_Tick", "STAT_Physics", "STAT_Draw", "STAT_Job"] {
        assert!(frame.contains(stat), "frame dump should mention {stat}: {frame}");
    }
    assert!(frame.contains("STAT_Entities"), "counter missing: {frame}");
    assert!(frame.contains("Events"), "event section missing: {frame}");

    let newest = stdout_of(&framestat(&["frame"], &[&capture]));
    assert!(newest.starts_with("Frame 8\n"), "newest frame: {newest}");

    let summary = stdout_of(&framestat(&["summary", "--mode", "max"], &[&capture]));
    assert!(summary.starts_with("8 frames (1..=8)"), "summary: {summary}");
    assert!(summary.contains("Max"), "summary header: {summary}");
    assert!(summary.contains("STAT_Physics"), "summary: {summary}");

    let top = stdout_of(&framestat(&["top", "--limit", "0"], &[&capture]));
    assert!(top.starts_with("Stat"), "top: {top}");
    assert!(top.contains("STAT_Tick"), "top: {top}");

    let json = stdout_of(&framestat(&["top", "--json"], &[&capture]));
    let value: serde_json::Value = serde_json::from_str(&json).expect("top --json is JSON");
    let stats = value.as_array().expect("top --json is an array");
    let tick = stats
        .iter()
        .find(|s| s["name"] == "STAT_Tick")
        .expect("STAT_Tick in JSON");
    assert_eq!(tick["frames"], 8);
    assert_eq!(tick["group"], "STATGROUP_Demo");
    assert!(tick["inclusive_ms"].as_f64().unwrap() > 0.0);
}

#[test]
fn diff_compares_two_captures() {
    let tmp = tempfile::tempdir().unwrap();
    let a = record(tmp.path(), "a.fstats", 4);
    let b = record(tmp.path(), "b.fstats", 6);

    let diff = stdout_of(&framestat(&["diff"], &[&a, &b]));
    assert!(diff.contains("Before"), "diff header: {diff}");
    assert!(diff.contains("STAT_Physics"), "diff: {diff}");
}

#[test]
fn missing_frame_exits_with_error() {
    let tmp = tempfile::tempdir().unwrap();
    let capture = record(tmp.path(), "run.fstats", 3);

    let output = framestat(&["frame", "--frame", "40"], &[&capture]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error: frame 40"), "stderr: {stderr}");
}

#[test]
fn raw_capture_is_described_but_not_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let capture = record(tmp.path(), "run.fstatsraw", 3);

    let info = stdout_of(&framestat(&["info"], &[&capture]));
    assert!(info.contains("raw"), "info: {info}");

    let output = framestat(&["top"], &[&capture]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("raw capture"), "stderr: {stderr}");
}

#[test]
fn unreadable_file_exits_with_error() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("junk.fstats");
    std::fs::write(&path, b"not a capture at all").unwrap();

    let output = framestat(&["info"], &[&path]);
    assert_eq!(output.status.code(), Some(1));
}
