//! Accuracy validation: compute-bound scopes with known ratios.
//!
//! Run with: cargo test -p framestat-runtime --test accuracy -- --ignored --nocapture

use std::time::{Duration, Instant};

use framestat_runtime::tsc::cycles_to_ms;
use framestat_runtime::{Collector, StatMessage, StatsConfig, StatsThread, ThreadStats, ThreadType};

/// CPU-bound workload: wrapping arithmetic over a buffer.
fn burn_cpu(iterations: u64) {
    let mut buf = [0x42u8; 4096];
    for i in 0..iterations {
        for b in &mut buf {
            *b = b.wrapping_add(i as u8).wrapping_mul(31);
        }
    }
    std::hint::black_box(&buf);
}

/// Run `body` as frame 1 of a fresh pipeline and return frame 1's
/// exclusive stats plus seconds per cycle.
fn one_frame(body: impl FnOnce(&Collector, &ThreadStats)) -> (Vec<StatMessage>, f64) {
    let (stats, collector) = StatsThread::start(StatsConfig::default()).unwrap();
    let game = collector.thread_stats("GameThread", ThreadType::Game);
    body(&collector, &game);
    game.advance_frame(2, false);
    stats
        .with_state(|state| {
            let exclusive = state.exclusive_aggregate_stack_stats(1, None, false).unwrap();
            (exclusive, state.seconds_per_cycle(1).unwrap())
        })
        .unwrap()
}

fn self_ms(stats: &[StatMessage], short: &str, spc: f64) -> f64 {
    let item = stats
        .iter()
        .find(|m| m.name.short_name().as_str() == short)
        .unwrap();
    cycles_to_ms(item.duration() as f64, spc)
}

#[test]
#[ignore]
fn compute_ratio_accuracy() {
    let (stats, spc) = one_frame(|collector, game| {
        let main = collector.declare_cycle_stat("bench_main", "STATGROUP_Accuracy");
        let heavy = collector.declare_cycle_stat("heavy", "STATGROUP_Accuracy");
        let light = collector.declare_cycle_stat("light", "STATGROUP_Accuracy");
        let _main = game.scope(main);
        {
            let _heavy = game.scope(heavy);
            burn_cpu(100_000);
        }
        {
            let _light = game.scope(light);
            burn_cpu(10_000);
        }
    });

    let heavy = self_ms(&stats, "heavy", spc);
    let light = self_ms(&stats, "light", spc);
    let ratio = heavy / light;
    let expected_ratio = 10.0;
    let error_pct = ((ratio - expected_ratio) / expected_ratio).abs() * 100.0;

    eprintln!("heavy: {heavy:.3}ms, light: {light:.3}ms");
    eprintln!("ratio: {ratio:.2} (expected {expected_ratio:.1}, error {error_pct:.1}%)");

    assert!(
        error_pct < 5.0,
        "ratio {ratio:.2} deviates from expected {expected_ratio:.1} by {error_pct:.1}% (limit 5%)"
    );
}

#[test]
#[ignore]
fn scope_time_matches_wall_clock() {
    let mut wall = Duration::ZERO;
    let (stats, spc) = one_frame(|collector, game| {
        let spin = collector.declare_cycle_stat("spin", "STATGROUP_Accuracy");
        let _spin = game.scope(spin);
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(20) {}
        wall = start.elapsed();
    });

    let measured = self_ms(&stats, "spin", spc);
    let expected = wall.as_secs_f64() * 1000.0;
    let error_pct = ((measured - expected) / expected).abs() * 100.0;
    eprintln!("spin: {measured:.3}ms, wall: {expected:.3}ms, error {error_pct:.1}%");
    assert!(error_pct < 10.0, "spin scope off by {error_pct:.1}%");
}
