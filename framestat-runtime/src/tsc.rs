//! Fast inline timestamp via hardware counter (TSC on x86_64, CNTVCT on aarch64).
//!
//! Scope records carry raw counter ticks ("cycles"). Converting them to
//! time needs the tick rate, calibrated once on first use and published
//! with the capture as `STAT_SecondsPerCycle`.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static SECONDS_PER_CYCLE: OnceLock<f64> = OnceLock::new();

/// Read the hardware cycle counter. Single inline instruction on both
/// x86_64 (`rdtsc`) and aarch64 (`mrs cntvct_el0`).
#[inline(always)]
pub fn read() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(target_arch = "aarch64")]
    {
        let val: u64;
        unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) val) };
        val
    }
    // Fallback: nanoseconds since the first read.
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        static FALLBACK_EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = FALLBACK_EPOCH.get_or_init(Instant::now);
        Instant::now().duration_since(*epoch).as_nanos() as u64
    }
}

/// Counter value as carried by scope records.
#[inline(always)]
pub fn cycles() -> i64 {
    (read() & i64::MAX as u64) as i64
}

/// Calibrate the counter rate, once per process.
pub fn ensure_calibrated() {
    seconds_per_cycle();
}

/// Seconds per counter tick, measured against `Instant` over a ~2ms spin
/// on first call.
pub fn seconds_per_cycle() -> f64 {
    *SECONDS_PER_CYCLE.get_or_init(calibrate)
}

fn calibrate() -> f64 {
    if cfg!(not(any(target_arch = "x86_64", target_arch = "aarch64"))) {
        return 1e-9;
    }
    let wall_start = Instant::now();
    let start = read();
    while wall_start.elapsed() < Duration::from_millis(2) {
        std::hint::spin_loop();
    }
    let ticks = read().wrapping_sub(start).max(1);
    wall_start.elapsed().as_secs_f64() / ticks as f64
}

/// Milliseconds for `cycles` at `seconds_per_cycle`.
pub fn cycles_to_ms(cycles: f64, seconds_per_cycle: f64) -> f64 {
    cycles * seconds_per_cycle * 1000.0
}

/// Cycles in `ms` milliseconds at `seconds_per_cycle`.
pub fn ms_to_cycles(ms: f64, seconds_per_cycle: f64) -> i64 {
    if seconds_per_cycle <= 0.0 {
        return 0;
    }
    (ms / 1000.0 / seconds_per_cycle).round() as i64
}
