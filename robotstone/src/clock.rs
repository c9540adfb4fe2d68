/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Monotonic tick source and wrap-safe tick arithmetic.
//!
//! One tick is one nanosecond of `CLOCK_MONOTONIC`. Every duration the
//! benchmark measures (response times, periods, the test-step length) is a
//! tick count, and every comparison between two instants goes through the
//! wrap-safe helpers here instead of bare subtraction.
//!
//! The pure helpers are free functions so they can be tested without touching
//! the system clock.

use std::io;
use std::mem::MaybeUninit;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Tick values are monotonic nanosecond counts.
pub type Tick = u64;

/// Ticks per second: nanosecond resolution, well under the 1 µs the
/// measurements require.
pub const TICKS_PER_SECOND: Tick = 1_000_000_000;

/// Maximum representable tick value, used by the wrap-safe subtraction.
///
/// The kernel hands out signed 64-bit nanosecond counts, so the clock wraps
/// at `i64::MAX` rather than `u64::MAX`.
pub const TICK_MAX: Tick = i64::MAX as Tick;

// ── Clock access ──────────────────────────────────────────────────────────────

/// Current `CLOCK_MONOTONIC` reading in ticks.
pub fn now() -> Tick {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    let ts = unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr());
        ts.assume_init()
    };
    ts.tv_sec as Tick * TICKS_PER_SECOND + ts.tv_nsec as Tick
}

/// Tick count corresponding to one second.
pub fn ticks_per_second() -> Tick {
    TICKS_PER_SECOND
}

/// Suspend the caller for a relative number of ticks.
pub fn sleep(ticks: Tick) {
    sleep_until(now().wrapping_add(ticks) & TICK_MAX);
}

/// Suspend the caller until the absolute instant `deadline`.
///
/// Uses `clock_nanosleep(TIMER_ABSTIME)` so repeated calls against a
/// pre-computed activation schedule do not accumulate drift. A deadline in
/// the past returns immediately.
pub fn sleep_until(deadline: Tick) {
    let ts = libc::timespec {
        tv_sec: (deadline / TICKS_PER_SECOND) as libc::time_t,
        tv_nsec: (deadline % TICKS_PER_SECOND) as libc::c_long,
    };
    loop {
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        if rc != libc::EINTR {
            return;
        }
    }
}

/// Clock-derived entropy for publisher/subscriber handle ids.
///
/// Not a random number generator: the low bits of the monotonic clock mixed
/// with the pid are merely unlikely to collide, and callers retry on
/// collision within a topic's handle set.
pub fn handle_entropy() -> u32 {
    let t = now();
    let pid = unsafe { libc::getpid() } as Tick;
    (t ^ (t >> 17) ^ pid) as u32
}

// ── Wrap-safe arithmetic ──────────────────────────────────────────────────────

/// Ticks elapsed from `activation` to `completion`, tolerating one wrap of
/// the clock: if `completion < activation` the interval is
/// `TICK_MAX − activation + completion`.
pub fn elapsed(activation: Tick, completion: Tick) -> Tick {
    if completion >= activation {
        completion - activation
    } else {
        TICK_MAX - activation + completion
    }
}

/// Number of whole periods a response time spans.
///
/// `1` means the job fit inside its period (deadline met); `k > 1` means the
/// deadline was missed and `k − 1` subsequent periods were consumed. The
/// degenerate `response == 0` counts as meeting the deadline:
///
/// `k = 1 if response == 0 else 1 + (response − 1) / period`
pub fn periods_spanned(response: Tick, period: Tick) -> Tick {
    if response == 0 {
        1
    } else {
        1 + (response - 1) / period
    }
}

/// Activation period, in ticks, for a frequency in Hz.
///
/// Rounded to the nearest tick so that `period` and `frequency` agree within
/// one tick however the caller derived them.
pub fn period_from_frequency(frequency: f64) -> Tick {
    (TICKS_PER_SECOND as f64 / frequency).round() as Tick
}

/// Frequency in Hz for an activation period in ticks.
pub fn frequency_from_period(period: Tick) -> f64 {
    TICKS_PER_SECOND as f64 / period as f64
}

/// Tick count rendered as seconds, for reporting.
pub fn to_secs(ticks: Tick) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Last OS error as `io::Error`, shared by the libc-backed modules.
pub(crate) fn os_error() -> io::Error {
    io::Error::last_os_error()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── elapsed ───────────────────────────────────────────────────────────────

    #[test]
    fn elapsed_simple_interval() {
        assert_eq!(elapsed(1_000, 1_500), 500);
    }

    #[test]
    fn elapsed_zero_interval() {
        assert_eq!(elapsed(42, 42), 0);
    }

    #[test]
    fn elapsed_across_wraparound() {
        // completion < activation: interval is TICK_MAX - activation + completion
        let activation = TICK_MAX - 100;
        let completion = 50;
        assert_eq!(elapsed(activation, completion), 150);
    }

    // ── periods_spanned ───────────────────────────────────────────────────────

    #[test]
    fn zero_response_meets_deadline() {
        assert_eq!(periods_spanned(0, 1_000), 1);
    }

    #[test]
    fn response_inside_period_spans_one() {
        assert_eq!(periods_spanned(1, 1_000), 1);
        assert_eq!(periods_spanned(999, 1_000), 1);
    }

    #[test]
    fn response_exactly_at_period_spans_one() {
        // deadline == period is still met
        assert_eq!(periods_spanned(1_000, 1_000), 1);
    }

    #[test]
    fn response_one_past_period_spans_two() {
        assert_eq!(periods_spanned(1_001, 1_000), 2);
    }

    #[test]
    fn response_many_periods() {
        assert_eq!(periods_spanned(3_000, 1_000), 3);
        assert_eq!(periods_spanned(3_001, 1_000), 4);
    }

    // ── period / frequency conversions ────────────────────────────────────────

    #[test]
    fn period_for_baseline_frequencies() {
        // 63 Hz: 1e9 / 63 = 15_873_015.87... → rounds up
        assert_eq!(period_from_frequency(63.0), 15_873_016);
        assert_eq!(period_from_frequency(10.0), 100_000_000);
        assert_eq!(period_from_frequency(1.0), TICKS_PER_SECOND);
    }

    #[test]
    fn period_round_trips_within_one_tick() {
        for freq in [63.0, 30.0, 14.0, 10.0, 7.0, 6.0, 5.0, 3.0] {
            let period = period_from_frequency(freq);
            let back = period_from_frequency(frequency_from_period(period));
            assert!(
                back.abs_diff(period) <= 1,
                "frequency {freq}: period {period} round-tripped to {back}"
            );
        }
    }

    #[test]
    fn to_secs_converts() {
        assert_eq!(to_secs(TICKS_PER_SECOND), 1.0);
        assert_eq!(to_secs(TICKS_PER_SECOND / 2), 0.5);
    }

    // ── live clock ────────────────────────────────────────────────────────────

    #[test]
    fn now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn sleep_until_past_deadline_returns() {
        // Must not block on an already-elapsed instant.
        sleep_until(now().saturating_sub(TICKS_PER_SECOND));
    }

    #[test]
    fn handle_entropy_varies() {
        // Two draws separated by a clock read are allowed to collide, just
        // not systematically.
        let draws: Vec<u32> = (0..16).map(|_| handle_entropy()).collect();
        let first = draws[0];
        assert!(draws.iter().any(|&d| d != first));
    }
}
