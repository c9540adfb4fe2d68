/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Task-set utilization accounting and schedulability advisory.
//!
//! The controllers log a warning when a step's configuration exceeds the
//! Liu & Layland rate-monotonic bound — advisory only, because driving the
//! task set past schedulability is precisely how the benchmark finds its
//! breaking point. The bound contextualises at which step the deadline
//! misses become a mathematical certainty rather than a platform artifact.
//!
//! **Liu & Layland (1973)**: `n` independent periodic tasks under
//! rate-monotonic priorities are guaranteed schedulable on one CPU if
//!
//! `U = Σ C_i/T_i ≤ n × (2^(1/n) − 1)`
//!
//! Here utilization is expressed in workload terms: a task consuming
//! `KWIPS_i = frequency_i × KWIPP_i` out of a processor delivering
//! `raw_speed` KWIPS contributes `KWIPS_i / raw_speed`.

use crate::task::SyntheticTask;

/// Liu & Layland utilisation bound for `n` tasks.
///
/// `1.0` for a single task, tightening toward `ln(2) ≈ 0.693` as `n` grows;
/// `0.0` for an empty set.
pub fn liu_layland_bound(n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let nf = n as f64;
    nf * (2.0_f64.powf(1.0 / nf) - 1.0)
}

/// Total utilisation fraction of the task set against `raw_speed` KWIPS.
pub fn total_utilization(tasks: &[SyntheticTask], raw_speed: u64) -> f64 {
    tasks.iter().map(|t| t.kwips()).sum::<f64>() / raw_speed as f64
}

/// Check the set against the rate-monotonic bound.
///
/// `None` when provably schedulable; `Some(total_utilization)` when the
/// bound is exceeded and the caller should warn.
pub fn check_rate_monotonic(tasks: &[SyntheticTask], raw_speed: u64) -> Option<f64> {
    if tasks.is_empty() {
        return None;
    }
    let u = total_utilization(tasks, raw_speed);
    if u > liu_layland_bound(tasks.len()) {
        Some(u)
    } else {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::rt::shm::SharedControl;
    use std::sync::Arc;

    fn make_task(id: u8, frequency: f64, kwipp: u64) -> SyntheticTask {
        let ns = format!(
            "rstone_feas_{}_{}_{id}",
            std::process::id(),
            clock::now() % 1_000_000
        );
        let ctrl = SharedControl::open(&ns, true).unwrap();
        ctrl.unlink();
        let task = SyntheticTask::new(id, 2, Arc::new(ctrl));
        task.set_frequency(frequency);
        task.set_kwipp(kwipp);
        task
    }

    #[test]
    fn bound_zero_tasks_is_zero() {
        assert_eq!(liu_layland_bound(0), 0.0);
    }

    #[test]
    fn bound_one_task_is_one() {
        assert!((liu_layland_bound(1) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn bound_two_tasks_is_approximately_0_828() {
        assert!((liu_layland_bound(2) - 0.8284).abs() < 1e-3);
    }

    #[test]
    fn bound_converges_toward_ln2() {
        assert!((liu_layland_bound(1000) - 2.0_f64.ln()).abs() < 1e-3);
    }

    #[test]
    fn baseline_sized_set_is_feasible() {
        // 15 % of raw speed spread over three tasks sits far under the bound.
        let raw = 100_000;
        let tasks = vec![
            make_task(1, 7.0, 714),  // ≈ 5 %
            make_task(2, 5.0, 1000), // 5 %
            make_task(3, 3.0, 1666), // ≈ 5 %
        ];
        assert!(check_rate_monotonic(&tasks, raw).is_none());
    }

    #[test]
    fn overloaded_set_exceeds_bound() {
        let raw = 100_000;
        let tasks = vec![
            make_task(1, 10.0, 3_500), // 35 %
            make_task(2, 10.0, 3_500),
            make_task(3, 10.0, 3_500),
        ];
        let u = check_rate_monotonic(&tasks, raw).expect("1.05 utilization must trip the bound");
        assert!((u - 1.05).abs() < 1e-6);
    }

    #[test]
    fn empty_set_is_trivially_feasible() {
        assert!(check_rate_monotonic(&[], 100_000).is_none());
    }
}
