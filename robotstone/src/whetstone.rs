/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Calibrated synthetic floating-point workload.
//!
//! [`execute`] burns `kwi` Kilo-Whetstone Instructions: each unit runs one
//! pass of the classic Whetstone cycle (array arithmetic, procedure calls,
//! transcendental functions) sized to 1000 nominal instructions. The content
//! of the computation is irrelevant; only that it costs a stable, calibrated
//! amount of CPU.

use std::hint::black_box;

const T: f64 = 0.499_975;
const T1: f64 = 0.500_25;
const T2: f64 = 2.0;

/// Execute `kwi` Kilo-Whetstone Instructions.
///
/// A workload of zero returns immediately; synthetic tasks with no
/// processing component rely on that.
pub fn execute(kwi: u64) {
    for _ in 0..kwi {
        black_box(cycle());
    }
}

/// One 1000-instruction Whetstone pass.
fn cycle() -> f64 {
    let mut e1 = [0.0f64; 4];

    // Module 1: simple identifiers
    let mut x1 = 1.0f64;
    let mut x2 = -1.0f64;
    let mut x3 = -1.0f64;
    let mut x4 = -1.0f64;
    for _ in 0..12 {
        x1 = (x1 + x2 + x3 - x4) * T;
        x2 = (x1 + x2 - x3 + x4) * T;
        x3 = (x1 - x2 + x3 + x4) * T;
        x4 = (-x1 + x2 + x3 + x4) * T;
    }

    // Module 2: array elements
    e1[0] = 1.0;
    e1[1] = -1.0;
    e1[2] = -1.0;
    e1[3] = -1.0;
    for _ in 0..14 {
        e1[0] = (e1[0] + e1[1] + e1[2] - e1[3]) * T;
        e1[1] = (e1[0] + e1[1] - e1[2] + e1[3]) * T;
        e1[2] = (e1[0] - e1[1] + e1[2] + e1[3]) * T;
        e1[3] = (-e1[0] + e1[1] + e1[2] + e1[3]) * T;
    }

    // Module 3: array as parameter
    for _ in 0..34 {
        pa(&mut e1);
    }

    // Module 4: conditional jumps
    let mut j = 1i32;
    for _ in 0..45 {
        j = if j == 1 { 2 } else { 3 };
        j = if j > 2 { 0 } else { 1 };
        j = if j < 1 { 1 } else { 0 };
    }

    // Module 6: integer arithmetic
    let mut ij = 1i64;
    let mut ik = 2i64;
    let mut il = 3i64;
    for _ in 0..90 {
        ij = ij * (ik - ij) * (il - ik);
        ik = il * ik - (il - ij) * ik;
        il = (il - ik) * (ik + ij);
        e1[(il - 2).rem_euclid(4) as usize] = (ij + ik + il) as f64;
        e1[(ik - 2).rem_euclid(4) as usize] = (ij * ik * il) as f64;
    }

    // Module 7: trigonometric functions
    let mut x = 0.5f64;
    let mut y = 0.5f64;
    for _ in 0..6 {
        x = T2 * ((x + y).sin() * (x + y).cos()).atan2(x.cos() + y.cos() - 1.0) * T;
        y = T2 * ((x + y).sin() * (x + y).cos()).atan2(x.cos() + y.cos() - 1.0) * T;
    }

    // Module 8: procedure calls
    let mut p_x = 1.0f64;
    let mut p_y = 1.0f64;
    let mut p_z = 1.0f64;
    for _ in 0..18 {
        p3(p_x, p_y, &mut p_z);
        p_x = p_z * T1;
        p_y = p_z;
    }

    // Module 11: standard functions
    let mut w = 0.75f64;
    for _ in 0..11 {
        w = (w.ln().exp() / T1).sqrt();
    }

    x1 + x2 + x3 + x4 + e1[0] + e1[3] + j as f64 + x + y + p_z + w
}

fn pa(e: &mut [f64; 4]) {
    for _ in 0..6 {
        e[0] = (e[0] + e[1] + e[2] - e[3]) * T;
        e[1] = (e[0] + e[1] - e[2] + e[3]) * T;
        e[2] = (e[0] - e[1] + e[2] + e[3]) * T;
        e[3] = (-e[0] + e[1] + e[2] + e[3]) / T2;
    }
}

fn p3(x: f64, y: f64, z: &mut f64) {
    let x1 = T * (*z + x);
    let y1 = T * (x1 + y);
    *z = (x1 + y1) / T2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workload_is_a_noop() {
        execute(0);
    }

    #[test]
    fn cycle_produces_finite_result() {
        assert!(cycle().is_finite());
    }

    #[test]
    fn larger_workloads_take_longer() {
        // Coarse calibration sanity: 200 units must cost visibly more than 1.
        let t0 = std::time::Instant::now();
        execute(1);
        let small = t0.elapsed();

        let t1 = std::time::Instant::now();
        execute(200);
        let large = t1.elapsed();

        assert!(large > small);
    }
}
