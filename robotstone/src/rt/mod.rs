/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Real-time process and thread services.
//!
//! Tasks are OS threads scheduled under `SCHED_FIFO` with numeric priorities
//! (higher number preempts lower; equal priorities run FIFO). When the
//! process lacks the privilege to enter a real-time class the spawn degrades
//! to the default policy with a single warning — measurements are then only
//! indicative, but every functional path still works, which is what test
//! runs need.

pub mod shm;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::{BenchError, BenchResult};

/// Default stack reservation for a synthetic task thread.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Lock the process address space into RAM.
///
/// Paging in the middle of a timed job would show up as a phantom deadline
/// miss; a failure here (usually missing privilege) downgrades to a warning.
pub fn init_process() {
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        warn!(
            error = %crate::clock::os_error(),
            "mlockall failed; memory may be paged during measurements"
        );
    }
}

/// Spawn a named thread and move it into `SCHED_FIFO` at `priority` before
/// running `f`.
pub fn spawn_rt<F, T>(name: &str, priority: u8, f: F) -> BenchResult<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(thread_name.clone())
        .stack_size(DEFAULT_STACK_SIZE)
        .spawn(move || {
            set_current_priority(priority);
            f()
        })
        .map_err(|source| BenchError::Spawn {
            name: name.to_string(),
            source,
        })
}

/// Apply `SCHED_FIFO` with `priority` to the calling thread.
///
/// Returns `true` when the real-time class was entered. The first refusal
/// prints the capability hint; later refusals stay silent so a fully
/// unprivileged run is not drowned in warnings.
pub fn set_current_priority(priority: u8) -> bool {
    static PRIVILEGE_WARNED: AtomicBool = AtomicBool::new(false);

    let param = libc::sched_param {
        sched_priority: priority as libc::c_int,
    };
    let tid = unsafe { libc::gettid() };
    let rc = unsafe { libc::sched_setscheduler(tid, libc::SCHED_FIFO, &param) };

    if rc == 0 {
        debug!(tid, priority, "entered SCHED_FIFO");
        true
    } else {
        if !PRIVILEGE_WARNED.swap(true, Ordering::Relaxed) {
            warn!(
                priority,
                error = %crate::clock::os_error(),
                "couldn't enter SCHED_FIFO; run with CAP_SYS_NICE (e.g. \
                 `sudo setcap cap_sys_nice+ep <binary>`) for real-time scheduling"
            );
        }
        false
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
