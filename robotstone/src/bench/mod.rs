/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Shared experiment-controller core.
//!
//! Everything both node roles need: the management wire constants, the
//! two-step handshake over the management topics, the raw-speed calibrator,
//! the cumulative worst-case record, and the step-teardown helpers. The
//! Master- and Slave-specific state machines live in [`master`] and
//! [`slave`].

pub mod master;
pub mod slave;

use tracing::warn;

use crate::clock::{self, Tick};
use crate::error::{BenchError, BenchResult};
use crate::pubsub::{Publisher, Receipt, Subscriber, TopicTable, TOPIC_MASTER_TO_SLAVE, TOPIC_SLAVE_TO_MASTER};
use crate::rt::shm::SharedControl;
use crate::task::SyntheticTask;
use crate::whetstone;

// ── Management wire constants ─────────────────────────────────────────────────

/// Handshake sentinel, protocol step 1.
pub const STEP1: u16 = 666;
/// Handshake sentinel, protocol step 2.
pub const STEP2: u16 = 667;
/// Precedes the slave's per-step deadline count.
pub const DEADLINE_HANDSHAKE: u16 = 777;
/// Slave → Master: process is up.
pub const IS_STARTED: u16 = 0;
/// Master → Slave: experiment over, shut down.
pub const IS_FINISHED: u16 = 1;
/// Master → Slave: another step follows.
pub const IS_RUN: u16 = 2;

/// Management messages are single 16-bit little-endian words.
pub const MGMT_MSG_SIZE: usize = 2;

// ── Task-set constants ────────────────────────────────────────────────────────

/// Management task priority; between the synthetic tasks and the topic
/// gatekeepers. The gaps are load-bearing.
pub const MANAGEMENT_PRIORITY: u8 = 50;

/// Priority of the lowest-priority task in either baseline set.
pub const BASELINE_PRIORITY: u8 = 2;

/// Processing-domain baseline: five tasks.
pub const PD_BASELINE_FREQUENCIES: [u64; 5] = [63, 30, 14, 10, 6];

/// Processing-communication-domain baseline: three tasks.
pub const PCD_BASELINE_FREQUENCIES: [u64; 3] = [7, 5, 3];

/// Minimal message length for the PCD baseline, in bytes.
pub const PCD_BASELINE_MESSAGE_SIZE: usize = 8;

/// KWI executed per raw-speed calibration iteration.
pub const RAW_SINGLE_LOAD: u64 = 30;

/// Share of the raw speed the baseline task set consumes.
pub const BASELINE_UTILIZATION: f64 = 0.15;

// ── Baseline derivation ───────────────────────────────────────────────────────

/// Per-task baseline workloads: an equal slice of
/// `BASELINE_UTILIZATION × raw_speed` KWIPS divided by each task's
/// frequency, floored to whole KWIPP.
pub fn baseline_workloads(raw_speed: u64, frequencies: &[u64]) -> Vec<u64> {
    let per_task_kwips = (raw_speed as f64 * BASELINE_UTILIZATION) as u64 / frequencies.len() as u64;
    frequencies.iter().map(|f| per_task_kwips / f).collect()
}

// ── Raw-speed calibrator ──────────────────────────────────────────────────────

/// Measure the local processor's raw speed in KWIPS.
///
/// Runs [`RAW_SINGLE_LOAD`]-KWI batches until the accumulated wall time
/// reaches `raw_single_load` seconds; the iteration count then *is* the
/// KWIPS figure (each iteration contributes `RAW_SINGLE_LOAD` KWI over a
/// total of `RAW_SINGLE_LOAD` seconds).
pub fn calibrate_raw_speed() -> u64 {
    calibrate_over(RAW_SINGLE_LOAD * clock::ticks_per_second())
}

/// Calibration core with an explicit measurement interval.
pub fn calibrate_over(raw_interval: Tick) -> u64 {
    let mut reached: Tick = 0;
    let mut speed: u64 = 0;

    while reached < raw_interval {
        let start = clock::now();
        whetstone::execute(RAW_SINGLE_LOAD);
        reached += clock::elapsed(start, clock::now());
        speed += 1;
    }
    speed
}

// ── Worst-case scenario ───────────────────────────────────────────────────────

/// The step/task pair with the worst ratio of WCRT to average response,
/// cumulative across the whole experiment.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorstCaseScenario {
    pub step: u32,
    pub task_id: u8,
    pub wcrt_secs: f64,
    pub avg_response_secs: f64,
}

impl WorstCaseScenario {
    /// Offer one task's step results; keeps whichever candidate has the
    /// higher `WCRT / average` ratio. Tasks that completed no job this step
    /// (zero average) are skipped.
    pub fn consider(&mut self, step: u32, task_id: u8, wcrt_secs: f64, avg_response_secs: f64) {
        if avg_response_secs <= 0.0 {
            return;
        }
        let candidate = wcrt_secs / avg_response_secs;
        let current = if self.avg_response_secs > 0.0 {
            self.wcrt_secs / self.avg_response_secs
        } else {
            0.0
        };
        if self.avg_response_secs == 0.0 || candidate > current {
            self.step = step;
            self.task_id = task_id;
            self.wcrt_secs = wcrt_secs;
            self.avg_response_secs = avg_response_secs;
        }
    }

    /// Fold a whole task set's step results in.
    pub fn update(&mut self, step: u32, tasks: &[SyntheticTask]) {
        for task in tasks {
            let stats = task.stats();
            self.consider(
                step,
                task.id(),
                clock::to_secs(stats.wcrt),
                clock::to_secs(stats.avg_response),
            );
        }
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Two-step management handshake over the reserved topic pair.
///
/// Both directions follow the same protocol; any unexpected value is a
/// [`BenchError::HandshakeDesync`], after which the benchmark is invalid and
/// both peers abort. The inter-message delays are one fifth of a second;
/// the trailing full-second delay on the send side lets the peer's bounded
/// queue settle before the next transaction begins.
pub struct Handshake {
    publisher: Publisher,
    subscriber: Subscriber,
}

impl Handshake {
    /// Master direction: publish on topic 0, subscribe on topic 1.
    pub fn master(table: &TopicTable) -> BenchResult<Self> {
        Ok(Self {
            publisher: table.publishing_request(TOPIC_MASTER_TO_SLAVE, MGMT_MSG_SIZE)?,
            subscriber: table.subscribing_request(TOPIC_SLAVE_TO_MASTER, MGMT_MSG_SIZE)?,
        })
    }

    /// Slave direction: publish on topic 1, subscribe on topic 0.
    pub fn slave(table: &TopicTable) -> BenchResult<Self> {
        Ok(Self {
            publisher: table.publishing_request(TOPIC_SLAVE_TO_MASTER, MGMT_MSG_SIZE)?,
            subscriber: table.subscribing_request(TOPIC_MASTER_TO_SLAVE, MGMT_MSG_SIZE)?,
        })
    }

    /// Send `msg` to the peer under the handshake protocol.
    pub fn send(&self, msg: u16) -> BenchResult<()> {
        let fifth = clock::ticks_per_second() / 5;

        clock::sleep(fifth);
        self.put(STEP1)?;
        if self.take() != STEP1 {
            return Err(BenchError::HandshakeDesync {
                side: "Send",
                step: 1,
            });
        }
        clock::sleep(fifth);
        self.put(msg)?;
        if self.take() != STEP2 {
            return Err(BenchError::HandshakeDesync {
                side: "Send",
                step: 2,
            });
        }
        // Settling time for the peer side of the bounded queue.
        clock::sleep(clock::ticks_per_second());
        Ok(())
    }

    /// Receive one value from the peer under the handshake protocol.
    pub fn receive(&self) -> BenchResult<u16> {
        let fifth = clock::ticks_per_second() / 5;

        if self.take() != STEP1 {
            return Err(BenchError::HandshakeDesync {
                side: "Receive",
                step: 1,
            });
        }
        clock::sleep(fifth);
        self.put(STEP1)?;
        let msg = self.take();
        clock::sleep(fifth);
        self.put(STEP2)?;
        Ok(msg)
    }

    fn put(&self, value: u16) -> BenchResult<()> {
        self.publisher.send(&value.to_le_bytes())
    }

    fn take(&self) -> u16 {
        let mut buf = [0u8; MGMT_MSG_SIZE];
        loop {
            // The management subscriber has no unblocker; Unblocked only
            // means the fabric is mid-teardown, so keep waiting.
            if self.subscriber.receive(&mut buf) == Receipt::Message {
                return u16::from_le_bytes(buf);
            }
        }
    }
}

// ── Step teardown helpers ─────────────────────────────────────────────────────

/// Wait for every synthetic task to leave its superloop (Master flavor).
///
/// The one-second sleep bridges the gap between setting the stop flag and
/// the slowest task's next stop check; publisher tasks never block at step
/// end, so a plain join suffices.
pub(crate) fn wait_tasks_finish(tasks: &mut [SyntheticTask]) {
    clock::sleep(clock::ticks_per_second());
    for task in tasks.iter_mut() {
        task.join();
    }
}

/// Wait for every synthetic task to leave its superloop (Slave flavor).
///
/// A subscriber parked in `receive` never reaches the stop check on its
/// own, so each task gets an unblock kick before the join. The kick only
/// counts once the Master's stop flag is visible — the flag is written a
/// settling delay after the wake handshake, so this waits it out rather
/// than racing it. Unblocking a task that already exited is a no-op.
pub(crate) fn wait_tasks_finish_unblocking(tasks: &mut [SyntheticTask], ctrl: &SharedControl) {
    clock::sleep(clock::ticks_per_second());
    while !ctrl.is_stopped() {
        clock::sleep(clock::ticks_per_second() / 100);
    }
    for task in tasks.iter_mut() {
        task.unblock();
        task.join();
    }
}

/// Sum of deadline misses across the local task set for this step.
pub(crate) fn total_deadline_miss(tasks: &[SyntheticTask]) -> u32 {
    tasks.iter().map(|t| t.stats().missed).sum()
}

/// Clear every task's measurements and release the set into the next step.
pub(crate) fn clear_and_restart(tasks: &mut [SyntheticTask]) -> BenchResult<()> {
    for task in tasks.iter_mut() {
        task.clear_measurements();
        task.start()?;
    }
    Ok(())
}

/// Advisory schedulability note, logged before a step runs.
pub(crate) fn warn_if_infeasible(tasks: &[SyntheticTask], raw_speed: u64) {
    if let Some(u) = crate::feasibility::check_rate_monotonic(tasks, raw_speed) {
        warn!(
            utilization = u,
            bound = crate::feasibility::liu_layland_bound(tasks.len()),
            task_count = tasks.len(),
            "task set exceeds the rate-monotonic bound; deadline misses are expected"
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
