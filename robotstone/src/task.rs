/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Synthetic periodic tasks.
//!
//! A [`SyntheticTask`] is one member of the benchmark task set: a periodic
//! job that optionally receives one message, burns a calibrated workload,
//! optionally publishes one message, and accounts its own response-time and
//! deadline behavior. The controller owns the descriptor; the release loop
//! runs on a dedicated `SCHED_FIFO` thread started once per test step.
//!
//! # Release loop
//!
//! Every task in the set shares a common epoch: the controller snapshots
//! `initial_time` immediately before broadcasting the start signal, and each
//! task initializes its first activation from that snapshot. Per job:
//! receive (blocking, if subscribed) → workload → publish (non-blocking, if
//! publishing) → stop check → measure. The activation then advances by
//! `k × period` where `k` is the number of periods the response spanned, so
//! a missed deadline skips the consumed periods instead of letting the
//! schedule drift.
//!
//! # Accounting contract
//!
//! The interrupted final job is excluded: the stop check precedes the
//! measurement, and the accumulated response and jitter are divided by the
//! count of *completed* jobs (`jobs_started − 1`). The first job contributes
//! no jitter term (it has no predecessor), so the jitter average runs over
//! one fewer sample than its divisor — that is the documented behavior, not
//! an accident to fix.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::trace;

use crate::clock::{self, Tick};
use crate::error::{BenchError, BenchResult};
use crate::pubsub::{Publisher, Receipt, Subscriber, TopicTable, Unblocker, FIRST_DATA_TOPIC};
use crate::rt;
use crate::rt::shm::SharedControl;
use crate::whetstone;

// ── Per-step statistics ───────────────────────────────────────────────────────

/// Measurements of one task over one test step.
///
/// While the step runs, `response_acc`/`jitter_acc` accumulate tick sums;
/// [`StepStats::finalize`] turns them into the per-job averages the report
/// reads.
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    pub met: u32,
    pub missed: u32,
    pub skipped: u32,
    pub wcrt: Tick,
    pub bcrt: Tick,
    pub avg_response: Tick,
    pub avg_jitter: Tick,
    response_acc: Tick,
    jitter_acc: Tick,
    prev_response: Option<Tick>,
}

/// Initial best-case marker: any real response undercuts 100 seconds.
const BCRT_INIT: Tick = 100 * clock::TICKS_PER_SECOND;

impl StepStats {
    pub fn new() -> Self {
        Self {
            met: 0,
            missed: 0,
            skipped: 0,
            wcrt: 0,
            bcrt: BCRT_INIT,
            avg_response: 0,
            avg_jitter: 0,
            response_acc: 0,
            jitter_acc: 0,
            prev_response: None,
        }
    }

    /// Account one completed job; returns `k`, the number of periods the
    /// response spanned (`1` = deadline met).
    pub fn record(&mut self, response: Tick, period: Tick) -> Tick {
        self.response_acc += response;
        if let Some(prev) = self.prev_response {
            self.jitter_acc += response.abs_diff(prev);
        }
        self.prev_response = Some(response);

        if response > self.wcrt {
            self.wcrt = response;
        }
        if response < self.bcrt {
            self.bcrt = response;
        }

        let k = clock::periods_spanned(response, period);
        if k == 1 {
            self.met += 1;
        } else {
            self.missed += 1;
            self.skipped += (k - 1) as u32;
        }
        k
    }

    /// Convert the accumulated sums into per-job averages at step end.
    ///
    /// The divisor is the completed-job count; a step stopped before any
    /// job completed leaves both averages at zero.
    pub fn finalize(&mut self) {
        let completed = (self.met + self.missed) as Tick;
        if completed > 0 {
            self.avg_response = self.response_acc / completed;
            self.avg_jitter = self.jitter_acc / completed;
        }
    }

    /// Completed jobs this step.
    pub fn completed(&self) -> u32 {
        self.met + self.missed
    }

    /// Worst-case response jitter: the spread between the extremes.
    pub fn wcrj(&self) -> Tick {
        if self.bcrt == BCRT_INIT {
            0
        } else {
            self.wcrt - self.bcrt
        }
    }
}

impl Default for StepStats {
    fn default() -> Self {
        Self::new()
    }
}

// ── Task descriptor ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct TaskParams {
    frequency: f64,
    period: Tick,
    workload_kwi: u64,
}

#[derive(Debug)]
struct TaskIo {
    publisher: Option<Publisher>,
    subscriber: Option<Subscriber>,
}

/// State shared between the descriptor and the release-loop thread.
///
/// The controller only touches params/io between steps, after joining the
/// thread; the thread snapshots params once at entry and writes stats back
/// once at exit, so none of these locks is ever contended mid-measurement.
#[derive(Debug)]
struct TaskShared {
    params: Mutex<TaskParams>,
    io: Mutex<TaskIo>,
    stats: Mutex<StepStats>,
    unblock: Mutex<Option<Unblocker>>,
}

/// One synthetic task of the benchmark set.
#[derive(Debug)]
pub struct SyntheticTask {
    id: u8,
    priority: u8,
    name: String,
    shared: Arc<TaskShared>,
    ctrl: Arc<SharedControl>,
    handle: Option<JoinHandle<()>>,
}

impl SyntheticTask {
    /// Create the descriptor. No thread runs until [`SyntheticTask::start`].
    pub fn new(id: u8, priority: u8, ctrl: Arc<SharedControl>) -> Self {
        Self {
            id,
            priority,
            name: format!("task_{id}"),
            shared: Arc::new(TaskShared {
                params: Mutex::new(TaskParams {
                    frequency: 0.0,
                    period: 0,
                    workload_kwi: 0,
                }),
                io: Mutex::new(TaskIo {
                    publisher: None,
                    subscriber: None,
                }),
                stats: Mutex::new(StepStats::new()),
                unblock: Mutex::new(None),
            }),
            ctrl,
            handle: None,
        }
    }

    // ── Parameters ────────────────────────────────────────────────────────────

    /// Set the activation frequency in Hz; the period follows.
    pub fn set_frequency(&self, frequency: f64) {
        let mut p = self.shared.params.lock().unwrap();
        p.frequency = frequency;
        p.period = clock::period_from_frequency(frequency);
    }

    /// Set the activation period in ticks; the frequency follows.
    pub fn set_period(&self, period: Tick) {
        let mut p = self.shared.params.lock().unwrap();
        p.period = period;
        p.frequency = clock::frequency_from_period(period);
    }

    /// Set the per-period workload in KWIPP.
    pub fn set_kwipp(&self, kwipp: u64) {
        self.shared.params.lock().unwrap().workload_kwi = kwipp;
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn frequency(&self) -> f64 {
        self.shared.params.lock().unwrap().frequency
    }

    pub fn period(&self) -> Tick {
        self.shared.params.lock().unwrap().period
    }

    pub fn period_secs(&self) -> f64 {
        clock::to_secs(self.period())
    }

    pub fn kwipp(&self) -> u64 {
        self.shared.params.lock().unwrap().workload_kwi
    }

    /// Load this task puts on the processor, in KWI per second.
    pub fn kwips(&self) -> f64 {
        let p = self.shared.params.lock().unwrap();
        p.frequency * p.workload_kwi as f64
    }

    /// Share of the measured raw speed this task consumes, in percent.
    pub fn utilization(&self, raw_speed: u64) -> f64 {
        self.kwips() / raw_speed as f64 * 100.0
    }

    // ── Topic membership ──────────────────────────────────────────────────────

    /// Join `topic` as publisher with `msg_size`-byte messages.
    ///
    /// Topics 0 and 1 belong to the management channel and are refused.
    pub fn publishing_request(
        &self,
        table: &TopicTable,
        topic: u8,
        msg_size: usize,
    ) -> BenchResult<()> {
        check_data_topic(topic)?;
        let publisher = table.publishing_request(topic, msg_size)?;
        self.shared.io.lock().unwrap().publisher = Some(publisher);
        Ok(())
    }

    /// Join `topic` as subscriber with `msg_size`-byte messages.
    pub fn subscribing_request(
        &self,
        table: &TopicTable,
        topic: u8,
        msg_size: usize,
    ) -> BenchResult<()> {
        check_data_topic(topic)?;
        let subscriber = table.subscribing_request(topic, msg_size)?;
        *self.shared.unblock.lock().unwrap() = Some(subscriber.unblocker());
        self.shared.io.lock().unwrap().subscriber = Some(subscriber);
        Ok(())
    }

    /// Leave the published topic, possibly destroying it.
    pub fn leave_pub_topic(&self, table: &TopicTable) {
        if let Some(publisher) = self.shared.io.lock().unwrap().publisher.take() {
            table.leave_publisher(publisher);
        }
    }

    /// Leave the subscribed topic, possibly destroying it.
    pub fn leave_sub_topic(&self, table: &TopicTable) {
        *self.shared.unblock.lock().unwrap() = None;
        if let Some(subscriber) = self.shared.io.lock().unwrap().subscriber.take() {
            table.leave_subscriber(subscriber);
        }
    }

    pub fn pub_topic(&self) -> Option<u8> {
        self.shared.io.lock().unwrap().publisher.as_ref().map(|p| p.topic())
    }

    pub fn pub_message_size(&self) -> Option<usize> {
        self.shared
            .io
            .lock()
            .unwrap()
            .publisher
            .as_ref()
            .map(|p| p.message_size())
    }

    pub fn sub_topic(&self) -> Option<u8> {
        self.shared.io.lock().unwrap().subscriber.as_ref().map(|s| s.topic())
    }

    pub fn sub_message_size(&self) -> Option<usize> {
        self.shared
            .io
            .lock()
            .unwrap()
            .subscriber
            .as_ref()
            .map(|s| s.message_size())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Spawn the release-loop thread for one test step.
    ///
    /// The start epoch is sampled here, on the controller's thread, so a
    /// broadcast issued any time after `start` returns reaches this task
    /// even if its thread has not yet gone to sleep.
    pub fn start(&mut self) -> BenchResult<()> {
        debug_assert!(self.handle.is_none(), "task started while running");
        let shared = Arc::clone(&self.shared);
        let ctrl = Arc::clone(&self.ctrl);
        let epoch = self.ctrl.start_epoch();
        self.handle = Some(rt::spawn_rt(&self.name, self.priority, move || {
            release_loop(&shared, &ctrl, epoch)
        })?);
        Ok(())
    }

    /// Block until the release loop exits its superloop.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Break the task out of a blocking receive.
    ///
    /// A no-op when the task is not blocked: the stale token is discarded by
    /// the next receive unless the stop flag is set.
    pub fn unblock(&self) {
        if let Some(unblocker) = self.shared.unblock.lock().unwrap().as_ref() {
            unblocker.unblock();
        }
    }

    /// Reset every per-step measurement. Idempotent.
    pub fn clear_measurements(&self) {
        *self.shared.stats.lock().unwrap() = StepStats::new();
    }

    /// Snapshot of the step measurements; meaningful after `join`.
    pub fn stats(&self) -> StepStats {
        *self.shared.stats.lock().unwrap()
    }
}

fn check_data_topic(topic: u8) -> BenchResult<()> {
    if topic < FIRST_DATA_TOPIC {
        return Err(BenchError::TopicCreationFailed {
            topic,
            reason: "topics 0 and 1 are reserved for management".into(),
        });
    }
    Ok(())
}

// ── Release loop ──────────────────────────────────────────────────────────────

fn release_loop(shared: &TaskShared, ctrl: &SharedControl, epoch: u32) {
    let params = *shared.params.lock().unwrap();
    let period = params.period;

    // The controller never touches handles while the loop runs; holding the
    // guard for the whole step keeps the hot path lock-free.
    let io = shared.io.lock().unwrap();
    let mut recv_buf = io
        .subscriber
        .as_ref()
        .map(|s| vec![0u8; s.message_size()]);
    let send_buf = io.publisher.as_ref().map(|p| vec![0u8; p.message_size()]);

    let mut stats = *shared.stats.lock().unwrap();

    // Common epoch: every task resumes from the same broadcast and the same
    // initial-time snapshot.
    ctrl.wait_start(epoch);
    let mut activation = ctrl.initial_time();

    loop {
        if let (Some(subscriber), Some(buf)) = (io.subscriber.as_ref(), recv_buf.as_mut()) {
            receive_blocking(subscriber, buf, ctrl);
        }

        if params.workload_kwi > 0 {
            whetstone::execute(params.workload_kwi);
        }

        if let (Some(publisher), Some(buf)) = (io.publisher.as_ref(), send_buf.as_ref()) {
            if publisher.send(buf).is_err() {
                trace!(topic = publisher.topic(), "publish dropped: queue full");
            }
        }

        // Once the controller interferes with the schedule to stop the step,
        // the measurement of this job is meaningless; it is excluded.
        if ctrl.is_stopped() {
            stats.finalize();
            break;
        }

        let completion = clock::now();
        let response = clock::elapsed(activation, completion);
        let k = stats.record(response, period);

        activation += k * period;
        clock::sleep_until(activation);
    }

    *shared.stats.lock().unwrap() = stats;
}

/// Blocking receive that discards stale unblock tokens.
///
/// A real unblock only ever happens while the stop flag is set (the slave
/// controller unblocks blocked subscribers at step teardown); a token seen
/// with the flag clear is left over from unblocking a task that was not
/// blocked, and is ignored.
fn receive_blocking(subscriber: &Subscriber, buf: &mut [u8], ctrl: &SharedControl) {
    loop {
        match subscriber.receive(buf) {
            Receipt::Message => return,
            Receipt::Unblocked if ctrl.is_stopped() => return,
            Receipt::Unblocked => continue,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
