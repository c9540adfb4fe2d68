/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Slave experiment controller.
//!
//! The Slave is the receiver side of the distributed experiments: three
//! baseline tasks subscribing on topics 2..4, mirrored per-step updates, and
//! a deadline-count handshake back to the Master after every step. It runs
//! until the Master signals `is_finished` or its own task pool can no longer
//! grow (Experiment 7's reach-limit path).
//!
//! The Slave never owns the step clock: its tasks start on the Master's
//! broadcast (through the shared control region) and stop on the Master's
//! stop flag; the Slave only tears its tasks down — unblocking subscribers
//! parked in `receive`, which would otherwise never observe the flag.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use crate::config::BenchConfig;
use crate::error::{BenchError, BenchResult};
use crate::pubsub::{TopicTable, FIRST_DATA_TOPIC};
use crate::report::{Role, StepReport, TaskRow};
use crate::rt;
use crate::rt::shm::SharedControl;
use crate::task::SyntheticTask;

use super::{
    baseline_workloads, calibrate_raw_speed, clear_and_restart, total_deadline_miss,
    wait_tasks_finish_unblocking, warn_if_infeasible, Handshake, WorstCaseScenario,
    BASELINE_PRIORITY, DEADLINE_HANDSHAKE, IS_FINISHED, IS_STARTED, MANAGEMENT_PRIORITY,
    PCD_BASELINE_FREQUENCIES, PCD_BASELINE_MESSAGE_SIZE,
};

/// First task id handed to receiver tasks appended by Experiment 7.
const FIRST_EXTRA_TASK_ID: u8 = 4;

/// Topic carrying baseline task 2's traffic; Experiment 7's extra
/// subscribers pile onto it.
const TASK2_TOPIC: u8 = 3;

// ── Public front ──────────────────────────────────────────────────────────────

/// Handle to the Slave node; runs until the Master signals finished.
pub struct Slave {
    handle: Option<JoinHandle<BenchResult<()>>>,
}

impl Slave {
    /// Spawn the management task; it immediately opens the management
    /// topics and offers the `is_started` handshake.
    pub fn launch(config: BenchConfig) -> BenchResult<Self> {
        let handle = rt::spawn_rt("management", MANAGEMENT_PRIORITY, move || {
            let mut controller = SlaveController::new(config)?;
            let handshake = Handshake::slave(&controller.table)?;
            controller.run(&handshake)
        })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Block until the experiment finishes.
    pub fn wait(mut self) -> BenchResult<()> {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(BenchError::Spawn {
                    name: "management".into(),
                    source: io::Error::other("management task panicked"),
                })
            }),
            None => Ok(()),
        }
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

struct SlaveController {
    config: BenchConfig,
    table: TopicTable,
    ctrl: Arc<SharedControl>,
    tasks: Vec<SyntheticTask>,
    raw_speed: u64,
    pcd_workloads: Vec<u64>,
    worst: WorstCaseScenario,
    reach_limit: bool,
    experiment: u8,
    next_extra_task_id: u8,
}

impl SlaveController {
    fn new(config: BenchConfig) -> BenchResult<Self> {
        let ctrl = Arc::new(SharedControl::open(&config.shm_namespace, false)?);
        let table = TopicTable::new(config.shm_namespace.clone());

        let raw_speed = match config.raw_speed {
            Some(speed) => speed,
            None => {
                info!("no pre-calibrated raw speed; measuring");
                calibrate_raw_speed()
            }
        };

        Ok(Self {
            pcd_workloads: baseline_workloads(raw_speed, &PCD_BASELINE_FREQUENCIES),
            config,
            table,
            ctrl,
            tasks: Vec::new(),
            raw_speed,
            worst: WorstCaseScenario::default(),
            reach_limit: false,
            experiment: 0,
            next_extra_task_id: FIRST_EXTRA_TASK_ID,
        })
    }

    fn run(&mut self, handshake: &Handshake) -> BenchResult<()> {
        handshake.send(IS_STARTED)?;
        let experiment = handshake.receive()?;
        println!("Connection established with Master!");
        println!("Experiment {experiment} will be performed...");
        self.experiment = experiment as u8;

        self.init_baseline()?;
        self.run_loop(handshake)
    }

    // ── Baseline ──────────────────────────────────────────────────────────────

    fn alloc_task(&self, id: u8, priority: u8) -> BenchResult<SyntheticTask> {
        if self.tasks.len() >= self.config.max_synthetic_tasks {
            return Err(BenchError::AllocFailed {
                what: format!(
                    "synthetic task {id} (pool capacity {})",
                    self.config.max_synthetic_tasks
                ),
            });
        }
        Ok(SyntheticTask::new(id, priority, Arc::clone(&self.ctrl)))
    }

    /// Three subscribing tasks on topics 2..4, priorities descending 4..2.
    fn init_baseline(&mut self) -> BenchResult<()> {
        let count = PCD_BASELINE_FREQUENCIES.len() as u8;
        for i in 0..count as usize {
            let task = self.alloc_task(i as u8 + 1, BASELINE_PRIORITY + (count - (i as u8 + 1)))?;
            task.set_kwipp(self.pcd_workloads[i]);
            task.set_frequency(PCD_BASELINE_FREQUENCIES[i] as f64);
            task.subscribing_request(
                &self.table,
                FIRST_DATA_TOPIC + i as u8,
                PCD_BASELINE_MESSAGE_SIZE,
            )?;
            self.tasks.push(task);
        }
        warn_if_infeasible(&self.tasks, self.raw_speed);
        for task in self.tasks.iter_mut() {
            task.start()?;
        }
        Ok(())
    }

    // ── Step loop ─────────────────────────────────────────────────────────────

    fn run_loop(&mut self, handshake: &Handshake) -> BenchResult<()> {
        let mut step: u32 = 1;
        loop {
            // Announce readiness; the reply only arrives once the Master's
            // test period has elapsed.
            handshake.send(IS_STARTED)?;
            handshake.receive()?;

            // The Master raises the shared stop flag after the wake
            // handshake settles; subscribers parked in receive still need
            // the unblock kick once it is up.
            wait_tasks_finish_unblocking(&mut self.tasks, &self.ctrl);

            self.signal_deadlines(handshake)?;
            self.worst.update(step, &self.tasks);
            self.print_report(step);

            if handshake.receive()? == IS_FINISHED {
                println!("Experiment finished!!!");
                return Ok(());
            }

            step += 1;
            self.update_experiment(step, handshake)?;
            if self.reach_limit {
                return Ok(());
            }
        }
    }

    /// The 777 sentinel, then this node's miss total, as two handshakes.
    fn signal_deadlines(&self, handshake: &Handshake) -> BenchResult<()> {
        handshake.send(DEADLINE_HANDSHAKE)?;
        handshake.send(total_deadline_miss(&self.tasks) as u16)
    }

    // ── Per-experiment updaters (mirror of the Master's table) ────────────────

    fn update_experiment(&mut self, step: u32, handshake: &Handshake) -> BenchResult<()> {
        match self.experiment {
            4 => {
                handshake.send(IS_STARTED)?;
                let _ = handshake.receive()?;
                for (i, task) in self.tasks.iter().enumerate() {
                    task.set_kwipp(scale_workload(self.pcd_workloads[i], step));
                }
                clear_and_restart(&mut self.tasks)?;
            }
            5 => {
                for task in &self.tasks {
                    task.leave_sub_topic(&self.table);
                    task.clear_measurements();
                }
                handshake.send(IS_STARTED)?;
                let _ = handshake.receive()?;

                let msg_size = 1usize << (step + 1);
                for (i, task) in self.tasks.iter().enumerate() {
                    task.subscribing_request(&self.table, FIRST_DATA_TOPIC + i as u8, msg_size)?;
                }
                for task in self.tasks.iter_mut() {
                    task.start()?;
                }
            }
            6 => {
                handshake.send(IS_STARTED)?;
                let _ = handshake.receive()?;
                for (i, task) in self.tasks.iter().enumerate() {
                    task.set_frequency(scale_frequency(PCD_BASELINE_FREQUENCIES[i], step));
                }
                clear_and_restart(&mut self.tasks)?;
            }
            7 => return self.update_exp7(handshake),
            _ => {}
        }
        warn_if_infeasible(&self.tasks, self.raw_speed);
        Ok(())
    }

    /// Try to grow the receiver set by one subscriber shaped like baseline
    /// task 2; report reach-limit to the Master when the pool is exhausted.
    fn update_exp7(&mut self, handshake: &Handshake) -> BenchResult<()> {
        match self.alloc_task(self.next_extra_task_id, BASELINE_PRIORITY + 1) {
            Err(BenchError::AllocFailed { .. }) => {
                self.reach_limit = true;
                println!();
                println!("Experiment reach limit: impossible to create more tasks!!!");
                handshake.send(1)?;
                let _ = handshake.receive()?;
                println!("Experiment finished!!!");
                Ok(())
            }
            Err(other) => Err(other),
            Ok(task) => {
                task.set_kwipp(self.pcd_workloads[1]);
                task.set_frequency(PCD_BASELINE_FREQUENCIES[1] as f64);
                task.subscribing_request(&self.table, TASK2_TOPIC, PCD_BASELINE_MESSAGE_SIZE)?;
                self.tasks.push(task);
                self.next_extra_task_id += 1;

                clear_and_restart(&mut self.tasks)?;
                handshake.send(0)?;
                let _ = handshake.receive()?;
                Ok(())
            }
        }
    }

    // ── Reporting ─────────────────────────────────────────────────────────────

    fn print_report(&self, step: u32) {
        let rows: Vec<TaskRow> = self
            .tasks
            .iter()
            .map(|t| TaskRow::from_task(t, self.raw_speed))
            .collect();

        let report = StepReport {
            role: Role::Slave,
            experiment: self.experiment,
            step,
            raw_speed: self.raw_speed,
            test_period_secs: self.config.test_period_secs,
            rows,
            baseline_workloads: &self.pcd_workloads,
            baseline_frequencies: &PCD_BASELINE_FREQUENCIES,
            baseline_message_size: Some(PCD_BASELINE_MESSAGE_SIZE),
            worst_case: Some(&self.worst),
            slave_deadline_misses: None,
            machine_readable: self.config.machine_readable,
        };
        println!("{}", report.render());
    }
}

/// Workload for step `n`: `baseline × (1 + 0.1 × n)`.
fn scale_workload(baseline: u64, step: u32) -> u64 {
    (baseline as f64 * (1.0 + step as f64 * 0.1)) as u64
}

/// Frequency for step `n`: `baseline × (1 + 0.1 × n)` Hz.
fn scale_frequency(baseline: u64, step: u32) -> f64 {
    baseline as f64 * (1.0 + step as f64 * 0.1)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::MGMT_MSG_SIZE;
    use crate::clock;
    use crate::pubsub::{TOPIC_MASTER_TO_SLAVE, TOPIC_SLAVE_TO_MASTER};

    fn test_config(tag: &str, max_tasks: usize) -> BenchConfig {
        BenchConfig {
            shm_namespace: format!(
                "rstone_slave_{}_{}_{tag}",
                std::process::id(),
                clock::now() % 1_000_000
            ),
            test_period_secs: 1,
            max_synthetic_tasks: max_tasks,
            ..Default::default()
        }
    }

    #[test]
    fn baseline_shape_matches_the_receiver_set() {
        let mut controller = SlaveController::new(test_config("shape", 64)).unwrap();
        // Build the set without starting threads.
        for i in 0..3usize {
            let task = controller
                .alloc_task(i as u8 + 1, BASELINE_PRIORITY + (3 - (i as u8 + 1)))
                .unwrap();
            task.set_kwipp(controller.pcd_workloads[i]);
            task.set_frequency(PCD_BASELINE_FREQUENCIES[i] as f64);
            task.subscribing_request(
                &controller.table,
                FIRST_DATA_TOPIC + i as u8,
                PCD_BASELINE_MESSAGE_SIZE,
            )
            .unwrap();
            controller.tasks.push(task);
        }

        let priorities: Vec<u8> = controller.tasks.iter().map(|t| t.priority()).collect();
        assert_eq!(priorities, vec![4, 3, 2]);
        let topics: Vec<Option<u8>> = controller.tasks.iter().map(|t| t.sub_topic()).collect();
        assert_eq!(topics, vec![Some(2), Some(3), Some(4)]);
        for task in &controller.tasks {
            assert_eq!(task.sub_message_size(), Some(PCD_BASELINE_MESSAGE_SIZE));
            task.leave_sub_topic(&controller.table);
        }
    }

    #[test]
    fn exp5_resubscription_doubles_message_size_per_step() {
        // Step 3 of experiment 5 carries 2^4 = 16-byte messages.
        assert_eq!(1usize << (3 + 1), 16);
        assert_eq!(1usize << (2 + 1), 8);
        assert_eq!(1usize << (5 + 1), 64);
    }

    #[test]
    fn exhausted_pool_reports_reach_limit_to_the_master() {
        let mut controller = SlaveController::new(test_config("limit", 2)).unwrap();
        controller.experiment = 7;
        // Fill the pool with unstarted placeholders.
        for i in 0..2u8 {
            let task = controller.alloc_task(i + 1, 2).unwrap();
            controller.tasks.push(task);
        }

        // A stand-in Master answering the reach-limit handshake pair.
        let ns = {
            // Same namespace the controller uses, peered through a second
            // table as the other process would be.
            controller.config.shm_namespace.clone()
        };
        let master_side = std::thread::spawn(move || {
            let table = TopicTable::new(ns);
            let publisher = table
                .publishing_request(TOPIC_MASTER_TO_SLAVE, MGMT_MSG_SIZE)
                .unwrap();
            let subscriber = table
                .subscribing_request(TOPIC_SLAVE_TO_MASTER, MGMT_MSG_SIZE)
                .unwrap();
            let handshake = Handshake {
                publisher,
                subscriber,
            };
            let status = handshake.receive().unwrap();
            handshake.send(status).unwrap();
            status
        });

        let slave_table_handshake = Handshake::slave(&controller.table).unwrap();
        controller
            .update_experiment(2, &slave_table_handshake)
            .unwrap();

        assert!(controller.reach_limit);
        assert_eq!(master_side.join().unwrap(), 1, "reach-limit flag crossed the wire");
        assert_eq!(controller.tasks.len(), 2, "no task was appended");
    }

    #[test]
    fn extra_receiver_ids_start_at_four() {
        let controller = SlaveController::new(test_config("ids", 64)).unwrap();
        assert_eq!(controller.next_extra_task_id, 4);
    }
}
