/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Master experiment controller.
//!
//! One management task (priority 50) owns the whole state machine: it waits
//! for the operator's experiment request, builds the baseline task set,
//! drives the per-step cycle — release, measure, stop, collect, report,
//! reconfigure — and, for the distributed experiments, keeps the Slave in
//! lockstep through the management handshake.
//!
//! Experiments 1–3 are processing-domain (local only); 4–7 add the
//! publish/subscribe fabric with the Slave subscribing across the process
//! boundary. Any other request measures the raw speed and returns.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::clock;
use crate::config::BenchConfig;
use crate::error::{BenchError, BenchResult};
use crate::pubsub::{TopicTable, FIRST_DATA_TOPIC};
use crate::report::{Role, StepReport, TaskRow};
use crate::rt;
use crate::rt::shm::SharedControl;
use crate::task::SyntheticTask;

use super::{
    baseline_workloads, calibrate_raw_speed, clear_and_restart, total_deadline_miss,
    wait_tasks_finish, warn_if_infeasible, Handshake, WorstCaseScenario, BASELINE_PRIORITY,
    DEADLINE_HANDSHAKE, IS_FINISHED, IS_RUN, IS_STARTED, MANAGEMENT_PRIORITY,
    PCD_BASELINE_FREQUENCIES, PCD_BASELINE_MESSAGE_SIZE, PD_BASELINE_FREQUENCIES,
};

/// First task id handed to tasks appended by Experiment 3.
const FIRST_EXTRA_PD_TASK_ID: u8 = 6;

// ── Public front ──────────────────────────────────────────────────────────────

/// Handle to the Master node: spawns the management task and forwards the
/// operator's experiment request to it.
pub struct Master {
    request: Arc<(Mutex<Option<u8>>, Condvar)>,
    handle: Option<JoinHandle<BenchResult<()>>>,
}

impl Master {
    /// Spawn the management task. It parks until
    /// [`Master::request_experiment`] delivers the operator's choice.
    pub fn launch(config: BenchConfig) -> BenchResult<Self> {
        let request = Arc::new((Mutex::new(None::<u8>), Condvar::new()));
        let rendezvous = Arc::clone(&request);

        let handle = rt::spawn_rt("management", MANAGEMENT_PRIORITY, move || {
            let (slot, cv) = &*rendezvous;
            let experiment = {
                let mut guard = slot.lock().unwrap();
                while guard.is_none() {
                    guard = cv.wait(guard).unwrap();
                }
                guard.take().unwrap_or_default()
            };
            let mut controller = MasterController::new(config)?;
            controller.run(experiment)
        })?;

        Ok(Self {
            request,
            handle: Some(handle),
        })
    }

    /// Deliver the experiment request and wake the management task.
    ///
    /// `1..=7` selects an experiment; anything else measures raw speed
    /// only.
    pub fn request_experiment(&self, experiment: u8) {
        let (slot, cv) = &*self.request;
        *slot.lock().unwrap() = Some(experiment);
        cv.notify_one();
    }

    /// Block until the management task finishes the experiment.
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

struct MasterController {
    config: BenchConfig,
    table: TopicTable,
    ctrl: Arc<SharedControl>,
    tasks: Vec<SyntheticTask>,
    raw_speed: u64,
    pd_workloads: Vec<u64>,
    pcd_workloads: Vec<u64>,
    worst: WorstCaseScenario,
    slave_deadline_misses: u32,
    reach_limit: bool,
    experiment: u8,
    next_extra_task_id: u8,
}

impl MasterController {
    fn new(config: BenchConfig) -> BenchResult<Self> {
        let ctrl = Arc::new(SharedControl::open(&config.shm_namespace, true)?);
        let table = TopicTable::new(config.shm_namespace.clone());

        let raw_speed = match config.raw_speed {
            Some(speed) => speed,
            None => {
                info!("no pre-calibrated raw speed; measuring");
                calibrate_raw_speed()
            }
        };

        Ok(Self {
            pd_workloads: baseline_workloads(raw_speed, &PD_BASELINE_FREQUENCIES),
            pcd_workloads: baseline_workloads(raw_speed, &PCD_BASELINE_FREQUENCIES),
            config,
            table,
            ctrl,
            tasks: Vec::new(),
            raw_speed,
            worst: WorstCaseScenario::default(),
            slave_deadline_misses: 0,
            reach_limit: false,
            experiment: 0,
            next_extra_task_id: FIRST_EXTRA_PD_TASK_ID,
        })
    }

    fn run(&mut self, experiment: u8) -> BenchResult<()> {
        if !(1..=7).contains(&experiment) {
            let speed = calibrate_raw_speed();
            self.raw_speed = speed;
            println!("Raw speed in Kilo-Whetstone Instructions Per Second (KWIPS): {speed}");
            println!();
            return Ok(());
        }

        self.experiment = experiment;
        info!(experiment, "experiment requested");

        if experiment >= 4 {
            let handshake = Handshake::master(&self.table)?;
            println!("Master ready to begin connection with Slave!");

            let hello = handshake.receive()?;
            if hello != IS_STARTED {
                error!(hello, "unexpected greeting from Slave");
                return Err(BenchError::HandshakeDesync {
                    side: "Receive",
                    step: 2,
                });
            }
            handshake.send(experiment as u16)?;

            self.init_pcd_baseline()?;
            self.run_pcd_loop(&handshake)
        } else {
            self.init_pd_baseline()?;
            self.run_pd_loop()
        }
    }

    // ── Baselines ─────────────────────────────────────────────────────────────

    /// Pool-capacity gate in front of every task creation.
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

    /// Five compute-only tasks, priorities descending 6..2 with task 1 at
    /// the top.
    fn init_pd_baseline(&mut self) -> BenchResult<()> {
        let count = PD_BASELINE_FREQUENCIES.len() as u8;
        for i in 0..count as usize {
            let task = self.alloc_task(i as u8 + 1, BASELINE_PRIORITY + (count - (i as u8 + 1)))?;
            task.set_kwipp(self.pd_workloads[i]);
            task.set_frequency(PD_BASELINE_FREQUENCIES[i] as f64);
            self.tasks.push(task);
        }
        warn_if_infeasible(&self.tasks, self.raw_speed);
        self.start_tasks()
    }

    /// Three publishing tasks on topics 2..4, priorities descending 4..2.
    fn init_pcd_baseline(&mut self) -> BenchResult<()> {
        let count = PCD_BASELINE_FREQUENCIES.len() as u8;
        for i in 0..count as usize {
            let task = self.alloc_task(i as u8 + 1, BASELINE_PRIORITY + (count - (i as u8 + 1)))?;
            task.set_kwipp(self.pcd_workloads[i]);
            task.set_frequency(PCD_BASELINE_FREQUENCIES[i] as f64);
            task.publishing_request(
                &self.table,
                FIRST_DATA_TOPIC + i as u8,
                PCD_BASELINE_MESSAGE_SIZE,
            )?;
            self.tasks.push(task);
        }
        warn_if_infeasible(&self.tasks, self.raw_speed);
        self.start_tasks()
    }

    fn start_tasks(&mut self) -> BenchResult<()> {
        for task in self.tasks.iter_mut() {
            task.start()?;
        }
        Ok(())
    }

    // ── Step loops ────────────────────────────────────────────────────────────

    fn run_pd_loop(&mut self) -> BenchResult<()> {
        let mut step: u32 = 1;
        loop {
            // Give every task time to reach its start-signal wait.
            clock::sleep(3 * clock::ticks_per_second());
            self.ctrl.set_initial_time(clock::now());
            self.ctrl.broadcast_start();

            clock::sleep(self.config.test_period_ticks());
            self.ctrl.set_stop(true);
            wait_tasks_finish(&mut self.tasks);
            self.ctrl.set_stop(false);

            let misses = total_deadline_miss(&self.tasks);
            self.print_report(step);

            if misses > 0 || self.reach_limit {
                println!("Experiment finished!!!");
                return Ok(());
            }

            step += 1;
            match self.update_pd(step) {
                Ok(()) => {}
                Err(BenchError::AllocFailed { what }) => {
                    self.reach_limit = true;
                    println!();
                    println!("Experiment reach limit: {what}.");
                    println!("Experiment finished!!!");
                    return Ok(());
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn run_pcd_loop(&mut self, handshake: &Handshake) -> BenchResult<()> {
        let mut step: u32 = 1;
        loop {
            // The Slave announces it is ready for the step.
            handshake.receive()?;

            clock::sleep(4 * clock::ticks_per_second());
            self.ctrl.set_initial_time(clock::now());
            self.ctrl.broadcast_start();

            clock::sleep(self.config.test_period_ticks());
            // Wake the Slave so it can run its own stop sequence.
            handshake.send(IS_RUN)?;
            self.ctrl.set_stop(true);
            wait_tasks_finish(&mut self.tasks);

            self.slave_deadline_misses = self.wait_deadlines_from_slave(handshake)?;
            self.ctrl.set_stop(false);

            self.worst.update(step, &self.tasks);
            let total = total_deadline_miss(&self.tasks) + self.slave_deadline_misses;
            self.print_report(step);

            if total > 0 {
                handshake.send(IS_FINISHED)?;
                println!("Experiment finished!!!");
                println!("Experiment deadlines: {total}.");
                return Ok(());
            }

            handshake.send(IS_RUN)?;
            step += 1;
            self.update_pcd(step, handshake)?;
            if self.reach_limit {
                return Ok(());
            }
        }
    }

    /// Two handshakes: the 777 sentinel, then the Slave's miss total.
    fn wait_deadlines_from_slave(&self, handshake: &Handshake) -> BenchResult<u32> {
        let sentinel = handshake.receive()?;
        if sentinel != DEADLINE_HANDSHAKE {
            warn!(sentinel, "unexpected deadline-count sentinel");
        }
        Ok(handshake.receive()? as u32)
    }

    // ── Per-experiment updaters ───────────────────────────────────────────────

    fn update_pd(&mut self, step: u32) -> BenchResult<()> {
        match self.experiment {
            1 => {
                for (i, task) in self.tasks.iter().enumerate() {
                    task.set_kwipp(scale_workload(self.pd_workloads[i], step));
                }
            }
            2 => {
                for (i, task) in self.tasks.iter().enumerate() {
                    task.set_frequency(scale_frequency(PD_BASELINE_FREQUENCIES[i], step));
                }
            }
            3 => {
                // One more task with baseline task 3's parameters and
                // priority.
                let task = self.alloc_task(self.next_extra_task_id, BASELINE_PRIORITY + 2)?;
                task.set_kwipp(self.pd_workloads[2]);
                task.set_frequency(PD_BASELINE_FREQUENCIES[2] as f64);
                self.tasks.push(task);
                self.next_extra_task_id += 1;
            }
            _ => unreachable!("PD updater called for experiment {}", self.experiment),
        }
        warn_if_infeasible(&self.tasks, self.raw_speed);
        clear_and_restart(&mut self.tasks)
    }

    fn update_pcd(&mut self, step: u32, handshake: &Handshake) -> BenchResult<()> {
        match self.experiment {
            4 => {
                let echo = handshake.receive()?;
                handshake.send(echo)?;
                for (i, task) in self.tasks.iter().enumerate() {
                    task.set_kwipp(scale_workload(self.pcd_workloads[i], step));
                }
                clear_and_restart(&mut self.tasks)?;
            }
            5 => {
                // Leave, synchronize with the Slave's own leave, rejoin
                // with the doubled message size. Topic ids restart at 2.
                for task in &self.tasks {
                    task.leave_pub_topic(&self.table);
                    task.clear_measurements();
                }
                let echo = handshake.receive()?;
                handshake.send(echo)?;

                let msg_size = 1usize << (step + 1);
                for (i, task) in self.tasks.iter().enumerate() {
                    task.publishing_request(&self.table, FIRST_DATA_TOPIC + i as u8, msg_size)?;
                }
                for task in self.tasks.iter_mut() {
                    task.start()?;
                }
            }
            6 => {
                let echo = handshake.receive()?;
                handshake.send(echo)?;
                for (i, task) in self.tasks.iter().enumerate() {
                    task.set_frequency(scale_frequency(PCD_BASELINE_FREQUENCIES[i], step));
                }
                clear_and_restart(&mut self.tasks)?;
            }
            7 => {
                let status = handshake.receive()?;
                if status == 1 {
                    // The Slave could not grow its receiver set.
                    self.reach_limit = true;
                    println!();
                    println!("Experiment reach limit: impossible to create more receiver tasks!!!");
                    handshake.send(status)?;
                    let total = total_deadline_miss(&self.tasks) + self.slave_deadline_misses;
                    println!("Experiment finished!!!");
                    println!("Experiment deadlines: {total}.");
                    return Ok(());
                }
                handshake.send(status)?;
                clear_and_restart(&mut self.tasks)?;
            }
            _ => unreachable!("PCD updater called for experiment {}", self.experiment),
        }
        Ok(())
    }

    // ── Reporting ─────────────────────────────────────────────────────────────

    fn print_report(&self, step: u32) {
        let pd = self.experiment <= 3;
        let rows: Vec<TaskRow> = self
            .tasks
            .iter()
            .map(|t| TaskRow::from_task(t, self.raw_speed))
            .collect();

        let report = StepReport {
            role: Role::Master,
            experiment: self.experiment,
            step,
            raw_speed: self.raw_speed,
            test_period_secs: self.config.test_period_secs,
            rows,
            baseline_workloads: if pd { &self.pd_workloads } else { &self.pcd_workloads },
            baseline_frequencies: if pd {
                &PD_BASELINE_FREQUENCIES
            } else {
                &PCD_BASELINE_FREQUENCIES
            },
            baseline_message_size: (!pd).then_some(PCD_BASELINE_MESSAGE_SIZE),
            worst_case: (!pd).then_some(&self.worst),
            slave_deadline_misses: (!pd).then_some(self.slave_deadline_misses),
            machine_readable: self.config.machine_readable,
        };
        println!("{}", report.render());
    }
}

// ── Step scaling ──────────────────────────────────────────────────────────────

/// Workload for step `n`: `baseline × (1 + 0.1 × n)`, floored to whole
/// KWIPP.
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

    fn test_config(tag: &str) -> BenchConfig {
        BenchConfig {
            shm_namespace: format!(
                "rstone_master_{}_{}_{tag}",
                std::process::id(),
                clock::now() % 1_000_000
            ),
            test_period_secs: 1,
            ..Default::default()
        }
    }

    fn unstarted_controller(tag: &str) -> MasterController {
        let controller = MasterController::new(test_config(tag)).unwrap();
        // Nothing else binds the control region in these tests.
        controller.ctrl.unlink();
        controller
    }

    // ── Scaling ───────────────────────────────────────────────────────────────

    #[test]
    fn workload_scales_ten_percent_per_step() {
        assert_eq!(scale_workload(1_000, 1), 1_100);
        assert_eq!(scale_workload(1_000, 2), 1_200);
        assert_eq!(scale_workload(1_000, 10), 2_000);
    }

    #[test]
    fn frequency_scales_ten_percent_per_step() {
        assert!((scale_frequency(63, 1) - 69.3).abs() < 1e-9);
        assert!((scale_frequency(10, 3) - 13.0).abs() < 1e-9);
    }

    // ── Baseline shapes ───────────────────────────────────────────────────────

    #[test]
    fn pd_baseline_builds_five_tasks_with_descending_priorities() {
        let mut controller = unstarted_controller("pd");
        // Build without starting: construct the set the way the
        // initializer does, minus the thread spawn.
        for i in 0..5usize {
            let task = controller
                .alloc_task(i as u8 + 1, BASELINE_PRIORITY + (5 - (i as u8 + 1)))
                .unwrap();
            task.set_kwipp(controller.pd_workloads[i]);
            task.set_frequency(PD_BASELINE_FREQUENCIES[i] as f64);
            controller.tasks.push(task);
        }

        let priorities: Vec<u8> = controller.tasks.iter().map(|t| t.priority()).collect();
        assert_eq!(priorities, vec![6, 5, 4, 3, 2]);
        let ids: Vec<u8> = controller.tasks.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        // Workload × frequency recovers the 15 % baseline split (modulo
        // integer flooring).
        let per_task = 413_500.0 * 0.15 / 5.0;
        for task in &controller.tasks {
            assert!(task.kwips() <= per_task + 1.0);
            assert!(task.kwips() > per_task * 0.9);
        }
    }

    #[test]
    fn exp3_appends_tasks_with_task3_parameters_until_the_pool_is_full() {
        let mut controller = unstarted_controller("exp3");
        controller.config.max_synthetic_tasks = 7;
        controller.experiment = 3;

        for i in 0..5u8 {
            let task = controller.alloc_task(i + 1, BASELINE_PRIORITY + (5 - (i + 1))).unwrap();
            controller.tasks.push(task);
        }

        // Two appends fit (6 and 7), the third trips the pool gate. The
        // updater restarts every task, so probe the append logic directly.
        for expected_id in [6u8, 7u8] {
            let task = controller
                .alloc_task(controller.next_extra_task_id, BASELINE_PRIORITY + 2)
                .unwrap();
            assert_eq!(task.id(), expected_id);
            assert_eq!(task.priority(), 4, "appended tasks match task 3's priority");
            controller.tasks.push(task);
            controller.next_extra_task_id += 1;
        }
        let err = controller
            .alloc_task(controller.next_extra_task_id, BASELINE_PRIORITY + 2)
            .unwrap_err();
        assert!(matches!(err, BenchError::AllocFailed { .. }));
    }

    #[test]
    fn exp1_updater_rescales_against_the_baseline_not_the_previous_step() {
        let controller = {
            let mut c = unstarted_controller("exp1");
            c.experiment = 1;
            for i in 0..5usize {
                let task = c.alloc_task(i as u8 + 1, 2).unwrap();
                task.set_kwipp(c.pd_workloads[i]);
                task.set_frequency(PD_BASELINE_FREQUENCIES[i] as f64);
                c.tasks.push(task);
            }
            c
        };

        // Apply the scaling the updater would apply for steps 2 then 5;
        // each is anchored on the baseline.
        for (i, task) in controller.tasks.iter().enumerate() {
            task.set_kwipp(scale_workload(controller.pd_workloads[i], 2));
        }
        for (i, task) in controller.tasks.iter().enumerate() {
            task.set_kwipp(scale_workload(controller.pd_workloads[i], 5));
            assert_eq!(
                task.kwipp(),
                (controller.pd_workloads[i] as f64 * 1.5) as u64
            );
        }
    }

    #[test]
    fn raw_speed_prefers_the_configured_value() {
        let mut config = test_config("raw");
        config.raw_speed = Some(99_000);
        let controller = MasterController::new(config).unwrap();
        controller.ctrl.unlink();
        assert_eq!(controller.raw_speed, 99_000);
        assert_eq!(
            controller.pd_workloads,
            baseline_workloads(99_000, &PD_BASELINE_FREQUENCIES)
        );
    }
}
