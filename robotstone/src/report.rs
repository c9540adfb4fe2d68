/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Per-step textual report.
//!
//! Reports are benchmark *output* — they go to stdout as plain text, never
//! through the log layer. The layout mirrors the reference reports: a
//! characteristics block (what the step was configured to do), the
//! per-experiment step description, and a results block (what the task set
//! actually did), with the worst-case scenario and the receiver deadline
//! total on the report flavors that carry them.

use std::fmt::Write;

use crate::bench::WorstCaseScenario;
use crate::clock;
use crate::task::SyntheticTask;

/// Underlay platform identification printed in every report header.
pub const PLATFORM: &str = "Rust SCHED_FIFO threads on Linux, shared-memory pub/sub fabric";

/// Which node produced the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::Master => "Master",
            Role::Slave => "Slave",
        }
    }
}

/// One task's line items, snapshotted after the step's join.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: u8,
    pub frequency: f64,
    pub kwipp: u64,
    pub kwips: f64,
    pub utilization: f64,
    pub period_secs: f64,
    pub met: u32,
    pub missed: u32,
    pub skipped: u32,
    pub avg_response_secs: f64,
    pub wcrt_secs: f64,
    pub avg_jitter_secs: f64,
    pub wcrj_secs: f64,
    /// Published (Master) or subscribed (Slave) message size, PCD only.
    pub message_size: Option<usize>,
    /// Topic carrying the above.
    pub topic: Option<u8>,
}

impl TaskRow {
    /// Snapshot `task` against the node's measured raw speed.
    pub fn from_task(task: &SyntheticTask, raw_speed: u64) -> Self {
        let stats = task.stats();
        let (message_size, topic) = match (task.pub_topic(), task.sub_topic()) {
            (Some(t), _) => (task.pub_message_size(), Some(t)),
            (None, Some(t)) => (task.sub_message_size(), Some(t)),
            (None, None) => (None, None),
        };
        Self {
            id: task.id(),
            frequency: task.frequency(),
            kwipp: task.kwipp(),
            kwips: task.kwips(),
            utilization: task.utilization(raw_speed),
            period_secs: task.period_secs(),
            met: stats.met,
            missed: stats.missed,
            skipped: stats.skipped,
            avg_response_secs: clock::to_secs(stats.avg_response),
            wcrt_secs: clock::to_secs(stats.wcrt),
            avg_jitter_secs: clock::to_secs(stats.avg_jitter),
            wcrj_secs: clock::to_secs(stats.wcrj()),
            message_size,
            topic,
        }
    }
}

/// Everything one step report needs.
pub struct StepReport<'a> {
    pub role: Role,
    pub experiment: u8,
    pub step: u32,
    pub raw_speed: u64,
    pub test_period_secs: u64,
    pub rows: Vec<TaskRow>,
    pub baseline_workloads: &'a [u64],
    pub baseline_frequencies: &'a [u64],
    /// Baseline message size in bytes; `None` on PD reports ("no message
    /// transferring").
    pub baseline_message_size: Option<usize>,
    /// Worst-case block; carried by PCD master reports and slave reports.
    pub worst_case: Option<&'a WorstCaseScenario>,
    /// Receiver-side deadline total; carried by PCD master reports.
    pub slave_deadline_misses: Option<u32>,
    pub machine_readable: bool,
}

impl StepReport<'_> {
    /// Render the full report.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);
        // Writing into a String cannot fail; discard the fmt plumbing.
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, w: &mut String) -> std::fmt::Result {
        writeln!(w, "{}", "=".repeat(72))?;
        writeln!(w)?;
        writeln!(w, "Underlay Software Architecture:\n{PLATFORM}")?;
        writeln!(
            w,
            "Raw speed in Kilo-Whetstone Instructions Per Second (KWIPS): {}",
            self.raw_speed
        )?;
        writeln!(w)?;
        writeln!(w, "Executable Control: {}", self.role.label())?;
        writeln!(w)?;
        writeln!(w, "Experiment: {}", self.experiment)?;
        writeln!(w)?;

        self.render_characteristics(w)?;
        self.render_initial_conditions(w)?;
        self.render_step_description(w)?;
        writeln!(w, "{}", "-".repeat(72))?;
        writeln!(w)?;
        self.render_results(w)?;

        if let Some(worst) = self.worst_case {
            writeln!(w)?;
            writeln!(w, "Scenario with worst WCRT in relation with average:")?;
            writeln!(w, "- Test: {}", worst.step)?;
            writeln!(w, "- Task: {}", worst.task_id)?;
            writeln!(w, "- WCRT: {:.6} seconds", worst.wcrt_secs)?;
            writeln!(w, "- Aver. Response: {:.6} seconds", worst.avg_response_secs)?;
        }
        if let Some(misses) = self.slave_deadline_misses {
            writeln!(w)?;
            writeln!(w, "Total of Deadlines Misses by Receivers: {misses}")?;
        }

        writeln!(w)?;
        writeln!(w, "{}", "=".repeat(72))?;

        if self.machine_readable {
            self.render_machine_rows(w)?;
        }
        Ok(())
    }

    fn render_characteristics(&self, w: &mut String) -> std::fmt::Result {
        writeln!(w, "Test {} characteristics:", self.step)?;
        writeln!(w)?;
        writeln!(
            w,
            "{:<6}{:<15}{:<9}{:<13}{}",
            "Task", "Frequency(Hz)", "KWIPP", "KWIPS", "CPU Utilization"
        )?;

        let mut total_kwips = 0.0;
        let mut total_cpu = 0.0;
        for row in &self.rows {
            writeln!(
                w,
                "{:<6}{:<15.4}{:<9}{:<13.2}{:.4}%",
                row.id, row.frequency, row.kwipp, row.kwips, row.utilization
            )?;
            total_kwips += row.kwips;
            total_cpu += row.utilization;
        }
        writeln!(w, "{:<30}{:<13}{}", "", "-------", "-------")?;
        writeln!(w, "{:<30}{:<13.2}{:.4}%", "", total_kwips, total_cpu)?;
        writeln!(w)?;

        if self.baseline_message_size.is_some() {
            writeln!(w, "{:<6}{:<22}{}", "Task", "Message Length (B)", "Topic")?;
            for row in &self.rows {
                if let (Some(size), Some(topic)) = (row.message_size, row.topic) {
                    writeln!(w, "{:<6}{:<22}{}", row.id, size, topic)?;
                }
            }
            writeln!(w)?;
        }
        Ok(())
    }

    fn render_initial_conditions(&self, w: &mut String) -> std::fmt::Result {
        let workloads: Vec<String> = self
            .baseline_workloads
            .iter()
            .map(|v| v.to_string())
            .collect();
        let frequencies: Vec<String> = self
            .baseline_frequencies
            .iter()
            .map(|v| v.to_string())
            .collect();
        writeln!(
            w,
            "Initial condition: - all tasks workload set by {{{}}} KWIPP.",
            workloads.join(", ")
        )?;
        writeln!(
            w,
            "                   - all tasks frequency set by {{{}}} Hertz.",
            frequencies.join(", ")
        )?;
        match self.baseline_message_size {
            Some(size) => writeln!(w, "                   - Message length set by {size} bytes.")?,
            None => writeln!(w, "                   - No message transferring.")?,
        }
        Ok(())
    }

    fn render_step_description(&self, w: &mut String) -> std::fmt::Result {
        let description = match self.experiment {
            1 | 4 => "Increase the KWIPP of all tasks by\n\t\t1.1, 1.2, 1.3, ... of its baseline value.",
            2 | 6 => "Increase the frequency of all tasks by\n\t\t1.1, 1.2, 1.3, ... of its baseline frequency.",
            3 => "Increase one task with\n\t\tthe same parameters of task 3.",
            5 => "Scale message length by\n\t\ttwo to the power of the test step number plus one.",
            7 => "Increase one task with the same\n\t\tparameters of medium priority subscriber task on Slave.",
            _ => return Ok(()),
        };
        writeln!(w, "Experiment step: {description}")
    }

    fn render_results(&self, w: &mut String) -> std::fmt::Result {
        writeln!(w, "Test {} results:", self.step)?;
        writeln!(w)?;
        writeln!(w, "Test duration (seconds): {}", self.test_period_secs)?;
        writeln!(w)?;

        writeln!(
            w,
            "{:<6}{:<12}{:<12}{:<12}{}",
            "Task", "Period(s)", "Met", "Missed", "Skipped"
        )?;
        writeln!(
            w,
            "{:<6}{:<12}{:<12}{:<12}{}",
            "", "", "deadlines", "deadlines", "deadlines"
        )?;
        for row in &self.rows {
            writeln!(
                w,
                "{:<6}{:<12.6}{:<12}{:<12}{}",
                row.id, row.period_secs, row.met, row.missed, row.skipped
            )?;
        }
        writeln!(w)?;

        writeln!(
            w,
            "{:<6}{:<14}{:<12}{:<14}{}",
            "Task", "Average (s)", "WCRT (s)", "Average (s)", "WCRJ (s)"
        )?;
        writeln!(
            w,
            "{:<6}{:<14}{:<12}{:<14}{}",
            "", "Resp. Time", "", "Resp. Jitter", ""
        )?;
        for row in &self.rows {
            writeln!(
                w,
                "{:<6}{:<14.6}{:<12.6}{:<14.6}{:.6}",
                row.id, row.avg_response_secs, row.wcrt_secs, row.avg_jitter_secs, row.wcrj_secs
            )?;
        }
        Ok(())
    }

    /// One space-separated line per task, for harvesting runs by script.
    fn render_machine_rows(&self, w: &mut String) -> std::fmt::Result {
        writeln!(w)?;
        for row in &self.rows {
            writeln!(
                w,
                "\t\t\t\t\t{} {:.6} {} {} {} {:.6} {:.6} {:.6} {:.6}",
                row.id,
                row.period_secs,
                row.met,
                row.missed,
                row.skipped,
                row.avg_response_secs,
                row.wcrt_secs,
                row.avg_jitter_secs,
                row.wcrj_secs
            )?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(id: u8) -> TaskRow {
        TaskRow {
            id,
            frequency: 7.0,
            kwipp: 2_953,
            kwips: 20_671.0,
            utilization: 4.999,
            period_secs: 0.142_857,
            met: 70,
            missed: 0,
            skipped: 0,
            avg_response_secs: 0.003_2,
            wcrt_secs: 0.005_1,
            avg_jitter_secs: 0.000_4,
            wcrj_secs: 0.002_0,
            message_size: Some(8),
            topic: Some(2),
        }
    }

    fn sample_report<'a>(
        worst: Option<&'a WorstCaseScenario>,
        message_size: Option<usize>,
    ) -> StepReport<'a> {
        StepReport {
            role: Role::Master,
            experiment: 4,
            step: 2,
            raw_speed: 413_500,
            test_period_secs: 10,
            rows: vec![sample_row(1), sample_row(2)],
            baseline_workloads: &[2_953, 4_135, 6_891],
            baseline_frequencies: &[7, 5, 3],
            baseline_message_size: message_size,
            worst_case: worst,
            slave_deadline_misses: Some(3),
            machine_readable: false,
        }
    }

    #[test]
    fn header_carries_platform_raw_speed_and_role() {
        let text = sample_report(None, Some(8)).render();
        assert!(text.contains(PLATFORM));
        assert!(text.contains(
            "Raw speed in Kilo-Whetstone Instructions Per Second (KWIPS): 413500"
        ));
        assert!(text.contains("Executable Control: Master"));
        assert!(text.contains("Experiment: 4"));
        assert!(text.contains("Test 2 characteristics:"));
        assert!(text.contains("Test 2 results:"));
    }

    #[test]
    fn pcd_report_lists_message_lengths_and_receiver_misses() {
        let text = sample_report(None, Some(8)).render();
        assert!(text.contains("Message Length (B)"));
        assert!(text.contains("Message length set by 8 bytes."));
        assert!(text.contains("Total of Deadlines Misses by Receivers: 3"));
    }

    #[test]
    fn pd_report_omits_message_block() {
        let mut report = sample_report(None, None);
        report.experiment = 1;
        report.slave_deadline_misses = None;
        let text = report.render();
        assert!(!text.contains("Message Length (B)"));
        assert!(text.contains("No message transferring."));
        assert!(!text.contains("Deadlines Misses by Receivers"));
    }

    #[test]
    fn worst_case_block_renders_when_present() {
        let worst = WorstCaseScenario {
            step: 3,
            task_id: 2,
            wcrt_secs: 0.091,
            avg_response_secs: 0.004,
        };
        let text = sample_report(Some(&worst), Some(8)).render();
        assert!(text.contains("Scenario with worst WCRT in relation with average:"));
        assert!(text.contains("- Test: 3"));
        assert!(text.contains("- Task: 2"));
    }

    #[test]
    fn machine_readable_appends_one_row_per_task() {
        let mut report = sample_report(None, Some(8));
        report.machine_readable = true;
        let text = report.render();
        let data_rows = text.lines().filter(|l| l.starts_with("\t\t\t\t\t")).count();
        assert_eq!(data_rows, 2);
    }
}
