/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Robotstone — a distributed real-time benchmark.
//!
//! Two peer processes, Master and Slave, drive calibrated periodic load
//! over a shared-memory publish/subscribe fabric and report per-task
//! deadline behavior while the load escalates step by step until the
//! platform breaks.
//!
//! Module layout (leaves first):
//!
//! ```text
//! lib.rs
//! ├── clock        – monotonic ticks, wrap-safe arithmetic, absolute sleep
//! ├── whetstone    – the calibrated synthetic floating-point kernel
//! ├── config       – YAML benchmark configuration
//! ├── error        – structured benchmark errors
//! ├── rt           – SCHED_FIFO threads, shared memory, futex signalling
//! ├── pubsub       – topics, gatekeepers, publisher/subscriber handles
//! ├── task         – the synthetic periodic task and its measurements
//! ├── feasibility  – utilization accounting, rate-monotonic advisory
//! ├── report       – per-step textual reports
//! └── bench        – experiment controllers (Master and Slave) + handshake
//! ```

pub mod bench;
pub mod clock;
pub mod config;
pub mod error;
pub mod feasibility;
pub mod pubsub;
pub mod report;
pub mod rt;
pub mod task;
pub mod whetstone;
