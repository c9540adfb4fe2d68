/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Structured error types for the benchmark core.
//!
//! Every failure the harness distinguishes is a [`BenchError`] variant; the
//! controllers decide per call site whether a variant is fatal, a silent
//! drop, or a termination condition:
//!
//! | Variant | Policy |
//! |---|---|
//! | `AllocFailed` at baseline creation | fatal, process exits |
//! | `AllocFailed` during Exp 3 / Exp 7 growth | sets reach-limit, clean unwind |
//! | `QueueFull` on publish | message dropped, never aborts |
//! | `TopicCreationFailed` | fatal at baseline time |
//! | `HandshakeDesync` | fatal on both peers |
//! | `ReachedLimit` | termination condition, not an error |
//! | `Shm` / `Spawn` | OS-level setup failures, fatal |
//!
//! **Do not** collapse these into `anyhow::Error` inside the library — the
//! controllers match on them. `anyhow` context is applied only at the binary
//! edge.

use std::io;

use thiserror::Error;

/// Result alias used throughout the library.
pub type BenchResult<T> = Result<T, BenchError>;

/// Benchmark-level failures.
#[derive(Debug, Error)]
pub enum BenchError {
    /// A task, queue or handle could not be allocated.
    ///
    /// Carries what was being allocated so the reach-limit report can name
    /// it.
    #[error("allocation failed: {what}")]
    AllocFailed { what: String },

    /// A bounded topic queue could not accept a new message slot.
    ///
    /// Publishers treat this as a dropped message; over-pressure surfaces
    /// downstream as missed deadlines in subscribers.
    #[error("topic {topic} queue full")]
    QueueFull { topic: u8 },

    /// The backing primitives for a topic could not be created or bound.
    #[error("topic {topic} creation failed: {reason}")]
    TopicCreationFailed { topic: u8, reason: String },

    /// A management handshake returned an unexpected value.
    ///
    /// Past a protocol desync the benchmark results are invalid, so both
    /// peers abort with this diagnostic.
    #[error("Handshake {side} Error: invalid response message in step {step}.")]
    HandshakeDesync {
        /// `"Send"` or `"Receive"`, matching the failing direction.
        side: &'static str,
        /// Protocol step (1 or 2) that observed the bad value.
        step: u8,
    },

    /// The platform can no longer grow the task set or topic population.
    ///
    /// A termination condition rather than a failure: the final report is
    /// still emitted and the process exits 0.
    #[error("experiment reach limit")]
    ReachedLimit,

    /// A named shared-memory operation failed.
    #[error("shared memory object '{name}': {source}")]
    Shm {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A real-time thread could not be spawned.
    #[error("spawning task '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_desync_matches_documented_diagnostic() {
        let err = BenchError::HandshakeDesync {
            side: "Send",
            step: 1,
        };
        assert_eq!(
            err.to_string(),
            "Handshake Send Error: invalid response message in step 1."
        );
    }

    #[test]
    fn queue_full_names_the_topic() {
        let err = BenchError::QueueFull { topic: 3 };
        assert_eq!(err.to_string(), "topic 3 queue full");
    }

    #[test]
    fn reach_limit_is_terse() {
        assert_eq!(BenchError::ReachedLimit.to_string(), "experiment reach limit");
    }
}
