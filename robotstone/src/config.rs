/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Benchmark configuration loading.
//!
//! Both node binaries accept an optional YAML file; every key has a default
//! matching the original build-time constants, so running without a file is
//! the common case. The expected structure is:
//!
//! ```yaml
//! raw_speed: 413500          # pre-calibrated KWIPS; omit to measure at startup
//! test_period_secs: 10
//! shm_namespace: "rstone"
//! max_synthetic_tasks: 64
//! machine_readable: false
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default processor raw speed in KWIPS, measured once on the reference
/// platform. Used whenever no calibration run has been requested.
pub const RAW_SPEED: u64 = 413_500;

/// Default duration of one test step, in seconds.
pub const DEFAULT_TEST_PERIOD_SECS: u64 = 10;

/// Default prefix for every named shared-memory object the pair of
/// processes creates.
pub const DEFAULT_SHM_NAMESPACE: &str = "rstone";

/// Default capacity of the synthetic task pool.
///
/// Models the fixed-size real-time heap of the reference platform: task
/// creation beyond this count fails with `AllocFailed`, which is what drives
/// the Exp 3 and Exp 7 reach-limit terminations.
pub const DEFAULT_MAX_SYNTHETIC_TASKS: usize = 64;

// ── Private YAML deserialization type ─────────────────────────────────────────

/// File layout as written by the user. Kept private — callers work with
/// [`BenchConfig`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BenchConfigFile {
    raw_speed: Option<u64>,
    test_period_secs: Option<u64>,
    shm_namespace: Option<String>,
    max_synthetic_tasks: Option<usize>,
    machine_readable: Option<bool>,
}

// ── Public configuration ──────────────────────────────────────────────────────

/// Resolved benchmark configuration.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Pre-calibrated raw speed in KWIPS. `None` means the controller
    /// measures the local machine before the first experiment.
    pub raw_speed: Option<u64>,

    /// Duration of one test step in seconds.
    pub test_period_secs: u64,

    /// Prefix for named shared-memory objects, so concurrent benchmark
    /// pairs on one host never collide.
    pub shm_namespace: String,

    /// Synthetic task pool capacity; exceeding it is `AllocFailed`.
    pub max_synthetic_tasks: usize,

    /// Append the machine-readable per-task rows after each report.
    pub machine_readable: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            raw_speed: Some(RAW_SPEED),
            test_period_secs: DEFAULT_TEST_PERIOD_SECS,
            shm_namespace: DEFAULT_SHM_NAMESPACE.to_string(),
            max_synthetic_tasks: DEFAULT_MAX_SYNTHETIC_TASKS,
            machine_readable: false,
        }
    }
}

impl BenchConfig {
    /// Parse `path`, filling absent keys with their defaults.
    ///
    /// A `raw_speed` key explicitly set to `~` (YAML null) requests startup
    /// calibration; an absent key keeps the reference-platform constant.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is
    /// structurally invalid (including unknown keys, which are almost
    /// always typos in a five-key file).
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open configuration file: {}", path.display()))?;

        // serde_yaml cannot distinguish an absent `raw_speed` from an
        // explicit null, so probe the raw document for the key.
        let file: BenchConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse YAML file: {}", path.display()))?;
        let raw_speed_key_present = content
            .lines()
            .any(|l| l.trim_start().starts_with("raw_speed"));

        let defaults = Self::default();
        let cfg = Self {
            raw_speed: if raw_speed_key_present {
                file.raw_speed
            } else {
                defaults.raw_speed
            },
            test_period_secs: file.test_period_secs.unwrap_or(defaults.test_period_secs),
            shm_namespace: file.shm_namespace.unwrap_or(defaults.shm_namespace),
            max_synthetic_tasks: file
                .max_synthetic_tasks
                .unwrap_or(defaults.max_synthetic_tasks),
            machine_readable: file.machine_readable.unwrap_or(defaults.machine_readable),
        };

        tracing::info!(
            raw_speed = ?cfg.raw_speed,
            test_period_secs = cfg.test_period_secs,
            shm_namespace = %cfg.shm_namespace,
            max_synthetic_tasks = cfg.max_synthetic_tasks,
            "configuration loaded"
        );

        Ok(cfg)
    }

    /// Test-step duration in ticks.
    pub fn test_period_ticks(&self) -> crate::clock::Tick {
        self.test_period_secs * crate::clock::TICKS_PER_SECOND
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn default_matches_build_constants() {
        let cfg = BenchConfig::default();
        assert_eq!(cfg.raw_speed, Some(RAW_SPEED));
        assert_eq!(cfg.test_period_secs, DEFAULT_TEST_PERIOD_SECS);
        assert_eq!(cfg.shm_namespace, DEFAULT_SHM_NAMESPACE);
        assert_eq!(cfg.max_synthetic_tasks, DEFAULT_MAX_SYNTHETIC_TASKS);
        assert!(!cfg.machine_readable);
    }

    #[test]
    fn full_file_overrides_everything() {
        let f = yaml_tempfile(
            r#"
raw_speed: 500000
test_period_secs: 2
shm_namespace: "bench_a"
max_synthetic_tasks: 8
machine_readable: true
"#,
        );
        let cfg = BenchConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.raw_speed, Some(500_000));
        assert_eq!(cfg.test_period_secs, 2);
        assert_eq!(cfg.shm_namespace, "bench_a");
        assert_eq!(cfg.max_synthetic_tasks, 8);
        assert!(cfg.machine_readable);
    }

    #[test]
    fn absent_keys_fall_back_to_defaults() {
        let f = yaml_tempfile("test_period_secs: 3\n");
        let cfg = BenchConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.test_period_secs, 3);
        assert_eq!(cfg.raw_speed, Some(RAW_SPEED), "absent key keeps constant");
        assert_eq!(cfg.shm_namespace, DEFAULT_SHM_NAMESPACE);
    }

    #[test]
    fn explicit_null_raw_speed_requests_calibration() {
        let f = yaml_tempfile("raw_speed: ~\n");
        let cfg = BenchConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.raw_speed, None);
    }

    #[test]
    fn missing_file_returns_error() {
        let result = BenchConfig::load_from_file(Path::new("/nonexistent/bench.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let f = yaml_tempfile("test_perod_secs: 3\n"); // typo
        assert!(BenchConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn test_period_ticks_scales_by_tick_rate() {
        let cfg = BenchConfig {
            test_period_secs: 10,
            ..Default::default()
        };
        assert_eq!(cfg.test_period_ticks(), 10 * crate::clock::TICKS_PER_SECOND);
    }
}
