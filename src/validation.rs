// SPDX-License-Identifier: AGPL-3.0-only

//! Pass/fail harness for the validation binary.
//!
//! Each check records what was measured, what it was compared with and how.
//! [`ValidationHarness::finish`] prints a table plus a one-line JSON summary
//! and exits 0 when every check passed, 1 otherwise.

use std::fmt::{self, Write};
use std::process;

/// How a threshold is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    /// |observed − expected| ≤ tolerance
    Absolute,
    /// |observed − expected| ≤ tolerance·|expected|
    Relative,
    /// observed < threshold
    Upper,
    /// observed > threshold
    Lower,
    /// boolean condition
    Flag,
}

impl fmt::Display for CheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute => write!(f, "abs"),
            Self::Relative => write!(f, "rel"),
            Self::Upper => write!(f, "<"),
            Self::Lower => write!(f, ">"),
            Self::Flag => write!(f, "flag"),
        }
    }
}

/// One recorded check.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Check {
    /// Label shown in the summary.
    pub label: String,
    /// Outcome.
    pub passed: bool,
    /// Measured value.
    pub observed: f64,
    /// Reference value or threshold.
    pub expected: f64,
    /// Tolerance (0 for bounds and flags).
    pub tolerance: f64,
    /// How `expected` and `tolerance` were applied.
    pub mode: CheckMode,
}

#[derive(serde::Serialize)]
struct Summary<'a> {
    name: &'a str,
    passed: usize,
    total: usize,
    failed: Vec<&'a str>,
}

/// Accumulates checks for one validation run.
#[derive(Debug, Default)]
#[must_use]
pub struct ValidationHarness {
    /// Run name.
    pub name: String,
    /// Checks in the order they were made.
    pub checks: Vec<Check>,
}

impl ValidationHarness {
    /// Empty harness.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            checks: Vec::new(),
        }
    }

    fn push(&mut self, label: &str, passed: bool, observed: f64, expected: f64, tolerance: f64, mode: CheckMode) {
        if !passed {
            tracing::warn!(label, observed, expected, tolerance, %mode, "check failed");
        }
        self.checks.push(Check {
            label: label.to_string(),
            passed,
            observed,
            expected,
            tolerance,
            mode,
        });
    }

    /// |observed − expected| ≤ tolerance. NaN fails.
    pub fn check_abs(&mut self, label: &str, observed: f64, expected: f64, tolerance: f64) {
        let passed = (observed - expected).abs() <= tolerance;
        self.push(label, passed, observed, expected, tolerance, CheckMode::Absolute);
    }

    /// |observed − expected| ≤ tolerance·|expected|; with `expected == 0`
    /// falls back to |observed| ≤ tolerance.
    pub fn check_rel(&mut self, label: &str, observed: f64, expected: f64, tolerance: f64) {
        let diff = (observed - expected).abs();
        let passed = if expected == 0.0 {
            diff <= tolerance
        } else {
            diff <= tolerance * expected.abs()
        };
        self.push(label, passed, observed, expected, tolerance, CheckMode::Relative);
    }

    /// observed < threshold.
    pub fn check_upper(&mut self, label: &str, observed: f64, threshold: f64) {
        self.push(label, observed < threshold, observed, threshold, 0.0, CheckMode::Upper);
    }

    /// observed > threshold.
    pub fn check_lower(&mut self, label: &str, observed: f64, threshold: f64) {
        self.push(label, observed > threshold, observed, threshold, 0.0, CheckMode::Lower);
    }

    /// Boolean condition.
    pub fn check_bool(&mut self, label: &str, passed: bool) {
        self.push(label, passed, f64::from(u8::from(passed)), 1.0, 0.0, CheckMode::Flag);
    }

    /// Checks that passed.
    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    /// All checks made.
    #[must_use]
    pub const fn total_count(&self) -> usize {
        self.checks.len()
    }

    /// Whether every check passed (true when none were made).
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    fn failed_labels(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.label.as_str())
            .collect()
    }

    /// Human-readable table.
    #[must_use]
    pub fn format_summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(
            s,
            "═══ {}: {}/{} checks passed ═══",
            self.name,
            self.passed_count(),
            self.total_count()
        );
        for c in &self.checks {
            let icon = if c.passed { "✓" } else { "✗" };
            let _ = writeln!(
                s,
                "  {icon} {}: observed={:.6e}, expected={:.6e}, tol={:.2e} ({})",
                c.label, c.observed, c.expected, c.tolerance, c.mode
            );
        }
        s
    }

    /// Machine-readable one-line summary.
    #[must_use]
    pub fn summary_json(&self) -> String {
        let summary = Summary {
            name: &self.name,
            passed: self.passed_count(),
            total: self.total_count(),
            failed: self.failed_labels(),
        };
        serde_json::to_string(&summary).unwrap_or_default()
    }

    /// Print the summary and exit: 0 if all checks passed, 1 otherwise.
    pub fn finish(&self) -> ! {
        println!();
        print!("{}", self.format_summary());
        println!("{}", self.summary_json());
        if self.all_passed() {
            println!("ALL CHECKS PASSED");
            process::exit(0);
        }
        println!("FAILED CHECKS: {}", self.failed_labels().join(", "));
        process::exit(1);
    }
}
