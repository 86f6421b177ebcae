// SPDX-License-Identifier: AGPL-3.0-only

//! Pass/fail harness for validation binaries.
//!
//! Validation binaries follow one pattern: a hardcoded scenario, explicit
//! checks against documented tolerances, a summary on stdout, and exit code
//! 0 (all checks pass) or 1 (any check fails). This module provides the
//! shared bookkeeping.

/// A single validation check with its outcome.
#[derive(Debug, Clone)]
pub struct Check {
    /// Human-readable label.
    pub label: String,
    /// Whether this check passed.
    pub passed: bool,
    /// Observed/expected detail for the summary line.
    pub detail: String,
}

/// Accumulates checks and produces a summary with an exit code.
#[derive(Debug, Default)]
#[must_use]
pub struct ValidationHarness {
    /// Name of the validation binary.
    pub name: String,
    /// All checks performed.
    pub checks: Vec<Check>,
}

impl ValidationHarness {
    /// New harness for a named validation binary.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            checks: Vec::new(),
        }
    }

    /// Boolean invariant check.
    pub fn check_true(&mut self, label: &str, passed: bool, detail: &str) {
        self.checks.push(Check {
            label: label.to_string(),
            passed,
            detail: detail.to_string(),
        });
    }

    /// Absolute tolerance check: `|observed - expected| < tolerance`.
    pub fn check_abs(&mut self, label: &str, observed: f64, expected: f64, tolerance: f64) {
        let err = (observed - expected).abs();
        self.checks.push(Check {
            label: label.to_string(),
            passed: err < tolerance,
            detail: format!("observed={observed:.6e}, expected={expected:.6e}, |err|={err:.2e}"),
        });
    }

    /// Exact integer count check.
    pub fn check_count(&mut self, label: &str, observed: usize, expected: usize) {
        self.checks.push(Check {
            label: label.to_string(),
            passed: observed == expected,
            detail: format!("observed={observed}, expected={expected}"),
        });
    }

    /// Upper-bound check: `observed < threshold`.
    pub fn check_upper(&mut self, label: &str, observed: f64, threshold: f64) {
        self.checks.push(Check {
            label: label.to_string(),
            passed: observed < threshold,
            detail: format!("observed={observed:.6e} < {threshold:.6e}"),
        });
    }

    /// True iff every check passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Print the per-check summary and the verdict line.
    pub fn print_summary(&self) {
        println!();
        println!("  ── {} ──", self.name);
        for c in &self.checks {
            let mark = if c.passed { "PASS" } else { "FAIL" };
            println!("    [{mark}] {} — {}", c.label, c.detail);
        }
        let n_pass = self.checks.iter().filter(|c| c.passed).count();
        println!("    {} / {} checks passed", n_pass, self.checks.len());
    }

    /// Exit code for the binary: 0 when everything passed, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.all_passed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_harness_passes() {
        let h = ValidationHarness::new("t");
        assert!(h.all_passed());
        assert_eq!(h.exit_code(), 0);
    }

    #[test]
    fn abs_check_within_tolerance() {
        let mut h = ValidationHarness::new("t");
        h.check_abs("close", 1.0, 1.0 + 1e-12, 1e-9);
        assert!(h.all_passed());
    }

    #[test]
    fn abs_check_outside_tolerance() {
        let mut h = ValidationHarness::new("t");
        h.check_abs("far", 1.0, 2.0, 1e-9);
        assert!(!h.all_passed());
        assert_eq!(h.exit_code(), 1);
    }

    #[test]
    fn count_check_exact() {
        let mut h = ValidationHarness::new("t");
        h.check_count("n", 5, 5);
        h.check_count("m", 5, 6);
        assert!(h.checks[0].passed);
        assert!(!h.checks[1].passed);
    }

    #[test]
    fn upper_bound_is_strict() {
        let mut h = ValidationHarness::new("t");
        h.check_upper("strict", 1.0, 1.0);
        assert!(!h.all_passed());
    }

    #[test]
    fn bool_check_records_detail() {
        let mut h = ValidationHarness::new("t");
        h.check_true("flag", true, "context");
        assert!(h.all_passed());
        assert_eq!(h.checks[0].detail, "context");
    }
}
