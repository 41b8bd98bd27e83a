//! Run report: verdict collection, per-outcome counts, table rendering.

use std::fmt::Write as _;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final outcome classification of one test case execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    Inconclusive,
    Error,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
            Outcome::Inconclusive => "INCONC",
            Outcome::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(Outcome::Pass),
            "FAIL" => Ok(Outcome::Fail),
            "INCONC" => Ok(Outcome::Inconclusive),
            "ERROR" => Ok(Outcome::Error),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// Result of a completed test case. Immutable once produced.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub case_id: String,
    pub outcome: Outcome,
    pub reason: Option<String>,
    /// Extra attempts consumed beyond the first.
    pub retries: u32,
    /// Engine log lines accumulated during the final attempt.
    pub logs: Vec<String>,
    pub elapsed: Duration,
    /// Set when the stored previous run passed this case and this run did not.
    pub regression: bool,
}

/// Aggregate result of one run.
#[derive(Debug)]
pub struct RunReport {
    pub verdicts: Vec<Verdict>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl RunReport {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.verdicts.iter().filter(|v| v.outcome == outcome).count()
    }

    /// Total attempts across all cases: one per verdict plus its retries.
    pub fn total_attempts(&self) -> u32 {
        self.verdicts.iter().map(|v| 1 + v.retries).sum()
    }

    /// Render the final per-case table plus a summary line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<28} | {:<8} | {:<8} | Notes",
            "Test case", "Outcome", "Attempts"
        );
        let _ = writeln!(out, "{:-<28}-|-{:-<8}-|-{:-<8}-|-{:-<30}", "", "", "", "");
        for v in &self.verdicts {
            let mut notes = String::new();
            if let Some(reason) = &v.reason {
                notes.push_str(reason);
            }
            if v.regression {
                if !notes.is_empty() {
                    notes.push_str("; ");
                }
                notes.push_str("REGRESSION");
            }
            let _ = writeln!(
                out,
                "{:<28} | {:<8} | {:<8} | {}",
                v.case_id,
                v.outcome.to_string(),
                1 + v.retries,
                notes
            );
        }
        let _ = writeln!(
            out,
            "\n{} passed, {} failed, {} inconclusive, {} errors ({} attempts in {:.1}s)",
            self.count(Outcome::Pass),
            self.count(Outcome::Fail),
            self.count(Outcome::Inconclusive),
            self.count(Outcome::Error),
            self.total_attempts(),
            self.elapsed.as_secs_f64()
        );
        if self.interrupted {
            let _ = writeln!(out, "run interrupted, remaining test cases skipped");
        }
        out
    }
}
