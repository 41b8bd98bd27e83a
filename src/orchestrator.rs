//! Test execution orchestrator.
//!
//! Single-threaded sequencing logic: steps through the filtered case list in
//! registry order, resets and starts the IUT per attempt, drives the engine
//! session(s), applies the retry policy, and collects verdicts. Mesh cases
//! fan out to every configured session and join all completions; any session
//! failing fails the logical case. Cancellation clears every outstanding
//! pending response before sessions are released, so no waiter stays
//! blocked.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{CaseRun, EngineSession};
use crate::error::CaseError;
use crate::iut::IutController;
use crate::registry::{Profile, TestCase};
use crate::report::{Outcome, RunReport, Verdict};
use crate::sync::ResponseSync;

pub struct Orchestrator {
    sessions: Vec<EngineSession>,
    iut: Box<dyn IutController>,
    sync: Arc<ResponseSync>,
    retry_limit: u32,
    reset_board: bool,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        sessions: Vec<EngineSession>,
        iut: Box<dyn IutController>,
        sync: Arc<ResponseSync>,
        retry_limit: u32,
        reset_board: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sessions,
            iut,
            sync,
            retry_limit,
            reset_board,
            cancel,
        }
    }

    /// Run the primary sequence, then the supplementary mesh sequence, and
    /// produce the aggregate report. Per-case failures are recovered into
    /// verdicts; this function itself never fails.
    pub async fn run(mut self, primary: Vec<TestCase>, additional: Vec<TestCase>) -> RunReport {
        let started_at = Utc::now();
        let t0 = Instant::now();
        let mut verdicts = Vec::new();

        self.run_sequence(&primary, &mut verdicts).await;

        // The supplementary mesh cases pair with multi-device state set up
        // by the primary mesh sequence; skip them unless that state is
        // known-good.
        if !additional.is_empty() && !self.cancel.is_cancelled() {
            let mesh_ok = primary
                .iter()
                .zip(&verdicts)
                .filter(|(case, _)| case.profile == Profile::Mesh)
                .all(|(_, verdict)| verdict.outcome == Outcome::Pass);
            if mesh_ok {
                info!(count = additional.len(), "running additional mesh test cases");
                self.run_sequence(&additional, &mut verdicts).await;
            } else {
                warn!("primary mesh sequence did not pass, skipping additional mesh test cases");
            }
        }

        let interrupted = self.cancel.is_cancelled();
        if interrupted {
            // Clear outstanding expectations before releasing sessions so no
            // execution context remains blocked in await_response.
            self.sync.clear_all();
        }
        self.iut.stop().await;
        for session in &mut self.sessions {
            session.disconnect().await;
        }

        RunReport {
            verdicts,
            started_at,
            elapsed: t0.elapsed(),
            interrupted,
        }
    }

    async fn run_sequence(&mut self, cases: &[TestCase], verdicts: &mut Vec<Verdict>) {
        for case in cases {
            if self.cancel.is_cancelled() {
                break;
            }
            let verdict = self.run_one(case).await;
            if verdict.outcome != case.expected {
                warn!(case = %case.id, outcome = %verdict.outcome, "test case did not reach expected outcome");
            }
            verdicts.push(verdict);
        }
    }

    /// Drive one test case through its retry budget: up to `retry_limit`
    /// extra attempts, only on FAILED or ERRORED outcomes, never on PASSED.
    /// A case that exhausts retries keeps its last result.
    async fn run_one(&mut self, case: &TestCase) -> Verdict {
        let t0 = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            info!(case = %case.id, attempt = attempts, "running test case");
            let run = self.attempt(case).await;
            let retryable = matches!(run.outcome, Outcome::Fail | Outcome::Error);
            if retryable && attempts <= self.retry_limit && !self.cancel.is_cancelled() {
                warn!(case = %case.id, outcome = %run.outcome, attempt = attempts, "retrying test case");
                continue;
            }
            return Verdict {
                case_id: case.id.clone(),
                outcome: run.outcome,
                reason: run.reason,
                retries: attempts - 1,
                logs: run.logs,
                elapsed: t0.elapsed(),
                regression: false,
            };
        }
    }

    async fn attempt(&mut self, case: &TestCase) -> CaseRun {
        if self.reset_board {
            if let Err(e) = self.iut.reset().await {
                return device_error(e);
            }
        }
        if let Err(e) = self.iut.start().await {
            return device_error(e);
        }

        let run = if case.profile == Profile::Mesh && self.sessions.len() >= 2 {
            // Lock-step barrier: the same logical step goes to every
            // session, and all completions are joined before advancing.
            let cancel = &self.cancel;
            let runs = join_all(
                self.sessions
                    .iter_mut()
                    .map(|session| session.run_test_case(case, cancel)),
            )
            .await;
            merge_mesh(runs)
        } else {
            self.sessions[0].run_test_case(case, &self.cancel).await
        };

        self.iut.stop().await;
        run
    }
}

fn device_error(err: CaseError) -> CaseRun {
    warn!("device controller failed: {err}");
    CaseRun {
        outcome: Outcome::Error,
        reason: Some(err.to_string()),
        logs: Vec::new(),
    }
}

fn severity(outcome: Outcome) -> u8 {
    match outcome {
        Outcome::Pass => 0,
        Outcome::Inconclusive => 1,
        Outcome::Fail => 2,
        Outcome::Error => 3,
    }
}

/// Combine per-session results of one logical mesh case: the worst outcome
/// wins, so a single failing session fails the case even when the others
/// pass.
fn merge_mesh(runs: Vec<CaseRun>) -> CaseRun {
    let mut outcome = Outcome::Pass;
    let mut reason = None;
    let mut logs = Vec::new();
    for (i, run) in runs.into_iter().enumerate() {
        logs.extend(run.logs);
        if severity(run.outcome) > severity(outcome) {
            outcome = run.outcome;
            reason = run
                .reason
                .map(|message| format!("session {i}: {message}"))
                .or(Some(format!("session {i} reported {}", run.outcome)));
        }
    }
    CaseRun {
        outcome,
        reason,
        logs,
    }
}
