//! End-to-end scenarios against the scriptable fake engine: retry
//! accounting, mesh lock-step semantics, event synchronization, connection
//! loss, and cancellation.

mod common;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{CaseScript, FakeEngine, NullIut};
use ptsrunner::engine::rpc::Prompt;
use ptsrunner::engine::{EngineSession, SessionOptions};
use ptsrunner::error::CaseError;
use ptsrunner::orchestrator::Orchestrator;
use ptsrunner::registry::{
    CaseProcedure, ConfirmProcedure, PasskeyProcedure, ProcedureContext, Profile, TestCase,
};
use ptsrunner::report::Outcome;
use ptsrunner::sync::ResponseSync;

fn options() -> SessionOptions {
    SessionOptions {
        workspace: "zephyr-hci".to_string(),
        bd_addr: None,
        client_addr: None,
        max_logging: false,
    }
}

async fn connect_sessions(
    engine: &FakeEngine,
    count: u32,
    sync: &Arc<ResponseSync>,
) -> Result<Vec<EngineSession>> {
    let opts = options();
    let mut sessions = Vec::new();
    for id in 0..count {
        sessions.push(EngineSession::connect(engine.addr(), &opts, id, Arc::clone(sync)).await?);
    }
    Ok(sessions)
}

fn case(profile: Profile, id: &str) -> TestCase {
    TestCase::new(profile, id, Arc::new(ConfirmProcedure))
}

fn scripts(entries: &[(&str, Vec<CaseScript>)]) -> HashMap<String, VecDeque<CaseScript>> {
    entries
        .iter()
        .map(|(id, steps)| (id.to_string(), steps.iter().cloned().collect()))
        .collect()
}

/// Two sessions, five GAP cases, retry limit 1, one case fails once then
/// passes on retry: 5 PASSED, 0 FAILED, six attempts total.
#[tokio::test]
async fn test_retry_accounting_end_to_end() -> Result<()> {
    let engine = FakeEngine::start(scripts(&[(
        "GAP/CONN/NCON/BV-01-C",
        vec![CaseScript::fail(), CaseScript::pass()],
    )]))
    .await?;

    let sync = Arc::new(ResponseSync::new());
    let sessions = connect_sessions(&engine, 2, &sync).await?;

    let cases: Vec<TestCase> = [
        "GAP/DISC/NONM/BV-01-C",
        "GAP/DISC/GENM/BV-01-C",
        "GAP/CONN/NCON/BV-01-C",
        "GAP/CONN/UCON/BV-01-C",
        "GAP/CONN/ACEP/BV-01-C",
    ]
    .iter()
    .map(|id| case(Profile::Gap, id))
    .collect();

    let orchestrator = Orchestrator::new(
        sessions,
        Box::new(NullIut),
        Arc::clone(&sync),
        1,
        false,
        CancellationToken::new(),
    );
    let report = orchestrator.run(cases, Vec::new()).await;

    assert_eq!(report.count(Outcome::Pass), 5);
    assert_eq!(report.count(Outcome::Fail), 0);
    assert_eq!(report.total_attempts(), 6);
    let retried = report
        .verdicts
        .iter()
        .find(|v| v.case_id == "GAP/CONN/NCON/BV-01-C")
        .unwrap();
    assert_eq!(retried.retries, 1);
    Ok(())
}

/// Attempts never exceed 1 + retry limit; the last verdict is kept.
#[tokio::test]
async fn test_retry_exhaustion_keeps_last_verdict() -> Result<()> {
    let engine = FakeEngine::start(scripts(&[(
        "SM/MAS/PROT/BV-01-C",
        vec![CaseScript::fail(), CaseScript::fail(), CaseScript::pass()],
    )]))
    .await?;

    let sync = Arc::new(ResponseSync::new());
    let sessions = connect_sessions(&engine, 1, &sync).await?;

    let orchestrator = Orchestrator::new(
        sessions,
        Box::new(NullIut),
        Arc::clone(&sync),
        1,
        false,
        CancellationToken::new(),
    );
    let report = orchestrator
        .run(vec![case(Profile::Sm, "SM/MAS/PROT/BV-01-C")], Vec::new())
        .await;

    assert_eq!(report.total_attempts(), 2);
    assert_eq!(report.verdicts[0].outcome, Outcome::Fail);
    assert_eq!(report.verdicts[0].retries, 1);
    Ok(())
}

/// No retries are spent on cases that pass first time.
#[tokio::test]
async fn test_no_retry_on_pass() -> Result<()> {
    let engine = FakeEngine::start(HashMap::new()).await?;
    let sync = Arc::new(ResponseSync::new());
    let sessions = connect_sessions(&engine, 1, &sync).await?;

    let cases = vec![
        case(Profile::Gap, "GAP/DISC/NONM/BV-01-C"),
        case(Profile::Gatt, "GATT/SR/GAC/BV-01-C"),
        case(Profile::L2cap, "L2CAP/COS/CED/BV-01-C"),
    ];
    let orchestrator = Orchestrator::new(
        sessions,
        Box::new(NullIut),
        Arc::clone(&sync),
        3,
        false,
        CancellationToken::new(),
    );
    let report = orchestrator.run(cases, Vec::new()).await;

    assert_eq!(report.count(Outcome::Pass), 3);
    assert_eq!(report.total_attempts(), 3);
    Ok(())
}

/// A mesh case fans out to every session; one failing session fails the
/// logical case even though the other passed.
#[tokio::test]
async fn test_mesh_no_partial_pass() -> Result<()> {
    let engine = FakeEngine::start(scripts(&[(
        "MESH/NODE/RLY/BV-01-C",
        vec![CaseScript::fail(), CaseScript::pass()],
    )]))
    .await?;

    let sync = Arc::new(ResponseSync::new());
    let sessions = connect_sessions(&engine, 2, &sync).await?;

    let orchestrator = Orchestrator::new(
        sessions,
        Box::new(NullIut),
        Arc::clone(&sync),
        0,
        false,
        CancellationToken::new(),
    );
    let report = orchestrator
        .run(vec![case(Profile::Mesh, "MESH/NODE/RLY/BV-01-C")], Vec::new())
        .await;

    assert_eq!(report.verdicts.len(), 1);
    assert_eq!(report.verdicts[0].outcome, Outcome::Fail);
    Ok(())
}

/// The additional mesh sequence only runs after the primary mesh cases
/// passed.
#[tokio::test]
async fn test_additional_mesh_gated_on_primary() -> Result<()> {
    let failing = FakeEngine::start(scripts(&[(
        "MESH/NODE/RLY/BV-01-C",
        vec![CaseScript::fail(), CaseScript::fail()],
    )]))
    .await?;
    let sync = Arc::new(ResponseSync::new());
    let sessions = connect_sessions(&failing, 2, &sync).await?;

    let primary = vec![case(Profile::Mesh, "MESH/NODE/RLY/BV-01-C")];
    let additional = vec![case(Profile::Mesh, "MESH/SR/PROX/BV-01-C")];
    let orchestrator = Orchestrator::new(
        sessions,
        Box::new(NullIut),
        Arc::clone(&sync),
        0,
        false,
        CancellationToken::new(),
    );
    let report = orchestrator.run(primary, additional.clone()).await;
    // Additional sequence skipped: one verdict only.
    assert_eq!(report.verdicts.len(), 1);

    // Same shape but passing primary: additional runs.
    let passing = FakeEngine::start(HashMap::new()).await?;
    let sync = Arc::new(ResponseSync::new());
    let sessions = connect_sessions(&passing, 2, &sync).await?;
    let primary = vec![case(Profile::Mesh, "MESH/NODE/RLY/BV-01-C")];
    let orchestrator = Orchestrator::new(
        sessions,
        Box::new(NullIut),
        Arc::clone(&sync),
        0,
        false,
        CancellationToken::new(),
    );
    let report = orchestrator.run(primary, additional).await;
    assert_eq!(report.verdicts.len(), 2);
    assert_eq!(report.count(Outcome::Pass), 2);
    Ok(())
}

/// A passkey event that arrives before the prompt is buffered and consumed
/// by the procedure's registration; the reply carries the passkey digits.
#[tokio::test]
async fn test_buffered_event_answers_prompt() -> Result<()> {
    let engine = FakeEngine::start(scripts(&[(
        "SM/SLA/PKE/BV-02-C",
        vec![CaseScript::pass()
            .with_log("SM pairing started")
            .with_event("passkey_display", json!({"passkey": 915823}))
            .with_prompt("Please enter the passkey displayed on the IUT")],
    )]))
    .await?;

    let sync = Arc::new(ResponseSync::new());
    let sessions = connect_sessions(&engine, 1, &sync).await?;

    let cases = vec![TestCase::new(
        Profile::Sm,
        "SM/SLA/PKE/BV-02-C",
        Arc::new(PasskeyProcedure),
    )];
    let orchestrator = Orchestrator::new(
        sessions,
        Box::new(NullIut),
        Arc::clone(&sync),
        0,
        false,
        CancellationToken::new(),
    );
    let report = orchestrator.run(cases, Vec::new()).await;

    assert_eq!(report.verdicts[0].outcome, Outcome::Pass);
    assert!(report.verdicts[0]
        .logs
        .iter()
        .any(|l| l.contains("pairing started")));
    assert_eq!(sync.pending_count(), 0);
    Ok(())
}

/// A connection drop mid-case yields an ERROR verdict for that case and the
/// run continues instead of aborting.
#[tokio::test]
async fn test_connection_drop_yields_error_verdict() -> Result<()> {
    let engine = FakeEngine::start(scripts(&[(
        "GAP/DISC/NONM/BV-01-C",
        vec![CaseScript::drop_connection()],
    )]))
    .await?;

    let sync = Arc::new(ResponseSync::new());
    let sessions = connect_sessions(&engine, 1, &sync).await?;

    let cases = vec![
        case(Profile::Gap, "GAP/DISC/NONM/BV-01-C"),
        case(Profile::Gap, "GAP/DISC/GENM/BV-01-C"),
    ];
    let orchestrator = Orchestrator::new(
        sessions,
        Box::new(NullIut),
        Arc::clone(&sync),
        0,
        false,
        CancellationToken::new(),
    );
    let report = orchestrator.run(cases, Vec::new()).await;

    assert_eq!(report.verdicts.len(), 2);
    assert_eq!(report.verdicts[0].outcome, Outcome::Error);
    assert!(report.verdicts[0]
        .reason
        .as_deref()
        .unwrap()
        .contains("connection lost"));
    // The dead session errors subsequent cases too; the run itself survives.
    assert_eq!(report.verdicts[1].outcome, Outcome::Error);
    Ok(())
}

struct WaitForeverProcedure;

#[async_trait]
impl CaseProcedure for WaitForeverProcedure {
    async fn answer_prompt(
        &self,
        ctx: &ProcedureContext,
        _prompt: &Prompt,
    ) -> Result<String, CaseError> {
        let token = ctx.expect("never_arrives")?;
        ctx.wait(token).await?;
        Ok("OK".to_string())
    }
}

/// Interrupting the run while a pending response is outstanding clears all
/// entries and leaves no execution context blocked.
#[tokio::test]
async fn test_cancellation_clears_pending() -> Result<()> {
    let engine = FakeEngine::start(scripts(&[(
        "MESH/NODE/PROV/UPD/BV-12-C",
        vec![CaseScript::pass().with_prompt("waiting for provisioning")],
    )]))
    .await?;

    let sync = Arc::new(ResponseSync::new());
    let sessions = connect_sessions(&engine, 1, &sync).await?;

    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        sessions,
        Box::new(NullIut),
        Arc::clone(&sync),
        0,
        false,
        cancel.clone(),
    );
    let cases = vec![TestCase::new(
        Profile::Mesh,
        "MESH/NODE/PROV/UPD/BV-12-C",
        Arc::new(WaitForeverProcedure),
    )];
    let run = tokio::spawn(orchestrator.run(cases, Vec::new()));

    // Let the driver reach its await on the never-delivered event.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sync.pending_count(), 1);

    cancel.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run stayed blocked after cancellation")?;

    assert!(report.interrupted);
    assert_eq!(sync.pending_count(), 0);
    assert_eq!(report.verdicts[0].outcome, Outcome::Error);
    Ok(())
}
