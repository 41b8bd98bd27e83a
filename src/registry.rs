//! Test case registry: the per-profile case catalog, group expansion, and
//! include/exclude filtering.
//!
//! Cases are plain descriptors in fixed tables; group membership is resolved
//! by name, no reflection-style discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::engine::rpc::Prompt;
use crate::error::CaseError;
use crate::report::Outcome;
use crate::sync::{EventPayload, PendingToken, ResponseSync, SessionId};

/// How long a procedure waits for an IUT event before giving up on the case.
const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    Gap,
    Gatt,
    Sm,
    L2cap,
    Mesh,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Gap => "GAP",
            Profile::Gatt => "GATT",
            Profile::Sm => "SM",
            Profile::L2cap => "L2CAP",
            Profile::Mesh => "MESH",
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handed to a procedure while a prompt is being answered. Owns clones of the
/// run-wide synchronizer and cancellation token, so procedures can await IUT
/// events without borrowing the session.
pub struct ProcedureContext {
    pub session: SessionId,
    pub sync: Arc<ResponseSync>,
    pub cancel: CancellationToken,
}

impl ProcedureContext {
    /// Register an expectation for an IUT event of `kind`.
    pub fn expect(&self, kind: &str) -> Result<PendingToken, CaseError> {
        Ok(self.sync.register_pending(self.session, kind)?)
    }

    /// Wait for a previously registered expectation. Returns early with
    /// `Cancelled` when the run is interrupted; the stale entry is removed by
    /// the orchestrator's cancellation sweep.
    pub async fn wait(&self, token: PendingToken) -> Result<EventPayload, CaseError> {
        tokio::select! {
            res = self.sync.await_response(token, EVENT_TIMEOUT) => res,
            _ = self.cancel.cancelled() => Err(CaseError::Cancelled),
        }
    }
}

/// Per-case logic deciding how engine prompts are answered.
#[async_trait]
pub trait CaseProcedure: Send + Sync {
    async fn answer_prompt(
        &self,
        ctx: &ProcedureContext,
        prompt: &Prompt,
    ) -> Result<String, CaseError>;
}

/// Default procedure: confirm every prompt. Covers the many cases where the
/// engine only asks for acknowledgement of an implicit-send step.
pub struct ConfirmProcedure;

#[async_trait]
impl CaseProcedure for ConfirmProcedure {
    async fn answer_prompt(
        &self,
        _ctx: &ProcedureContext,
        _prompt: &Prompt,
    ) -> Result<String, CaseError> {
        Ok("OK".to_string())
    }
}

/// Pairing cases where the IUT displays a passkey the engine wants typed
/// back. The expectation is registered when the prompt arrives; a passkey
/// event that raced ahead of the prompt is picked up from the unmatched
/// buffer.
pub struct PasskeyProcedure;

#[async_trait]
impl CaseProcedure for PasskeyProcedure {
    async fn answer_prompt(
        &self,
        ctx: &ProcedureContext,
        prompt: &Prompt,
    ) -> Result<String, CaseError> {
        if !prompt.description.to_lowercase().contains("passkey") {
            return Ok("OK".to_string());
        }
        let token = ctx.expect("passkey_display")?;
        let payload = ctx.wait(token).await?;
        let passkey = payload.data["passkey"].as_u64().unwrap_or(0);
        Ok(format!("{passkey:06}"))
    }
}

/// Mesh provisioning cases: the engine asks whether the provisioning bearer
/// link opened on the IUT before it proceeds with the exchange.
pub struct MeshProvisionProcedure;

#[async_trait]
impl CaseProcedure for MeshProvisionProcedure {
    async fn answer_prompt(
        &self,
        ctx: &ProcedureContext,
        prompt: &Prompt,
    ) -> Result<String, CaseError> {
        if !prompt.description.to_lowercase().contains("link open") {
            return Ok("OK".to_string());
        }
        let token = ctx.expect("mesh_link_open")?;
        ctx.wait(token).await?;
        Ok("OK".to_string())
    }
}

/// One registered conformance test case. Immutable once registered.
#[derive(Clone)]
pub struct TestCase {
    /// PTS test case identifier, e.g. `GAP/DISC/NONM/BV-01-C`.
    pub id: String,
    pub profile: Profile,
    pub procedure: Arc<dyn CaseProcedure>,
    pub expected: Outcome,
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("id", &self.id)
            .field("profile", &self.profile)
            .field("expected", &self.expected)
            .finish()
    }
}

impl TestCase {
    pub fn new(profile: Profile, id: &str, procedure: Arc<dyn CaseProcedure>) -> Self {
        Self {
            id: id.to_string(),
            profile,
            procedure,
            expected: Outcome::Pass,
        }
    }
}

/// The enumerated case sequences for one run.
pub struct Catalog {
    /// Primary sequence in fixed profile order.
    pub primary: Vec<TestCase>,
    /// Supplementary mesh cases, run only after the primary sequence
    /// succeeds.
    pub additional: Vec<TestCase>,
}

fn confirm(profile: Profile, id: &str) -> TestCase {
    TestCase::new(profile, id, Arc::new(ConfirmProcedure))
}

fn gap_cases() -> Vec<TestCase> {
    [
        "GAP/DISC/NONM/BV-01-C",
        "GAP/DISC/LIMM/BV-03-C",
        "GAP/DISC/GENM/BV-01-C",
        "GAP/DISC/GENP/BV-01-C",
        "GAP/IDLE/NAMP/BV-01-C",
        "GAP/CONN/NCON/BV-01-C",
        "GAP/CONN/UCON/BV-01-C",
        "GAP/CONN/ACEP/BV-01-C",
        "GAP/CONN/GCEP/BV-01-C",
        "GAP/CONN/PRDA/BV-01-C",
    ]
    .into_iter()
    .map(|id| confirm(Profile::Gap, id))
    .collect()
}

fn gatt_cases() -> Vec<TestCase> {
    [
        "GATT/SR/GAC/BV-01-C",
        "GATT/SR/GAD/BV-01-C",
        "GATT/SR/GAR/BV-01-C",
        "GATT/SR/GAW/BV-01-C",
        "GATT/SR/GAN/BV-01-C",
        "GATT/CL/GAD/BV-01-C",
        "GATT/CL/GAR/BV-01-C",
        "GATT/CL/GAW/BV-01-C",
    ]
    .into_iter()
    .map(|id| confirm(Profile::Gatt, id))
    .collect()
}

fn sm_cases() -> Vec<TestCase> {
    let passkey: Arc<dyn CaseProcedure> = Arc::new(PasskeyProcedure);
    vec![
        confirm(Profile::Sm, "SM/MAS/PROT/BV-01-C"),
        confirm(Profile::Sm, "SM/SLA/PROT/BV-02-C"),
        confirm(Profile::Sm, "SM/MAS/JW/BV-05-C"),
        TestCase::new(Profile::Sm, "SM/MAS/PKE/BV-01-C", Arc::clone(&passkey)),
        TestCase::new(Profile::Sm, "SM/SLA/PKE/BV-02-C", passkey),
        confirm(Profile::Sm, "SM/SLA/SIP/BV-01-C"),
    ]
}

fn l2cap_cases() -> Vec<TestCase> {
    [
        "L2CAP/COS/CED/BV-01-C",
        "L2CAP/COS/CFD/BV-01-C",
        "L2CAP/LE/CFC/BV-02-C",
        "L2CAP/LE/CFC/BV-04-C",
    ]
    .into_iter()
    .map(|id| confirm(Profile::L2cap, id))
    .collect()
}

/// Mesh needs coordinated participation of at least two engine sessions.
/// The second vector is the supplementary sequence paired with multi-device
/// setup/teardown.
fn mesh_cases() -> (Vec<TestCase>, Vec<TestCase>) {
    let provision: Arc<dyn CaseProcedure> = Arc::new(MeshProvisionProcedure);
    let primary = vec![
        TestCase::new(Profile::Mesh, "MESH/NODE/PROV/UPD/BV-12-C", provision),
        confirm(Profile::Mesh, "MESH/NODE/RLY/BV-01-C"),
        confirm(Profile::Mesh, "MESH/NODE/CFG/COMP/BV-01-C"),
    ];
    let additional = vec![
        confirm(Profile::Mesh, "MESH/SR/PROX/BV-01-C"),
        confirm(Profile::Mesh, "MESH/SR/PROX/BV-02-C"),
    ];
    (primary, additional)
}

/// Enumerate the full catalog in fixed profile order: GAP, GATT, SM, L2CAP,
/// then MESH when at least two engine sessions are configured.
pub fn enumerate(num_sessions: usize) -> Catalog {
    let mut primary = gap_cases();
    primary.extend(gatt_cases());
    primary.extend(sm_cases());
    primary.extend(l2cap_cases());

    let additional = if num_sessions >= 2 {
        let (mesh_primary, mesh_additional) = mesh_cases();
        primary.extend(mesh_primary);
        mesh_additional
    } else {
        Vec::new()
    };

    Catalog {
        primary,
        additional,
    }
}

/// A selector name matches either an exact case identifier or a profile
/// group expanding to all cases in that group.
fn matches(case: &TestCase, name: &str) -> bool {
    if case.id == name {
        return true;
    }
    match name {
        "GAP" => case.profile == Profile::Gap,
        "GATT" => case.profile == Profile::Gatt,
        "GATTS" => case.id.starts_with("GATT/SR/"),
        "GATTC" => case.id.starts_with("GATT/CL/"),
        "SM" => case.profile == Profile::Sm,
        "L2CAP" => case.profile == Profile::L2cap,
        "MESH" => case.profile == Profile::Mesh,
        _ => false,
    }
}

/// Apply include/exclude selection. `include` acts first as a whitelist,
/// `exclude` is then subtracted. With neither given, all cases pass through
/// unchanged.
pub fn filter(cases: Vec<TestCase>, include: &[String], exclude: &[String]) -> Vec<TestCase> {
    cases
        .into_iter()
        .filter(|case| {
            let included =
                include.is_empty() || include.iter().any(|name| matches(case, name));
            included && !exclude.iter().any(|name| matches(case, name))
        })
        .collect()
}
