//! ptsrunner -- automated Bluetooth PTS conformance test runner.
//!
//! Connects to one or more remote PTS automation engines, drives the IUT
//! through QEMU or a hardware TTY, and sequences conformance test cases
//! with retry and multi-engine (mesh) coordination.

pub mod config;
pub mod engine;
pub mod error;
pub mod iut;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod store;
pub mod sync;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use config::RunConfig;
use engine::{EngineSession, SessionOptions};
use orchestrator::Orchestrator;
use report::{Outcome, RunReport};
use store::ResultStore;
use sync::ResponseSync;

/// Execute one full conformance run with the given configuration.
///
/// Fatal errors here are limited to configuration and session
/// establishment; per-case failures land in the report as verdicts.
pub async fn run(config: RunConfig, cancel: CancellationToken) -> Result<RunReport> {
    config.validate()?;

    let sync = Arc::new(ResponseSync::new());
    let opts = SessionOptions::from_config(&config);

    let mut sessions = Vec::new();
    for (i, addr) in config.engine_addrs.iter().enumerate() {
        let session = EngineSession::connect(*addr, &opts, i as u32, Arc::clone(&sync))
            .await
            .context("session establishment failed")?;
        sessions.push(session);
    }

    let catalog = registry::enumerate(sessions.len());
    let primary = registry::filter(catalog.primary, &config.include, &config.exclude);
    tracing::info!(
        cases = primary.len(),
        additional = catalog.additional.len(),
        sessions = sessions.len(),
        "test case selection complete"
    );

    let iut = iut::from_config(&config);
    let orchestrator = Orchestrator::new(
        sessions,
        iut,
        Arc::clone(&sync),
        config.retry_limit,
        config.board.is_some(),
        cancel,
    );
    let mut report = orchestrator.run(primary, catalog.additional).await;

    if let Some(table) = &config.store_table {
        let store = ResultStore::open(store::DEFAULT_DB_PATH, table)
            .context("failed to open verdict store")?;
        let previous = store.last_outcomes().context("failed to read previous run")?;
        for verdict in &mut report.verdicts {
            verdict.regression = previous.get(&verdict.case_id) == Some(&Outcome::Pass)
                && verdict.outcome != Outcome::Pass;
        }
        store
            .record(&report.verdicts)
            .context("failed to store verdicts")?;
    }

    Ok(report)
}
