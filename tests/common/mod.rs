//! Scriptable fake PTS engine for integration tests.
//!
//! Speaks the real wire codec over localhost TCP: Hello/HelloAck handshake,
//! then per-case scripts of log lines, events, one optional prompt, and a
//! closing verdict. Scripts are queued per case id, so successive attempts
//! (retries, or the per-session fan-out of a mesh case) pop successive
//! scripts.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use ptsrunner::engine::rpc::{
    CaseVerdict, EngineMessage, EventReport, HelloAck, LogLine, MessagePayload, Prompt,
};
use ptsrunner::engine::wire::EngineCodec;
use ptsrunner::error::CaseError;
use ptsrunner::iut::IutController;
use ptsrunner::report::Outcome;

#[derive(Debug, Clone)]
pub struct CaseScript {
    pub logs: Vec<String>,
    pub events: Vec<(String, serde_json::Value)>,
    pub prompt: Option<String>,
    pub outcome: Outcome,
    pub reason: Option<String>,
    /// Close the connection instead of answering.
    pub drop_connection: bool,
}

impl CaseScript {
    pub fn pass() -> Self {
        Self {
            logs: Vec::new(),
            events: Vec::new(),
            prompt: None,
            outcome: Outcome::Pass,
            reason: None,
            drop_connection: false,
        }
    }

    pub fn fail() -> Self {
        Self {
            outcome: Outcome::Fail,
            reason: Some("verdict: FAIL".to_string()),
            ..Self::pass()
        }
    }

    pub fn drop_connection() -> Self {
        Self {
            drop_connection: true,
            ..Self::pass()
        }
    }

    pub fn with_prompt(mut self, description: &str) -> Self {
        self.prompt = Some(description.to_string());
        self
    }

    pub fn with_event(mut self, kind: &str, data: serde_json::Value) -> Self {
        self.events.push((kind.to_string(), data));
        self
    }

    pub fn with_log(mut self, line: &str) -> Self {
        self.logs.push(line.to_string());
        self
    }
}

type Plan = Arc<Mutex<HashMap<String, VecDeque<CaseScript>>>>;

pub struct FakeEngine {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl FakeEngine {
    pub async fn start(scripts: HashMap<String, VecDeque<CaseScript>>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind fake engine")?;
        let addr = listener.local_addr()?;
        let plan: Plan = Arc::new(Mutex::new(scripts));

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let plan = Arc::clone(&plan);
                        tokio::spawn(async move {
                            let _ = handle_conn(stream, plan).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self { addr, accept_task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_conn(stream: TcpStream, plan: Plan) -> Result<()> {
    let mut framed = Framed::new(stream, EngineCodec::new());

    let first = framed
        .next()
        .await
        .context("connection closed before hello")??;
    match first.payload {
        MessagePayload::Hello(_) => {
            framed
                .send(EngineMessage {
                    request_id: first.request_id,
                    payload: MessagePayload::HelloAck(HelloAck {
                        version: "1.0".to_string(),
                        engine_id: "fake-pts".to_string(),
                    }),
                })
                .await?;
        }
        other => bail!("expected hello, got {other:?}"),
    }

    let mut prompt_seq = 0u32;
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let MessagePayload::RunTestCase(rtc) = frame.payload else {
            continue;
        };

        let script = plan
            .lock()
            .unwrap()
            .get_mut(&rtc.case_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(CaseScript::pass);

        if script.drop_connection {
            return Ok(());
        }

        for line in script.logs {
            framed
                .send(EngineMessage {
                    request_id: String::new(),
                    payload: MessagePayload::Log(LogLine { line }),
                })
                .await?;
        }

        for (kind, data) in script.events {
            framed
                .send(EngineMessage {
                    request_id: String::new(),
                    payload: MessagePayload::Event(EventReport { kind, data }),
                })
                .await?;
        }

        if let Some(description) = script.prompt {
            prompt_seq += 1;
            let prompt_id = format!("prompt-{prompt_seq}");
            framed
                .send(EngineMessage {
                    request_id: String::new(),
                    payload: MessagePayload::Prompt(Prompt {
                        prompt_id: prompt_id.clone(),
                        wid: 20001,
                        description,
                    }),
                })
                .await?;
            loop {
                let reply = framed
                    .next()
                    .await
                    .context("connection closed awaiting prompt reply")??;
                if let MessagePayload::PromptReply(pr) = reply.payload {
                    if pr.prompt_id == prompt_id {
                        break;
                    }
                }
            }
        }

        framed
            .send(EngineMessage {
                request_id: frame.request_id,
                payload: MessagePayload::Verdict(CaseVerdict {
                    case_id: rtc.case_id,
                    outcome: script.outcome,
                    reason: script.reason,
                }),
            })
            .await?;
    }
    Ok(())
}

/// Device controller stand-in; the scenarios under test exercise engine and
/// synchronizer behavior, not process management.
pub struct NullIut;

#[async_trait]
impl IutController for NullIut {
    async fn start(&mut self) -> Result<(), CaseError> {
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), CaseError> {
        Ok(())
    }

    async fn stop(&mut self) {}
}
