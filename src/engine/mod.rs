//! Engine session: the RPC connection to one remote PTS automation engine.
//!
//! A session is a framed TCP channel plus a spawned read task. The read task
//! is the callback-receiving context of the run: it correlates responses to
//! outstanding requests, routes IUT events into the response synchronizer,
//! buffers engine log lines, and forwards prompts to the driver.

pub mod rpc;
pub mod wire;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::RunError;
use crate::registry::{ProcedureContext, TestCase};
use crate::report::Outcome;
use crate::sync::{ResponseSync, SessionId};

use rpc::{EngineMessage, Hello, LogLevel, MessagePayload, Prompt, PromptReply, RunTestCase};
use wire::EngineCodec;

const PROTOCOL_VERSION: &str = "1.0";

type MessageSink = SplitSink<Framed<TcpStream, EngineCodec>, EngineMessage>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<MessagePayload>>>>;

/// Connection parameters shared by every session of a run.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub workspace: String,
    pub bd_addr: Option<String>,
    pub client_addr: Option<String>,
    pub max_logging: bool,
}

impl SessionOptions {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            workspace: config.workspace.clone(),
            bd_addr: config.bd_addr.clone(),
            client_addr: config.local_addr.clone(),
            max_logging: config.max_logging,
        }
    }
}

/// Result of one test case attempt on one session.
#[derive(Debug, Clone)]
pub struct CaseRun {
    pub outcome: Outcome,
    pub reason: Option<String>,
    pub logs: Vec<String>,
}

impl CaseRun {
    fn error(reason: &str, logs: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Error,
            reason: Some(reason.to_string()),
            logs,
        }
    }
}

/// A live connection to one remote test engine. Owned exclusively by the
/// orchestrator for its lifetime.
pub struct EngineSession {
    id: SessionId,
    addr: SocketAddr,
    sync: Arc<ResponseSync>,
    sink: Option<MessageSink>,
    prompt_rx: mpsc::UnboundedReceiver<Prompt>,
    pending: PendingMap,
    logs: Arc<Mutex<Vec<String>>>,
    read_task: Option<JoinHandle<()>>,
}

impl EngineSession {
    /// Establish the RPC channel: TCP connect, Hello/HelloAck exchange, then
    /// spawn the per-connection read task.
    pub async fn connect(
        addr: SocketAddr,
        opts: &SessionOptions,
        id: SessionId,
        sync: Arc<ResponseSync>,
    ) -> Result<Self, RunError> {
        let unreachable = |reason: String| RunError::EngineUnreachable { addr, reason };

        info!(session = id, address = %addr, "connecting to test engine");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        let mut framed = Framed::new(stream, EngineCodec::new());

        let hello = EngineMessage {
            request_id: "init-0".to_string(),
            payload: MessagePayload::Hello(Hello {
                version: PROTOCOL_VERSION.to_string(),
                workspace: opts.workspace.clone(),
                bd_addr: opts.bd_addr.clone(),
                client_addr: opts.client_addr.clone(),
                log_level: if opts.max_logging {
                    LogLevel::Maximum
                } else {
                    LogLevel::Normal
                },
            }),
        };
        framed
            .send(hello)
            .await
            .map_err(|e| unreachable(format!("failed to send hello: {e}")))?;

        let response = framed
            .next()
            .await
            .ok_or_else(|| unreachable("connection closed before hello ack".to_string()))?
            .map_err(|e| unreachable(format!("failed to decode hello ack: {e}")))?;

        match response.payload {
            MessagePayload::HelloAck(ack) => {
                info!(session = id, engine = %ack.engine_id, version = %ack.version, "handshake complete");
            }
            other => {
                return Err(unreachable(format!("expected hello ack, got {other:?}")));
            }
        }

        let (sink, stream) = framed.split();
        let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let logs = Arc::new(Mutex::new(Vec::new()));

        let read_task = tokio::spawn(read_loop(
            stream,
            id,
            Arc::clone(&sync),
            Arc::clone(&pending),
            prompt_tx,
            Arc::clone(&logs),
        ));

        Ok(Self {
            id,
            addr,
            sync,
            sink: Some(sink),
            prompt_rx,
            pending,
            logs,
            read_task: Some(read_task),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Drive one test case to a verdict.
    ///
    /// Synchronous from the caller's perspective; while the request is
    /// outstanding the read task keeps routing events into the synchronizer
    /// and this loop answers prompts through the case's procedure. A
    /// connection drop mid-case yields an ERROR outcome, never a run
    /// failure.
    pub async fn run_test_case(&mut self, case: &TestCase, cancel: &CancellationToken) -> CaseRun {
        // Stale state from a previous case must not leak into this one.
        while self.prompt_rx.try_recv().is_ok() {}
        self.logs.lock().unwrap().clear();

        if self.sink.is_none() {
            return CaseRun::error("engine session closed", Vec::new());
        }

        let request_id = Uuid::new_v4().to_string();
        let (verdict_tx, mut verdict_rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), verdict_tx);

        let request = EngineMessage {
            request_id: request_id.clone(),
            payload: MessagePayload::RunTestCase(RunTestCase {
                case_id: case.id.clone(),
            }),
        };
        if self.send(request).await.is_err() {
            self.pending.lock().unwrap().remove(&request_id);
            return CaseRun::error("engine connection lost", self.take_logs());
        }

        let ctx = ProcedureContext {
            session: self.id,
            sync: Arc::clone(&self.sync),
            cancel: cancel.clone(),
        };

        loop {
            tokio::select! {
                res = &mut verdict_rx => {
                    return match res {
                        Ok(MessagePayload::Verdict(v)) => {
                            debug!(session = self.id, case = %v.case_id, outcome = %v.outcome, "verdict received");
                            CaseRun {
                                outcome: v.outcome,
                                reason: v.reason,
                                logs: self.take_logs(),
                            }
                        }
                        Ok(MessagePayload::Error(e)) => CaseRun::error(
                            &format!("engine error {}: {}", e.code, e.message),
                            self.take_logs(),
                        ),
                        Ok(other) => CaseRun::error(
                            &format!("unexpected engine response: {other:?}"),
                            self.take_logs(),
                        ),
                        Err(_) => CaseRun::error("engine connection lost", self.take_logs()),
                    };
                }
                prompt = self.prompt_rx.recv() => {
                    let Some(prompt) = prompt else {
                        self.pending.lock().unwrap().remove(&request_id);
                        return CaseRun::error("engine connection lost", self.take_logs());
                    };
                    debug!(session = self.id, wid = prompt.wid, "engine prompt: {}", prompt.description);
                    match case.procedure.answer_prompt(&ctx, &prompt).await {
                        Ok(answer) => {
                            let reply = EngineMessage {
                                request_id: Uuid::new_v4().to_string(),
                                payload: MessagePayload::PromptReply(PromptReply {
                                    prompt_id: prompt.prompt_id,
                                    answer,
                                }),
                            };
                            if self.send(reply).await.is_err() {
                                self.pending.lock().unwrap().remove(&request_id);
                                return CaseRun::error("engine connection lost", self.take_logs());
                            }
                        }
                        Err(err) => {
                            self.pending.lock().unwrap().remove(&request_id);
                            return CaseRun::error(&err.to_string(), self.take_logs());
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    self.pending.lock().unwrap().remove(&request_id);
                    return CaseRun::error("run cancelled", self.take_logs());
                }
            }
        }
    }

    /// Release the channel. Safe to call repeatedly; subsequent calls are
    /// no-ops on an already-closed channel.
    pub async fn disconnect(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            debug!(session = self.id, "disconnecting engine session");
            let _ = sink.close().await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }

    async fn send(&mut self, msg: EngineMessage) -> Result<(), ()> {
        match self.sink.as_mut() {
            Some(sink) => sink.send(msg).await.map_err(|e| {
                warn!(session = self.id, error = %e, "engine send failed");
            }),
            None => Err(()),
        }
    }

    fn take_logs(&self) -> Vec<String> {
        std::mem::take(&mut self.logs.lock().unwrap())
    }
}

/// Per-connection read task: the only code that consumes engine-originated
/// frames outside the handshake.
async fn read_loop(
    mut stream: SplitStream<Framed<TcpStream, EngineCodec>>,
    session: SessionId,
    sync: Arc<ResponseSync>,
    pending: PendingMap,
    prompt_tx: mpsc::UnboundedSender<Prompt>,
    logs: Arc<Mutex<Vec<String>>>,
) {
    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                warn!(session, error = %e, "engine frame decode failed");
                break;
            }
        };
        match msg.payload {
            MessagePayload::Event(ev) => sync.deliver(session, &ev.kind, ev.data),
            MessagePayload::Log(log) => logs.lock().unwrap().push(log.line),
            MessagePayload::Prompt(prompt) => {
                if prompt_tx.send(prompt).is_err() {
                    break;
                }
            }
            other => {
                let waiter = pending.lock().unwrap().remove(&msg.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(other);
                    }
                    None => {
                        debug!(session, request_id = %msg.request_id, "response without a waiter")
                    }
                }
            }
        }
    }
    // Wake any request still waiting so the driver sees the drop.
    pending.lock().unwrap().clear();
    debug!(session, "engine read task ended");
}
