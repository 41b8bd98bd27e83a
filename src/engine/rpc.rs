use serde::{Deserialize, Serialize};

use crate::report::Outcome;

/// One frame of the engine control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineMessage {
    pub request_id: String,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Hello(Hello),
    HelloAck(HelloAck),
    RunTestCase(RunTestCase),
    Verdict(CaseVerdict),
    Prompt(Prompt),
    PromptReply(PromptReply),
    Event(EventReport),
    Log(LogLine),
    Error(ErrorReport),
}

/// Client handshake: carries the workspace and IUT parameters the engine
/// needs before it can run anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub version: String,
    pub workspace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bd_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Normal,
    /// Equivalent to running a test case in the PTS GUI with debug logs.
    Maximum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub version: String,
    pub engine_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTestCase {
    pub case_id: String,
}

/// Engine response closing a `RunTestCase` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseVerdict {
    pub case_id: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Unsolicited engine question that must be answered before the test case
/// can proceed (MMI implicit-send prompt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub prompt_id: String,
    /// PTS MMI style ID.
    pub wid: u32,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptReply {
    pub prompt_id: String,
    pub answer: String,
}

/// Asynchronous protocol event observed on the IUT side, routed into the
/// response synchronizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReport {
    pub kind: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: u32,
    pub message: String,
}
