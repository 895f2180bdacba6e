//! Event parser: turns decoded frames into typed server events
//!
//! Both wire variants are accepted. Typed frames are dispatched on their
//! `event:` name; untyped frames are legacy full snapshots. A frame that
//! cannot be interpreted is logged and skipped, never fatal.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::Frame;

/// Names of the typed events understood by the parser
pub mod names {
    pub const CONNECTED: &str = "connected";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const VERSION_UPDATE: &str = "version_update";
    pub const OPTIMIZATION_STATUS: &str = "optimization_status";
    pub const OPTIMIZATION_CREATED: &str = "optimization_created";
    pub const OPTIMIZATION_FAILED: &str = "optimization_failed";
    pub const TRAINING_STATUS: &str = "training_status";
    pub const CHAT_STREAM: &str = "chat_stream";
    pub const COMPLETION: &str = "completion";
    pub const ERROR: &str = "error";
}

/// Sentinel payload that ends a stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// A server event decoded from one frame
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Connection confirmed by the server
    Connected { message: Option<String> },
    /// Server keep-alive
    Heartbeat { timestamp: Option<f64> },
    /// A new model version is live
    VersionUpdate(VersionUpdate),
    /// Progress of an optimization task
    OptimizationStatus(OptimizationStatus),
    /// An optimization task was created
    OptimizationCreated(Value),
    /// An optimization task failed
    OptimizationFailed(OptimizationStatus),
    /// Progress of a training run
    TrainingStatus(TrainingStatus),
    /// Full current answer/reasoning of an in-flight chat
    ChatStream(ChatChunk),
    /// Final chat payload
    Completion(Snapshot),
    /// Server-side failure report
    Error { message: String },
    /// Legacy untyped snapshot
    Snapshot(Snapshot),
    /// `[DONE]` sentinel
    Done,
}

/// Payload of `version_update`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionUpdate {
    pub old_version: Option<String>,
    pub new_version: Option<String>,
    pub description: Option<String>,
    pub message: Option<String>,
    pub training_ids: Option<Value>,
}

/// Payload of `optimization_status` / `optimization_failed`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationStatus {
    pub task_id: Option<Value>,
    pub status: Option<String>,
    pub progress: Option<f64>,
    pub message: Option<String>,
}

/// Payload of `training_status`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingStatus {
    pub status: Option<String>,
    pub message: Option<String>,
}

/// Payload of `chat_stream`.
///
/// `answer` and `reasoning` are the full current values; the delta fields are
/// optional rendering hints and never the source of truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatChunk {
    pub answer: String,
    pub reasoning: String,
    pub step_type: Option<String>,
    pub tool_calls: Vec<Value>,
    pub answer_delta: Option<String>,
    pub reasoning_delta: Option<String>,
}

/// A full snapshot `{answer, reasoning, prompt_history?}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub answer: Option<String>,
    pub reasoning: Option<String>,
    pub prompt_history: Option<PromptHistoryPayload>,
}

/// `prompt_history` after the nested decode pass
#[derive(Debug, Clone, PartialEq)]
pub enum PromptHistoryPayload {
    /// Decoded JSON
    Parsed(Value),
    /// The nested string did not decode; kept verbatim
    Raw(String),
}

impl PromptHistoryPayload {
    /// Decoded value, if any
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PromptHistoryPayload::Parsed(v) => Some(v),
            PromptHistoryPayload::Raw(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    prompt_history: Option<Value>,
}

impl Snapshot {
    /// Decode a snapshot object, running the nested `prompt_history` pass
    pub fn from_value(value: Value) -> crate::Result<Self> {
        Self::decode(value, false)
    }

    /// Decode a `completion` payload. Without a `prompt_history` field, a
    /// history-shaped payload is taken as the history itself.
    pub fn from_completion(value: Value) -> crate::Result<Self> {
        Self::decode(value, true)
    }

    fn decode(value: Value, self_as_history: bool) -> crate::Result<Self> {
        let looks_like_history = self_as_history
            && (value.get("question").is_some()
                || value.get("content").is_some()
                || value.get("messages").is_some());
        let raw: RawSnapshot = serde_json::from_value(value.clone())?;

        let prompt_history = match raw.prompt_history {
            Some(Value::String(s)) if !s.is_empty() => Some(decode_nested(s)),
            Some(Value::Null) | Some(Value::String(_)) => None,
            Some(other) => Some(PromptHistoryPayload::Parsed(other)),
            // A completion payload may itself be the history
            None if looks_like_history => Some(PromptHistoryPayload::Parsed(value)),
            None => None,
        };

        Ok(Self {
            answer: raw.answer,
            reasoning: raw.reasoning,
            prompt_history,
        })
    }
}

fn decode_nested(s: String) -> PromptHistoryPayload {
    match serde_json::from_str::<Value>(&s) {
        Ok(v) => PromptHistoryPayload::Parsed(v),
        Err(e) => {
            tracing::warn!("Failed to parse prompt_history, keeping raw string: {}", e);
            PromptHistoryPayload::Raw(s)
        }
    }
}

/// Interpret one frame. Returns `None` (after logging) when the frame cannot
/// be understood.
pub fn parse_frame(frame: &Frame) -> Option<ServerEvent> {
    match frame.event.as_deref() {
        Some(name) => parse_typed(name, &frame.data),
        None => parse_untyped(&frame.data),
    }
}

/// Interpret a typed `event:`/`data:` pair
pub fn parse_typed(name: &str, data: &str) -> Option<ServerEvent> {
    if data.trim() == DONE_SENTINEL {
        return Some(ServerEvent::Done);
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Failed to parse {} event payload: {} ({})", name, e, data);
            return None;
        }
    };

    let parsed: crate::Result<ServerEvent> = match name {
        names::CONNECTED => Ok(ServerEvent::Connected {
            message: value.get("message").and_then(Value::as_str).map(str::to_string),
        }),
        names::HEARTBEAT => Ok(ServerEvent::Heartbeat {
            timestamp: value.get("timestamp").and_then(Value::as_f64),
        }),
        names::VERSION_UPDATE => serde_json::from_value(value)
            .map(ServerEvent::VersionUpdate)
            .map_err(Into::into),
        names::OPTIMIZATION_STATUS => serde_json::from_value(value)
            .map(ServerEvent::OptimizationStatus)
            .map_err(Into::into),
        names::OPTIMIZATION_CREATED => Ok(ServerEvent::OptimizationCreated(value)),
        names::OPTIMIZATION_FAILED => serde_json::from_value::<OptimizationStatus>(value)
            .map(|mut status| {
                status.status = Some("failed".to_string());
                ServerEvent::OptimizationFailed(status)
            })
            .map_err(Into::into),
        names::TRAINING_STATUS => serde_json::from_value(value)
            .map(ServerEvent::TrainingStatus)
            .map_err(Into::into),
        names::CHAT_STREAM => serde_json::from_value(value)
            .map(ServerEvent::ChatStream)
            .map_err(Into::into),
        names::COMPLETION => Snapshot::from_completion(value).map(ServerEvent::Completion),
        names::ERROR => Ok(ServerEvent::Error {
            message: error_message(&value),
        }),
        other => {
            tracing::debug!("Ignoring unknown event type: {}", other);
            return None;
        }
    };

    match parsed {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("Failed to interpret {} event: {}", name, e);
            None
        }
    }
}

/// Interpret a legacy bare `data:` payload
pub fn parse_untyped(data: &str) -> Option<ServerEvent> {
    if data.trim() == DONE_SENTINEL {
        return Some(ServerEvent::Done);
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Failed to parse message: {} ({})", e, data);
            return None;
        }
    };

    if !value.is_object() {
        tracing::warn!("Ignoring non-object snapshot payload: {}", data);
        return None;
    }

    match Snapshot::from_value(value) {
        Ok(snapshot) => Some(ServerEvent::Snapshot(snapshot)),
        Err(e) => {
            tracing::warn!("Failed to interpret snapshot: {}", e);
            None
        }
    }
}

/// Best human-readable message from an error payload
fn error_message(value: &Value) -> String {
    ["message", "detail", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .or_else(|| value.as_str().map(str::to_string))
        .unwrap_or_else(|| value.to_string())
}
