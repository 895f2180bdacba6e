//! Core types for chat interactions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Message role in a prompt history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    #[default]
    #[serde(other)]
    Other,
}

/// One message of the prompt history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Role,
    /// Null becomes empty; structured content is kept as its JSON text
    #[serde(default, deserialize_with = "lenient_content")]
    pub content: String,
}

fn lenient_content<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool/recall invocation extracted from model input markers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallMethod {
    pub method: String,
    /// Parsed JSON arguments, or the raw string when they are not JSON
    pub args: serde_json::Value,
}

/// Token accounting for one interaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenCounts {
    /// Counts with `total` derived from the parts
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

/// The normalized record of one question/answer exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub question: String,
    pub model: String,
    pub version: String,
    /// System messages, an omission placeholder, and the last user message
    pub messages: Vec<ChatMessage>,
    pub recall_methods: Vec<RecallMethod>,
    pub prompt: String,
    pub answer: String,
    pub reasoning: String,
    /// Milliseconds from the first request to completion
    pub processing_time: u64,
    pub tokens: TokenCounts,
}

/// Optional fine-grained increments attached to a `stream` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDeltas {
    pub answer: Option<String>,
    pub reasoning: Option<String>,
}

impl StreamDeltas {
    pub fn is_empty(&self) -> bool {
        self.answer.is_none() && self.reasoning.is_none()
    }
}

/// Events yielded to the caller of a chat stream.
///
/// A send lifecycle ends with exactly one terminal event: `Complete` on
/// success or `Error` on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    /// Status notice: a retry is pending, or the server is still working
    Progress {
        content: String,
        #[serde(default)]
        reasoning: String,
        #[serde(default)]
        retrying: bool,
        /// Milliseconds since the last activity (heartbeat notices)
        inactive_time: Option<u64>,
        /// What triggered a retry
        error: Option<String>,
    },
    /// Full current answer and reasoning
    Stream {
        content: String,
        reasoning: String,
        deltas: Option<StreamDeltas>,
    },
    /// Terminal success
    Complete {
        content: String,
        reasoning: String,
        debug: Option<Box<InteractionRecord>>,
        /// Set when the full snapshot could not be used
        parse_error: Option<String>,
    },
    /// Terminal failure, carrying whatever content had streamed
    Error {
        content: String,
        #[serde(default)]
        reasoning: String,
        message: String,
        #[serde(default)]
        timeout: bool,
        retries: Option<u32>,
    },
    /// End-of-stream sentinel observed on a subscription
    Done,
}

impl StreamEvent {
    /// Check if this is a terminal event (Complete or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }

    /// Answer text carried by the event, if any
    pub fn content(&self) -> Option<&str> {
        match self {
            StreamEvent::Progress { content, .. }
            | StreamEvent::Stream { content, .. }
            | StreamEvent::Complete { content, .. }
            | StreamEvent::Error { content, .. } => Some(content),
            StreamEvent::Done => None,
        }
    }

    /// Get the interaction record if this is a Complete event
    pub fn into_record(self) -> Option<InteractionRecord> {
        match self {
            StreamEvent::Complete { debug, .. } => debug.map(|d| *d),
            _ => None,
        }
    }
}
