//! Notifications delivered to event service subscribers

use chatpipe_stream::StreamEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Notifications for general subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Notification {
    /// A new model version is live
    VersionUpdate(VersionNotice),

    /// Chat progress pushed over the event connection
    Chat(StreamEvent),

    /// The server reported an error
    ServerError { message: String },

    /// Reconnects are exhausted; the service is closed
    ConnectionLost { attempts: u32 },
}

/// A decoded `version_update`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionNotice {
    pub old_version: Option<String>,
    pub new_version: Option<String>,
    pub message: String,
    pub description: String,
    /// Present when the update is the result of a training run
    pub training_ids: Option<Value>,
}

impl VersionNotice {
    /// Short human-readable summary
    pub fn summary(&self) -> String {
        let from = self.old_version.as_deref().unwrap_or("?");
        let to = self.new_version.as_deref().unwrap_or("?");
        if self.training_ids.is_some() {
            format!("Training completed: {from} -> {to}")
        } else if self.message.is_empty() {
            format!("Version updated: {from} -> {to}")
        } else {
            format!("{}: {from} -> {to}", self.message)
        }
    }
}

/// Notifications for training subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TrainingNotification {
    /// `training_status`
    Status {
        status: Option<String>,
        message: String,
    },

    /// `optimization_status`, or `optimization_failed` with status `failed`
    OptimizationStatus {
        task_id: Option<Value>,
        status: Option<String>,
        progress: Option<f64>,
        message: String,
    },

    /// An optimization task was created
    OptimizationCreated(Value),

    /// Training finished, successfully when `error` is `None`
    Completed {
        version: Option<VersionNotice>,
        error: Option<String>,
    },
}

/// Decode literal `\uXXXX` (and other JSON) escapes in server text. Text that
/// does not decode is returned unchanged.
pub fn decode_escapes(text: &str) -> String {
    if !text.contains('\\') {
        return text.to_string();
    }
    serde_json::from_str::<String>(&format!("\"{text}\"")).unwrap_or_else(|_| text.to_string())
}
