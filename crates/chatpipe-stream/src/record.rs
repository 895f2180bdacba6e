//! Interaction reconstruction
//!
//! Builds the [`InteractionRecord`] once a stream completes, either from a
//! full `prompt_history` snapshot or, when that is missing or unusable, from
//! the last streamed answer and reasoning alone.

use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    config::RecordDefaults,
    error::{Error, Result},
    event::PromptHistoryPayload,
    types::{ChatMessage, InteractionRecord, RecallMethod, Role, TokenCounts},
};

pub const REASONING_MARKER: &str = "[[ ## reasoning ## ]]";
pub const ANSWER_MARKER: &str = "[[ ## answer ## ]]";
pub const COMPLETED_MARKER: &str = "[[ ## completed ## ]]";

/// Placeholder standing in for dropped history messages
pub const OMITTED_PLACEHOLDER: &str = "...(earlier messages omitted)...";

static TOOL_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[\s*##\s*tool_(name|args)_(\d+)\s*##\s*\]\]").expect("valid tool marker regex")
});

/// `prompt_history` as sent by the server
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PromptHistory {
    uuid: Option<Value>,
    timestamp: Option<Value>,
    question: Option<String>,
    model: Option<String>,
    version: Option<String>,
    messages: Option<Vec<Value>>,
    prompt: Option<String>,
    content: Option<String>,
    tokens: Option<ServerTokens>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerTokens {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

/// What the read loop accumulated before the stream ended
#[derive(Debug, Clone, Default)]
pub struct StreamedContent {
    pub answer: String,
    pub reasoning: String,
}

/// Builds interaction records for one send call
#[derive(Debug, Clone)]
pub struct Reconstructor {
    question: String,
    version: String,
    defaults: RecordDefaults,
}

/// Result of reconstruction: the record and, if the snapshot path failed,
/// why it fell back.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub record: InteractionRecord,
    pub parse_error: Option<String>,
}

impl Reconstructor {
    pub fn new(question: impl Into<String>, version: impl Into<String>, defaults: RecordDefaults) -> Self {
        Self {
            question: question.into(),
            version: version.into(),
            defaults,
        }
    }

    /// Build the record, preferring the snapshot and degrading to the
    /// streamed content when the snapshot is absent or unusable.
    pub fn reconstruct(
        &self,
        history: Option<&PromptHistoryPayload>,
        streamed: &StreamedContent,
        processing_time: u64,
    ) -> Reconstruction {
        let Some(history) = history else {
            return Reconstruction {
                record: self.from_stream(streamed, processing_time),
                parse_error: None,
            };
        };

        match self.from_history(history, streamed, processing_time) {
            Ok(record) => Reconstruction {
                record,
                parse_error: None,
            },
            Err(e) => {
                tracing::warn!("Failed to build record from prompt_history, using streamed content: {}", e);
                Reconstruction {
                    record: self.from_stream(streamed, processing_time),
                    parse_error: Some(e.to_string()),
                }
            }
        }
    }

    /// Full snapshot path
    pub fn from_history(
        &self,
        history: &PromptHistoryPayload,
        streamed: &StreamedContent,
        processing_time: u64,
    ) -> Result<InteractionRecord> {
        let value = history.as_value().ok_or_else(|| {
            Error::Reconstruction("prompt_history is not valid JSON".to_string())
        })?;
        if !value.is_object() {
            return Err(Error::Reconstruction(format!(
                "prompt_history is not an object: {}",
                value
            )));
        }
        let history: PromptHistory = serde_json::from_value(value.clone())
            .map_err(|e| Error::Reconstruction(e.to_string()))?;

        let messages: Vec<ChatMessage> = history
            .messages
            .unwrap_or_default()
            .into_iter()
            // Unreadable entries still count as history that was dropped
            .map(|m| {
                serde_json::from_value(m).unwrap_or(ChatMessage {
                    role: Role::Other,
                    content: String::new(),
                })
            })
            .collect();

        let content = history.content.unwrap_or_default();
        let (mut answer, mut reasoning) = split_sections(&content);
        if answer.is_empty() {
            answer = streamed.answer.clone();
        }
        if reasoning.is_empty() {
            reasoning = streamed.reasoning.clone();
        }

        let prompt = history.prompt.unwrap_or_default();
        let completion_source = if content.is_empty() { &answer } else { &content };
        let tokens = resolve_tokens(history.tokens.as_ref(), &prompt, completion_source);

        Ok(InteractionRecord {
            id: history
                .uuid
                .as_ref()
                .and_then(value_to_id)
                .unwrap_or_else(new_id),
            timestamp: history
                .timestamp
                .as_ref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
            question: history
                .question
                .filter(|q| !q.is_empty())
                .unwrap_or_else(|| self.question.clone()),
            model: history
                .model
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| self.defaults.model.clone()),
            version: history
                .version
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| self.fallback_version()),
            recall_methods: extract_recall_methods(&messages),
            messages: truncate_history(messages),
            prompt,
            answer,
            reasoning,
            processing_time,
            tokens,
        })
    }

    /// Incremental-only fallback path
    pub fn from_stream(&self, streamed: &StreamedContent, processing_time: u64) -> InteractionRecord {
        InteractionRecord {
            id: new_id(),
            timestamp: Utc::now(),
            question: self.question.clone(),
            model: self.defaults.model.clone(),
            version: self.fallback_version(),
            messages: vec![ChatMessage::user(self.question.clone())],
            recall_methods: Vec::new(),
            prompt: String::new(),
            answer: streamed.answer.clone(),
            reasoning: streamed.reasoning.clone(),
            processing_time,
            tokens: TokenCounts::new(
                estimate_tokens(&self.question),
                estimate_tokens(&streamed.answer),
            ),
        }
    }

    fn fallback_version(&self) -> String {
        if self.version.is_empty() {
            self.defaults.version.clone()
        } else {
            self.version.clone()
        }
    }
}

/// Split raw model output into `(answer, reasoning)` using the section markers
pub fn split_sections(content: &str) -> (String, String) {
    let reasoning = extract_section(content, REASONING_MARKER, Some(ANSWER_MARKER));
    let answer = extract_section(content, ANSWER_MARKER, Some(COMPLETED_MARKER));
    (answer, reasoning)
}

/// Text between `start` and `end` (or the end of the string), trimmed.
/// A missing start marker yields an empty string.
pub fn extract_section(content: &str, start: &str, end: Option<&str>) -> String {
    let Some(start_index) = content.find(start) else {
        return String::new();
    };
    let body = &content[start_index + start.len()..];
    let body = match end.and_then(|marker| body.find(marker)) {
        Some(end_index) => &body[..end_index],
        None => body,
    };
    body.trim().to_string()
}

/// Keep system messages and the last user message; everything else collapses
/// into one placeholder.
pub fn truncate_history(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let total = messages.len();
    let last_user = messages.iter().rposition(|m| m.role == Role::User);
    let mut kept: Vec<ChatMessage> = Vec::new();
    let mut last_user_message = None;

    for (index, message) in messages.into_iter().enumerate() {
        if Some(index) == last_user {
            last_user_message = Some(message);
        } else if message.role == Role::System {
            kept.push(message);
        }
    }

    let retained = kept.len() + usize::from(last_user_message.is_some());
    if total > retained {
        kept.push(ChatMessage::system(OMITTED_PLACEHOLDER));
    }
    kept.extend(last_user_message);
    kept
}

/// Extract `tool_name_N` / `tool_args_N` pairs from the last user message
pub fn extract_recall_methods(messages: &[ChatMessage]) -> Vec<RecallMethod> {
    let Some(last_user) = messages.iter().rev().find(|m| m.role == Role::User) else {
        return Vec::new();
    };
    let content = last_user.content.as_str();

    let markers: Vec<(usize, usize, bool, &str)> = TOOL_MARKER
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let is_name = caps.get(1)?.as_str() == "name";
            let index = caps.get(2)?.as_str();
            Some((whole.start(), whole.end(), is_name, index))
        })
        .collect();

    let mut methods = Vec::new();
    let mut consumed_until = 0;

    for (i, &(start, end, is_name, index)) in markers.iter().enumerate() {
        if !is_name || start < consumed_until {
            continue;
        }

        let name_text = content[end..].trim_start();
        let name_end = name_text
            .find(['\n', '\r'])
            .into_iter()
            .chain(name_text.find("[["))
            .min()
            .unwrap_or(name_text.len());
        let method = name_text[..name_end].trim();
        if method.is_empty() {
            continue;
        }

        let Some(&(_, args_start, _, _)) = markers[i + 1..]
            .iter()
            .find(|&&(_, _, name, idx)| !name && idx == index)
        else {
            continue;
        };

        let rest = &content[args_start..];
        let args_end = rest.find("[[").unwrap_or(rest.len());
        let raw_args = rest[..args_end].trim();
        consumed_until = args_start + args_end;

        let args = serde_json::from_str(raw_args)
            .unwrap_or_else(|_| Value::String(raw_args.to_string()));
        methods.push(RecallMethod {
            method: method.to_string(),
            args,
        });
    }

    methods
}

/// One token per four characters, rounded up
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

fn resolve_tokens(server: Option<&ServerTokens>, prompt: &str, completion: &str) -> TokenCounts {
    let provided = |pick: fn(&ServerTokens) -> Option<u64>| server.and_then(pick).filter(|n| *n > 0);

    let prompt_tokens = provided(|t| t.prompt_tokens).unwrap_or_else(|| estimate_tokens(prompt));
    let completion_tokens =
        provided(|t| t.completion_tokens).unwrap_or_else(|| estimate_tokens(completion));
    let total = provided(|t| t.total_tokens).unwrap_or(prompt_tokens + completion_tokens);

    TokenCounts {
        prompt: prompt_tokens,
        completion: completion_tokens,
        total,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => {
            let raw = n.as_f64()?;
            let millis = if raw > 1e12 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
