//! Request transport: send the chat request, get a byte stream back

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::ClientConfig,
    error::{Error, Result},
};

/// A response body as a stream of byte chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Body of the chat request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    /// Always 1: ask the server to stream
    pub stream: u8,
    pub version: String,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            stream: 1,
            version: version.into(),
        }
    }
}

/// Status line and body of a chat response
pub struct ChatResponse {
    pub status: u16,
    /// Canonical reason phrase for the status
    pub reason: Option<String>,
    pub body: ByteStream,
}

impl std::fmt::Debug for ChatResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl ChatResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body of an error response and pull out a readable detail:
    /// a JSON `detail` or `message` field, else the status reason phrase.
    pub async fn error_detail(mut self, limit: Duration) -> String {
        let mut raw = Vec::new();
        let drained = tokio::time::timeout(limit, async {
            while let Some(chunk) = self.body.next().await {
                match chunk {
                    Ok(bytes) => raw.extend_from_slice(&bytes),
                    Err(_) => break,
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!("Timed out draining error body for status {}", self.status);
        }

        serde_json::from_slice::<Value>(&raw)
            .ok()
            .and_then(|v| {
                ["detail", "message"]
                    .iter()
                    .find_map(|key| v.get(*key).and_then(Value::as_str).map(str::to_string))
            })
            .filter(|d| !d.is_empty())
            .or(self.reason)
            .unwrap_or_default()
    }
}

/// Issues the chat request. The only component that talks to the network
/// for the streaming pipeline.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send the request and return once headers have arrived
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// HTTP transport backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Use a preconfigured client (proxies, TLS, headers)
    pub fn with_client(client: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            client,
            url: config.chat_url(),
            request_timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        tracing::debug!("POST {}", self.url);
        let response = tokio::time::timeout(
            self.request_timeout,
            self.client
                .post(&self.url)
                .header("accept", "text/event-stream")
                .json(request)
                .send(),
        )
        .await
        .map_err(|_| Error::Network(format!("Request timeout after {:?}", self.request_timeout)))??;

        let status = response.status();
        let body = response.bytes_stream().map(|chunk| chunk.map_err(Error::from));

        Ok(ChatResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().map(str::to_string),
            body: Box::pin(body),
        })
    }
}
