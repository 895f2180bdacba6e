//! chatpipe-stream: client-side pipeline for a streaming chat endpoint
//!
//! Turns the server's event-stream body into a typed sequence of
//! [`StreamEvent`]s: frames are decoded and parsed, reads are guarded by a
//! per-read timeout, a heartbeat monitor reports long silences and abandons
//! stalled connections, failed requests are retried with backoff, and the
//! final interaction record is rebuilt from whatever the server supplied.

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod monitor;
pub mod read;
pub mod record;
pub mod retry;
pub mod transport;
pub mod types;

pub use client::{ChatClient, PROCESSING_PLACEHOLDER, StreamEventStream};
pub use config::{ClientConfig, RecordDefaults};
pub use error::{Error, Result};
pub use monitor::HeartbeatConfig;
pub use retry::RetryConfig;
pub use transport::{ChatRequest, ChatResponse, ChatTransport, HttpTransport};
pub use types::*;
