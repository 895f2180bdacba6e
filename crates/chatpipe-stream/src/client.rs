//! Chat client: the retry controller and the read loop
//!
//! One `send_message` call is one lifecycle:
//! `Idle -> Sending -> Streaming -> {Completed | Failed}`, where `Failed` goes
//! back to `Sending` while retries remain. Each attempt runs its own read loop
//! with a heartbeat monitor, a frame decoder and a child cancellation token.

use std::{pin::Pin, sync::Arc, time::Duration};

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ClientConfig,
    error::{Error, Result},
    event::{PromptHistoryPayload, ServerEvent, Snapshot, parse_frame},
    frame::{Frame, FrameDecoder},
    monitor::{ConnectionActivity, HeartbeatMonitor, Synthetic},
    read::{ReadOutcome, read_with_timeout},
    record::{Reconstructor, StreamedContent},
    retry::RetryState,
    transport::{ChatRequest, ChatTransport, HttpTransport},
    types::{StreamDeltas, StreamEvent},
};

/// Stream of events for one send call
pub type StreamEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Content of a heartbeat notice when nothing has streamed yet
pub const PROCESSING_PLACEHOLDER: &str = "Processing your request...";

/// Client for the streaming chat endpoint
#[derive(Clone)]
pub struct ChatClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn ChatTransport>,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    /// Client sending requests through `transport`. Fails on a config the
    /// pipeline cannot run with.
    pub fn new(config: ClientConfig, transport: Arc<dyn ChatTransport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            transport,
        })
    }

    /// Client talking HTTP to `config.chat_url()`
    pub fn http(config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config);
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send a prompt and stream the resulting events. The stream always ends
    /// with exactly one `Complete` or `Error`.
    pub fn send_message(&self, prompt: impl Into<String>, version: impl Into<String>) -> StreamEventStream {
        self.send_message_with_cancel(prompt, version, CancellationToken::new())
    }

    /// Like [`ChatClient::send_message`], abandoned when `cancel` fires
    pub fn send_message_with_cancel(
        &self,
        prompt: impl Into<String>,
        version: impl Into<String>,
        cancel: CancellationToken,
    ) -> StreamEventStream {
        let request = ChatRequest::new(prompt, version);
        let config = self.config.clone();
        let transport = self.transport.clone();

        Box::pin(stream! {
            let started = Instant::now();
            let reconstructor = Reconstructor::new(
                request.prompt.clone(),
                request.version.clone(),
                config.defaults.clone(),
            );
            let mut retry = RetryState::new(config.retry.clone());

            loop {
                retry.begin_send();
                let mut attempt = run_attempt(
                    transport.clone(),
                    config.clone(),
                    request.clone(),
                    cancel.child_token(),
                );

                let mut outcome = None;
                while let Some(item) = attempt.next().await {
                    match item {
                        AttemptItem::Streaming => retry.begin_streaming(),
                        AttemptItem::Event(event) => yield event,
                        AttemptItem::End(end) => {
                            outcome = Some(end);
                            break;
                        }
                    }
                }
                drop(attempt);

                let Some(Outcome { kind, state }) = outcome else {
                    yield StreamEvent::Error {
                        content: String::new(),
                        reasoning: String::new(),
                        message: "Stream ended unexpectedly".to_string(),
                        timeout: false,
                        retries: None,
                    };
                    return;
                };

                match kind {
                    OutcomeKind::Finished => {
                        retry.complete();
                        let processing_time = started.elapsed().as_millis() as u64;
                        let streamed = state.streamed();
                        let built = reconstructor.reconstruct(
                            state.history.as_ref(),
                            &streamed,
                            processing_time,
                        );
                        tracing::info!(
                            "Chat completed in {}ms after {} retries",
                            processing_time,
                            retry.attempt()
                        );
                        yield StreamEvent::Complete {
                            content: built.record.answer.clone(),
                            reasoning: built.record.reasoning.clone(),
                            debug: Some(Box::new(built.record)),
                            parse_error: built.parse_error,
                        };
                        return;
                    }
                    OutcomeKind::Cancelled => {
                        tracing::info!("Chat request cancelled");
                        yield state.into_error(Error::Cancelled.to_string(), false);
                        return;
                    }
                    OutcomeKind::Stalled(inactive) => {
                        yield state.into_error(Error::StallTimeout(inactive).to_string(), true);
                        return;
                    }
                    OutcomeKind::ServerError(message) => {
                        tracing::warn!("Server reported an error: {}", message);
                        yield state.into_error(message, false);
                        return;
                    }
                    OutcomeKind::Failed(e) => {
                        // Content already shown to the caller is never re-requested
                        if state.emitted || !e.is_retryable() {
                            tracing::warn!("Chat stream failed: {}", e);
                            yield state.into_error(e.to_string(), false);
                            return;
                        }

                        let Some(delay) = retry.fail() else {
                            tracing::error!(
                                "Chat request failed after {} retries: {}",
                                retry.attempt(),
                                e
                            );
                            yield StreamEvent::Error {
                                content: String::new(),
                                reasoning: String::new(),
                                message: e.to_string(),
                                timeout: false,
                                retries: Some(retry.attempt()),
                            };
                            return;
                        };

                        let label = match &e {
                            Error::ServerRetryable { .. } => "Server error",
                            _ => "Request failed",
                        };
                        tracing::warn!(
                            "{} (attempt {}/{}): {}. Retrying in {:?}...",
                            label,
                            retry.attempt(),
                            retry.max_attempts(),
                            e,
                            delay
                        );
                        yield StreamEvent::Progress {
                            content: format!(
                                "{}, retrying ({}/{})...",
                                label,
                                retry.attempt(),
                                retry.max_attempts()
                            ),
                            reasoning: String::new(),
                            retrying: true,
                            inactive_time: None,
                            error: Some(e.to_string()),
                        };

                        let cancelled = tokio::select! {
                            _ = cancel.cancelled() => true,
                            _ = tokio::time::sleep(delay) => false,
                        };
                        if cancelled {
                            yield StreamEvent::Error {
                                content: String::new(),
                                reasoning: String::new(),
                                message: Error::Cancelled.to_string(),
                                timeout: false,
                                retries: Some(retry.attempt()),
                            };
                            return;
                        }
                    }
                }
            }
        })
    }
}

enum AttemptItem {
    /// Headers arrived with a success status
    Streaming,
    Event(StreamEvent),
    /// Always the last item of an attempt
    End(Outcome),
}

struct Outcome {
    kind: OutcomeKind,
    state: StreamState,
}

enum OutcomeKind {
    Finished,
    Failed(Error),
    Stalled(Duration),
    Cancelled,
    /// The server sent an `error` event
    ServerError(String),
}

/// What the read loop should do after one parsed event
#[derive(Debug, PartialEq)]
enum Step {
    Emit(StreamEvent),
    Finish,
    Fail(String),
    Skip,
}

/// Content accumulated by one attempt's read loop
#[derive(Debug, Default)]
struct StreamState {
    answer: String,
    reasoning: String,
    history: Option<PromptHistoryPayload>,
    finished: bool,
    /// A `stream` event has reached the caller
    emitted: bool,
}

impl StreamState {
    fn apply(&mut self, event: ServerEvent) -> Step {
        match event {
            ServerEvent::ChatStream(chunk) => {
                self.answer = chunk.answer;
                self.reasoning = chunk.reasoning;
                let deltas = StreamDeltas {
                    answer: chunk.answer_delta,
                    reasoning: chunk.reasoning_delta,
                };
                self.stream_event(Some(deltas).filter(|d| !d.is_empty()))
            }
            ServerEvent::Snapshot(snapshot) => {
                let carries_history = snapshot.prompt_history.is_some();
                self.merge(snapshot);
                if carries_history {
                    Step::Skip
                } else {
                    self.stream_event(None)
                }
            }
            ServerEvent::Completion(snapshot) => {
                self.merge(snapshot);
                self.finished = true;
                Step::Finish
            }
            ServerEvent::Done => {
                self.finished = true;
                Step::Finish
            }
            ServerEvent::Error { message } => Step::Fail(message),
            other => {
                tracing::debug!("Ignoring event on chat stream: {:?}", other);
                Step::Skip
            }
        }
    }

    /// Non-empty snapshot fields replace what was streamed so far
    fn merge(&mut self, snapshot: Snapshot) {
        if let Some(answer) = snapshot.answer.filter(|a| !a.is_empty()) {
            self.answer = answer;
        }
        if let Some(reasoning) = snapshot.reasoning.filter(|r| !r.is_empty()) {
            self.reasoning = reasoning;
        }
        if snapshot.prompt_history.is_some() {
            self.history = snapshot.prompt_history;
        }
    }

    fn stream_event(&mut self, deltas: Option<StreamDeltas>) -> Step {
        self.emitted = true;
        Step::Emit(StreamEvent::Stream {
            content: self.answer.clone(),
            reasoning: self.reasoning.clone(),
            deltas,
        })
    }

    fn progress(&self, inactive: Duration) -> StreamEvent {
        let content = if self.answer.is_empty() {
            PROCESSING_PLACEHOLDER.to_string()
        } else {
            self.answer.clone()
        };
        StreamEvent::Progress {
            content,
            reasoning: self.reasoning.clone(),
            retrying: false,
            inactive_time: Some(inactive.as_millis() as u64),
            error: None,
        }
    }

    fn streamed(&self) -> StreamedContent {
        StreamedContent {
            answer: self.answer.clone(),
            reasoning: self.reasoning.clone(),
        }
    }

    fn into_error(self, message: String, timeout: bool) -> StreamEvent {
        StreamEvent::Error {
            content: self.answer,
            reasoning: self.reasoning,
            message,
            timeout,
            retries: None,
        }
    }
}

enum Wake {
    Cancelled,
    Pending,
    Read(ReadOutcome<Result<bytes::Bytes>>),
}

/// One request plus its read loop
fn run_attempt(
    transport: Arc<dyn ChatTransport>,
    config: Arc<ClientConfig>,
    request: ChatRequest,
    cancel: CancellationToken,
) -> Pin<Box<dyn Stream<Item = AttemptItem> + Send>> {
    Box::pin(stream! {
        // Stops the monitor task and releases the reader on every exit path
        let _cancel_on_exit = cancel.clone().drop_guard();
        let mut state = StreamState::default();

        let sent = tokio::select! {
            _ = cancel.cancelled() => None,
            sent = transport.send(&request) => Some(sent),
        };
        let response = match sent {
            None => {
                yield AttemptItem::End(Outcome { kind: OutcomeKind::Cancelled, state });
                return;
            }
            Some(Err(e)) => {
                yield AttemptItem::End(Outcome { kind: OutcomeKind::Failed(e), state });
                return;
            }
            Some(Ok(response)) => response,
        };

        if !response.is_success() {
            let status = response.status;
            let detail = response.error_detail(config.read_timeout).await;
            yield AttemptItem::End(Outcome {
                kind: OutcomeKind::Failed(Error::from_status(status, detail)),
                state,
            });
            return;
        }
        yield AttemptItem::Streaming;

        let mut body = response.body;
        let mut decoder = FrameDecoder::new();
        let activity = ConnectionActivity::new(config.heartbeat.clone());
        let monitor = HeartbeatMonitor::spawn(activity.clone(), cancel.clone());

        let kind = loop {
            match activity.take_pending() {
                Some(Synthetic::Progress { inactive }) => {
                    yield AttemptItem::Event(state.progress(inactive));
                }
                Some(Synthetic::StallTimeout { inactive }) => break OutcomeKind::Stalled(inactive),
                None => {}
            }

            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = activity.pending_ready() => Wake::Pending,
                read = read_with_timeout(&mut body, config.read_timeout) => Wake::Read(read),
            };

            let frames: Vec<Frame> = match wake {
                Wake::Cancelled => match activity.take_pending() {
                    Some(Synthetic::StallTimeout { inactive }) => break OutcomeKind::Stalled(inactive),
                    _ => break OutcomeKind::Cancelled,
                },
                Wake::Pending => continue,
                Wake::Read(ReadOutcome::TimedOut) => {
                    tracing::warn!(
                        "No data within {:?}, still waiting (silent {:?}, inactive {:?})",
                        config.read_timeout,
                        activity.silent_for(),
                        activity.inactive_for()
                    );
                    if config.read_timeout_counts_as_activity {
                        activity.touch();
                    }
                    continue;
                }
                Wake::Read(ReadOutcome::Item(Err(e))) => break OutcomeKind::Failed(e),
                Wake::Read(ReadOutcome::Item(Ok(chunk))) => {
                    activity.record_data();
                    decoder.push_bytes(&chunk)
                }
                Wake::Read(ReadOutcome::End) => {
                    let frames = decoder.finish();
                    state.finished = true;
                    frames
                }
            };

            let mut failure = None;
            for frame in frames {
                tracing::debug!("Frame: event={:?} data={}", frame.event, frame.data);
                let Some(event) = parse_frame(&frame) else {
                    continue;
                };
                match state.apply(event) {
                    Step::Emit(event) => yield AttemptItem::Event(event),
                    Step::Fail(message) => {
                        failure = Some(message);
                        break;
                    }
                    Step::Finish | Step::Skip => {}
                }
            }

            if let Some(message) = failure {
                break OutcomeKind::ServerError(message);
            }
            if state.finished {
                break OutcomeKind::Finished;
            }
        };

        monitor.stop();
        cancel.cancel();
        yield AttemptItem::End(Outcome { kind, state });
    })
}
