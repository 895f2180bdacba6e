//! Long-lived event service
//!
//! Holds at most one event connection. Callers register the reasons they need
//! it for; once no reason is left and the connection has been quiet for the
//! idle timeout, it is torn down. Lost connections are retried a bounded
//! number of times with a linearly growing delay.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use chatpipe_stream::{
    StreamDeltas, StreamEvent,
    event::{OptimizationStatus, ServerEvent, TrainingStatus, VersionUpdate, parse_typed},
    record::{Reconstructor, StreamedContent},
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    config::EventServiceConfig,
    connector::{EventConnector, HttpConnector, SseItem},
    error::{Error, Result},
    events::{Notification, TrainingNotification, VersionNotice, decode_escapes},
    handle::{SubscriberKind, Subscription},
};

/// Well-known connection reasons
pub mod reasons {
    pub const CHAT: &str = "chat";
    pub const TRAINING: &str = "training";
    pub const VERSION_SWITCH: &str = "version_switch";
    pub const SAMPLES: &str = "samples";
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Cloneable handle to the event service. Must be used inside a tokio
/// runtime: connections and timers run as spawned tasks.
#[derive(Clone, Debug)]
pub struct EventService {
    inner: Arc<Inner>,
}

impl EventService {
    /// Service connecting over HTTP to `config.events_url`
    pub fn new(config: EventServiceConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(HttpConnector::new()))
    }

    pub fn with_connector(config: EventServiceConfig, connector: Arc<dyn EventConnector>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(State::default()),
            }),
        })
    }

    pub fn config(&self) -> &EventServiceConfig {
        &self.inner.config
    }

    /// Connect. No-op if a connection is already open.
    pub fn open(&self) {
        let mut state = self.inner.state.lock();
        if state.connection.is_none() {
            self.inner.start_connection(&mut state);
        }
    }

    /// Tear down the connection and forget all subscribers, reasons and
    /// timers. Safe to call more than once.
    pub fn close(&self) {
        let released = {
            let mut state = self.inner.state.lock();
            Inner::close_locked(&mut state)
        };
        drop(released);
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().connection.is_some()
    }

    /// Register a callback for general notifications
    pub fn subscribe(&self, callback: impl Fn(&Notification) + Send + Sync + 'static) -> Subscription {
        let mut state = self.inner.state.lock();
        let id = state.next_id();
        state.subscribers.push((id, Arc::new(callback)));
        Subscription::new(Arc::downgrade(&self.inner), id, SubscriberKind::General)
    }

    /// Register a callback for training and optimization notifications
    pub fn subscribe_training(
        &self,
        callback: impl Fn(&TrainingNotification) + Send + Sync + 'static,
    ) -> Subscription {
        let mut state = self.inner.state.lock();
        let id = state.next_id();
        state.training.push((id, Arc::new(callback)));
        Subscription::new(Arc::downgrade(&self.inner), id, SubscriberKind::Training)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    pub fn training_subscriber_count(&self) -> usize {
        self.inner.state.lock().training.len()
    }

    /// Keep the connection for `reason`, opening it if needed
    pub fn connect_for(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!("Event connection requested for: {}", reason);
        let mut state = self.inner.state.lock();
        state.reasons.insert(reason);
        if state.connection.is_none() {
            self.inner.start_connection(&mut state);
        }
        self.inner.arm_idle_timer(&mut state);
    }

    /// Drop `reason`; with none left, the idle teardown is scheduled
    pub fn release(&self, reason: &str) {
        self.inner.release(reason);
    }

    /// Active connection reasons, sorted
    pub fn reasons(&self) -> Vec<String> {
        self.inner.state.lock().reasons.iter().cloned().collect()
    }

    /// Dispatch one received frame. Called by the connection task; also
    /// usable to feed frames that arrived some other way.
    pub fn handle_message(&self, event: &str, data: &str) {
        self.inner.handle_message(event, data);
    }
}

#[derive(Default)]
struct State {
    /// Cancels the running connection task
    connection: Option<CancellationToken>,
    subscribers: Vec<(u64, Callback<Notification>)>,
    training: Vec<(u64, Callback<TrainingNotification>)>,
    reasons: BTreeSet<String>,
    idle_timer: Option<CancellationToken>,
    reconnect_attempts: u32,
    last_id: u64,
    /// Latest pushed chat content, the fallback for `completion`
    chat: StreamedContent,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }
}

/// Callbacks removed under the lock, dropped after it is released
type Released = (
    Vec<(u64, Callback<Notification>)>,
    Vec<(u64, Callback<TrainingNotification>)>,
);

pub(crate) struct Inner {
    config: EventServiceConfig,
    connector: Arc<dyn EventConnector>,
    state: Mutex<State>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(connection) = state.connection.take() {
            connection.cancel();
        }
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
    }
}

impl Inner {
    fn start_connection(self: &Arc<Self>, state: &mut State) {
        let cancel = CancellationToken::new();
        state.connection = Some(cancel.clone());
        tokio::spawn(run_connection(
            Arc::downgrade(self),
            self.connector.clone(),
            self.config.events_url.clone(),
            cancel,
        ));
    }

    fn close_locked(state: &mut State) -> Released {
        if let Some(connection) = state.connection.take() {
            connection.cancel();
            tracing::info!("Event connection closed");
        }
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
        state.reasons.clear();
        state.reconnect_attempts = 0;
        state.chat = StreamedContent::default();
        (
            std::mem::take(&mut state.subscribers),
            std::mem::take(&mut state.training),
        )
    }

    /// Restart the idle countdown. Only counts down while the connection is
    /// open and no reason holds it.
    fn arm_idle_timer(self: &Arc<Self>, state: &mut State) {
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
        if state.connection.is_none() || !state.reasons.is_empty() {
            return;
        }

        let timer = CancellationToken::new();
        state.idle_timer = Some(timer.clone());
        let service = Arc::downgrade(self);
        let delay = self.config.idle_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(service) = service.upgrade() {
                        service.idle_expired(&timer);
                    }
                }
            }
        });
    }

    fn idle_expired(&self, timer: &CancellationToken) {
        let released = {
            let mut state = self.state.lock();
            // Re-armed or closed since this timer started
            if timer.is_cancelled() || !state.reasons.is_empty() {
                return;
            }
            tracing::info!("Event connection idle for {:?}, closing", self.config.idle_timeout);
            Self::close_locked(&mut state)
        };
        drop(released);
    }

    fn release(self: &Arc<Self>, reason: &str) {
        let mut state = self.state.lock();
        state.reasons.remove(reason);
        tracing::debug!("Released connection reason {}, remaining: {:?}", reason, state.reasons);
        if state.reasons.is_empty() {
            self.arm_idle_timer(&mut state);
        }
    }

    pub(crate) fn remove_subscriber(&self, id: u64, kind: SubscriberKind) {
        // Callbacks are dropped only after the lock is released
        let (general, training, released) = {
            let mut state = self.state.lock();
            match kind {
                SubscriberKind::General => {
                    let general = take_by_id(&mut state.subscribers, id);
                    let released = (general.is_some() && state.subscribers.is_empty())
                        .then(|| Self::close_locked(&mut state));
                    (general, None, released)
                }
                SubscriberKind::Training => (None, take_by_id(&mut state.training, id), None),
            }
        };
        drop((general, training, released));
    }

    fn on_open(&self) {
        tracing::info!("Event connection established");
        self.state.lock().reconnect_attempts = 0;
    }

    /// Count one reconnect and return its delay, or give up
    fn next_reconnect(&self, connection: &CancellationToken) -> Option<Duration> {
        let attempts = {
            let mut state = self.state.lock();
            if connection.is_cancelled() {
                return None;
            }
            if state.reconnect_attempts < self.config.max_reconnect_attempts {
                state.reconnect_attempts += 1;
                let attempt = state.reconnect_attempts;
                let delay = self.config.reconnect_delay_for(attempt);
                tracing::info!(
                    "Reconnecting event stream (attempt {}/{}) in {:?}",
                    attempt,
                    self.config.max_reconnect_attempts,
                    delay
                );
                return Some(delay);
            }

            let attempts = state.reconnect_attempts;
            state.reconnect_attempts = 0;
            if let Some(connection) = state.connection.take() {
                connection.cancel();
            }
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            attempts
        };

        tracing::error!("Event connection lost after {} reconnect attempts", attempts);
        self.notify(&Notification::ConnectionLost { attempts });
        None
    }

    fn handle_message(self: &Arc<Self>, event: &str, data: &str) {
        {
            let mut state = self.state.lock();
            self.arm_idle_timer(&mut state);
        }

        let parsed = match event {
            "" | "message" => {
                tracing::debug!("Untyped event message: {}", data);
                return;
            }
            name => parse_typed(name, data),
        };
        let Some(parsed) = parsed else {
            return;
        };

        match parsed {
            ServerEvent::Connected { message } => {
                tracing::info!("Event stream confirmed: {}", message.unwrap_or_default());
            }
            ServerEvent::Heartbeat { timestamp } => {
                tracing::debug!("Event stream heartbeat: {:?}", timestamp);
            }
            ServerEvent::VersionUpdate(update) => self.on_version_update(update),
            ServerEvent::TrainingStatus(status) => self.on_training_status(status),
            ServerEvent::OptimizationStatus(status) | ServerEvent::OptimizationFailed(status) => {
                self.on_optimization_status(status)
            }
            ServerEvent::OptimizationCreated(task) => {
                tracing::info!("Optimization task created: {}", task);
                self.notify_training(&TrainingNotification::OptimizationCreated(task));
            }
            ServerEvent::ChatStream(chunk) => {
                {
                    let mut state = self.state.lock();
                    state.chat.answer = chunk.answer.clone();
                    state.chat.reasoning = chunk.reasoning.clone();
                }
                let deltas = StreamDeltas {
                    answer: chunk.answer_delta,
                    reasoning: chunk.reasoning_delta,
                };
                self.notify(&Notification::Chat(StreamEvent::Stream {
                    content: chunk.answer,
                    reasoning: chunk.reasoning,
                    deltas: Some(deltas).filter(|d| !d.is_empty()),
                }));
            }
            ServerEvent::Completion(snapshot) => {
                let streamed = {
                    let mut state = self.state.lock();
                    let mut streamed = std::mem::take(&mut state.chat);
                    if let Some(answer) = snapshot.answer.filter(|a| !a.is_empty()) {
                        streamed.answer = answer;
                    }
                    if let Some(reasoning) = snapshot.reasoning.filter(|r| !r.is_empty()) {
                        streamed.reasoning = reasoning;
                    }
                    streamed
                };
                let reconstructor = Reconstructor::new(String::new(), String::new(), self.config.defaults.clone());
                let built = reconstructor.reconstruct(snapshot.prompt_history.as_ref(), &streamed, 0);
                self.notify(&Notification::Chat(StreamEvent::Complete {
                    content: built.record.answer.clone(),
                    reasoning: built.record.reasoning.clone(),
                    debug: Some(Box::new(built.record)),
                    parse_error: built.parse_error,
                }));
                self.release(reasons::CHAT);
            }
            ServerEvent::Done => self.notify(&Notification::Chat(StreamEvent::Done)),
            ServerEvent::Error { message } => {
                tracing::warn!("Server error event: {}", message);
                self.notify(&Notification::ServerError { message });
            }
            ServerEvent::Snapshot(_) => {
                tracing::debug!("Ignoring untyped snapshot on event stream");
            }
        }
    }

    fn on_version_update(self: &Arc<Self>, update: VersionUpdate) {
        let notice = VersionNotice {
            old_version: update.old_version,
            new_version: update.new_version,
            message: update.message.as_deref().map(decode_escapes).unwrap_or_default(),
            description: update.description.as_deref().map(decode_escapes).unwrap_or_default(),
            training_ids: update.training_ids,
        };
        tracing::info!("{}", notice.summary());

        let trained = notice.training_ids.is_some();
        self.notify(&Notification::VersionUpdate(notice.clone()));
        if trained {
            self.training_completed(Some(notice), None);
        }
    }

    fn on_training_status(self: &Arc<Self>, status: TrainingStatus) {
        let message = status.message.as_deref().map(decode_escapes).unwrap_or_default();
        tracing::info!("Training status: {:?} {}", status.status, message);

        let failed = status.status.as_deref() == Some("failed");
        self.notify_training(&TrainingNotification::Status {
            status: status.status,
            message: message.clone(),
        });
        if failed {
            self.training_failed(message);
        }
    }

    fn on_optimization_status(self: &Arc<Self>, status: OptimizationStatus) {
        let message = status.message.as_deref().map(decode_escapes).unwrap_or_default();
        tracing::info!(
            "Optimization status: task={:?} status={:?} progress={:?} {}",
            status.task_id,
            status.status,
            status.progress,
            message
        );

        let failed = status.status.as_deref() == Some("failed");
        self.notify_training(&TrainingNotification::OptimizationStatus {
            task_id: status.task_id,
            status: status.status,
            progress: status.progress,
            message: message.clone(),
        });
        if failed {
            self.training_failed(message);
        }
    }

    fn training_failed(self: &Arc<Self>, message: String) {
        let error = if message.is_empty() {
            "Unknown error".to_string()
        } else {
            message
        };
        tracing::warn!("Training failed: {}", error);
        self.training_completed(None, Some(error));
    }

    fn training_completed(self: &Arc<Self>, version: Option<VersionNotice>, error: Option<String>) {
        self.notify_training(&TrainingNotification::Completed { version, error });
        self.release(reasons::TRAINING);
    }

    fn notify(&self, notification: &Notification) {
        let callbacks: Vec<_> = self
            .state
            .lock()
            .subscribers
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(notification);
        }
    }

    fn notify_training(&self, notification: &TrainingNotification) {
        let callbacks: Vec<_> = self
            .state
            .lock()
            .training
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(notification);
        }
    }
}

fn take_by_id<T>(list: &mut Vec<(u64, T)>, id: u64) -> Option<T> {
    let index = list.iter().position(|(entry, _)| *entry == id)?;
    Some(list.remove(index).1)
}

/// Connection task: pump frames, reconnect on loss, stop when cancelled
async fn run_connection(
    service: std::sync::Weak<Inner>,
    connector: Arc<dyn EventConnector>,
    url: String,
    cancel: CancellationToken,
) {
    loop {
        let lost = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            lost = pump(&service, connector.as_ref(), &url, &cancel) => lost,
        };
        if cancel.is_cancelled() {
            return;
        }
        tracing::warn!("Event connection lost: {}", lost);

        let Some(inner) = service.upgrade() else {
            return;
        };
        let Some(delay) = inner.next_reconnect(&cancel) else {
            return;
        };
        drop(inner);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Run one connection until it fails. Returns why it ended.
async fn pump(
    service: &std::sync::Weak<Inner>,
    connector: &dyn EventConnector,
    url: &str,
    cancel: &CancellationToken,
) -> Error {
    let mut stream = match connector.connect(url).await {
        Ok(stream) => stream,
        Err(e) => return e,
    };

    while let Some(item) = stream.next().await {
        if cancel.is_cancelled() {
            return Error::Connection("connection closed".to_string());
        }
        let Some(inner) = service.upgrade() else {
            return Error::Connection("service dropped".to_string());
        };
        match item {
            Ok(SseItem::Open) => inner.on_open(),
            Ok(SseItem::Message { event, data }) => inner.handle_message(&event, &data),
            Err(e) => return e,
        }
    }
    Error::Connection("event stream ended".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SseStream;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    enum Script {
        Refuse,
        Channel(mpsc::UnboundedReceiver<Result<SseItem>>),
    }

    /// Hands out scripted connections; refuses once the script runs out
    #[derive(Default)]
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Script>>,
        connects: Mutex<usize>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                connects: Mutex::new(0),
            })
        }

        fn connects(&self) -> usize {
            *self.connects.lock()
        }
    }

    #[async_trait]
    impl EventConnector for ScriptedConnector {
        async fn connect(&self, _url: &str) -> Result<SseStream> {
            *self.connects.lock() += 1;
            match self.scripts.lock().pop_front() {
                Some(Script::Channel(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
                Some(Script::Refuse) | None => Err(Error::Connection("connection refused".into())),
            }
        }
    }

    fn open_channel() -> (mpsc::UnboundedSender<Result<SseItem>>, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Script::Channel(rx))
    }

    fn service(connector: Arc<ScriptedConnector>) -> EventService {
        EventService::with_connector(EventServiceConfig::default(), connector).unwrap()
    }

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |item: &T| sink.lock().push(item.clone()))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = EventServiceConfig::default().with_idle_timeout(Duration::ZERO);
        let result = EventService::with_connector(config, ScriptedConnector::new(vec![]));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_update_from_training() {
        let (_tx, script) = open_channel();
        let service = service(ScriptedConnector::new(vec![script]));
        let (general, on_general) = recorder::<Notification>();
        let (training, on_training) = recorder::<TrainingNotification>();
        let _sub = service.subscribe(on_general);
        let _training_sub = service.subscribe_training(on_training);
        service.connect_for(reasons::TRAINING);
        service.connect_for(reasons::CHAT);

        service.handle_message(
            "version_update",
            r#"{"old_version":"1.0.0","new_version":"1.1.0","message":"\\u7248\\u672c","training_ids":[7]}"#,
        );

        let general = general.lock();
        match &general[0] {
            Notification::VersionUpdate(notice) => {
                assert_eq!(notice.message, "版本");
                assert_eq!(notice.new_version.as_deref(), Some("1.1.0"));
            }
            other => panic!("expected version update, got {:?}", other),
        }
        assert!(matches!(
            training.lock().as_slice(),
            [TrainingNotification::Completed { version: Some(_), error: None }]
        ));
        assert_eq!(service.reasons(), vec![reasons::CHAT.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_push_and_completion() {
        let (_tx, script) = open_channel();
        let service = service(ScriptedConnector::new(vec![script]));
        let (seen, on_event) = recorder::<Notification>();
        let _sub = service.subscribe(on_event);
        service.connect_for(reasons::CHAT);

        service.handle_message("chat_stream", r#"{"answer":"Hi","reasoning":"r","step_type":"answer"}"#);
        service.handle_message("completion", r#"{"answer":"","reasoning":""}"#);
        service.handle_message("completion", "[DONE]");

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(matches!(
            &seen[0],
            Notification::Chat(StreamEvent::Stream { content, deltas: None, .. }) if content == "Hi"
        ));
        match &seen[1] {
            Notification::Chat(StreamEvent::Complete { content, debug, .. }) => {
                assert_eq!(content, "Hi");
                assert_eq!(debug.as_ref().unwrap().reasoning, "r");
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(seen[2], Notification::Chat(StreamEvent::Done));
        assert!(service.reasons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_statuses_complete_training() {
        let service = service(ScriptedConnector::new(vec![]));
        let (training, on_training) = recorder::<TrainingNotification>();
        let _sub = service.subscribe_training(on_training);

        service.handle_message("training_status", r#"{"status":"failed","message":"out of memory"}"#);
        service.handle_message("optimization_failed", r#"{"task_id":"t1","progress":0.5}"#);
        service.handle_message("optimization_status", r#"{"task_id":"t2","status":"running","progress":0.2}"#);
        service.handle_message("optimization_created", r#"{"task_id":"t3"}"#);

        let training = training.lock();
        assert_eq!(training.len(), 6);
        assert_eq!(
            training[1],
            TrainingNotification::Completed {
                version: None,
                error: Some("out of memory".into())
            }
        );
        match &training[2] {
            TrainingNotification::OptimizationStatus { status, .. } => {
                assert_eq!(status.as_deref(), Some("failed"))
            }
            other => panic!("expected optimization status, got {:?}", other),
        }
        assert_eq!(
            training[3],
            TrainingNotification::Completed {
                version: None,
                error: Some("Unknown error".into())
            }
        );
        assert!(matches!(training[5], TrainingNotification::OptimizationCreated(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_and_malformed_frames() {
        let service = service(ScriptedConnector::new(vec![]));
        let (seen, on_event) = recorder::<Notification>();
        let _sub = service.subscribe(on_event);

        service.handle_message("chat_stream", "{broken");
        service.handle_message("mystery", "{}");
        service.handle_message("error", r#"{"detail":"quota exceeded"}"#);

        assert_eq!(
            *seen.lock(),
            vec![Notification::ServerError {
                message: "quota exceeded".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_teardown_after_last_reason() {
        let (tx, script) = open_channel();
        let connector = ScriptedConnector::new(vec![script]);
        let service = service(connector.clone());
        let _sub = service.subscribe(|_| {});

        service.connect_for(reasons::CHAT);
        settle().await;
        assert_eq!(connector.connects(), 1);

        // Held by a reason: never torn down
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(service.is_open());

        service.release(reasons::CHAT);
        tokio::time::sleep(Duration::from_secs(40)).await;
        // A received frame restarts the countdown
        tx.send(Ok(SseItem::Message {
            event: "heartbeat".into(),
            data: r#"{"timestamp":1}"#.into(),
        }))
        .unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(service.is_open());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!service.is_open());
        assert_eq!(service.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_limit() {
        let connector = ScriptedConnector::new(vec![]);
        let service = service(connector.clone());
        let (seen, on_event) = recorder::<Notification>();
        let _sub = service.subscribe(on_event);

        let start = tokio::time::Instant::now();
        service.open();
        tokio::time::sleep(Duration::from_secs(10)).await;

        // First connect plus three reconnects, after 1s, 2s and 3s
        assert_eq!(connector.connects(), 4);
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert_eq!(*seen.lock(), vec![Notification::ConnectionLost { attempts: 3 }]);
        assert!(!service.is_open());
        assert_eq!(service.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_reconnect_budget() {
        let (tx, script) = open_channel();
        tx.send(Ok(SseItem::Open)).unwrap();
        drop(tx);
        let connector = ScriptedConnector::new(vec![Script::Refuse, script]);
        let service = service(connector.clone());
        let (seen, on_event) = recorder::<Notification>();
        let _sub = service.subscribe(on_event);

        service.open();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(connector.connects(), 5);
        assert_eq!(*seen.lock(), vec![Notification::ConnectionLost { attempts: 3 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_and_close_are_idempotent() {
        let (_tx, script) = open_channel();
        let connector = ScriptedConnector::new(vec![script]);
        let service = service(connector.clone());

        service.open();
        service.open();
        settle().await;
        assert_eq!(connector.connects(), 1);
        assert!(service.is_open());

        service.close();
        service.close();
        assert!(!service.is_open());
        assert!(service.reasons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_subscriber_leaving_closes() {
        let (_tx, script) = open_channel();
        let service = service(ScriptedConnector::new(vec![script]));
        let first = service.subscribe(|_| {});
        let second = service.subscribe(|_| {});
        let training = service.subscribe_training(|_| {});
        service.connect_for(reasons::SAMPLES);

        training.unsubscribe();
        assert_eq!(service.training_subscriber_count(), 0);
        first.unsubscribe();
        assert!(service.is_open());

        drop(second);
        assert!(!service.is_open());
        assert!(service.reasons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_flow_from_connection_to_subscribers() {
        let (tx, script) = open_channel();
        let service = service(ScriptedConnector::new(vec![script]));
        let (seen, on_event) = recorder::<Notification>();
        let _sub = service.subscribe(on_event);
        service.open();

        tx.send(Ok(SseItem::Open)).unwrap();
        tx.send(Ok(SseItem::Message {
            event: "chat_stream".into(),
            data: r#"{"answer":"pushed","reasoning":""}"#.into(),
        }))
        .unwrap();
        settle().await;

        assert!(matches!(
            seen.lock().as_slice(),
            [Notification::Chat(StreamEvent::Stream { content, .. })] if content == "pushed"
        ));
    }
}
