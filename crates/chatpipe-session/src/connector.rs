//! Event connection seam

use std::pin::Pin;

use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest_eventsource::{Event, EventSource, retry::Never};

use crate::error::{Error, Result};

/// One item received on an event connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    /// The connection is established
    Open,
    /// A frame with its event name (`message` when untyped)
    Message { event: String, data: String },
}

/// Items of one connection; the stream ends or errors when it is lost
pub type SseStream = Pin<Box<dyn Stream<Item = Result<SseItem>> + Send>>;

/// Opens event connections
#[async_trait]
pub trait EventConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SseStream>;
}

/// Connector backed by `reqwest-eventsource`. Reconnection is left to the
/// service, so the event source's own retry policy is disabled.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventConnector for HttpConnector {
    async fn connect(&self, url: &str) -> Result<SseStream> {
        tracing::info!("Connecting to event stream: {}", url);
        let mut source = EventSource::new(self.client.get(url))
            .map_err(|e| Error::Connection(format!("Failed to create event source: {}", e)))?;
        source.set_retry_policy(Box::new(Never));

        Ok(Box::pin(stream! {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => yield Ok(SseItem::Open),
                    Ok(Event::Message(msg)) => {
                        yield Ok(SseItem::Message {
                            event: msg.event,
                            data: msg.data,
                        });
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        source.close();
                        yield Err(Error::Connection(e.to_string()));
                        return;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_connector_yields_typed_frames() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: connected\ndata: {\"message\":\"hello\"}\n\nevent: heartbeat\ndata: {\"timestamp\":1}\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let stream = HttpConnector::new()
            .connect(&format!("{}/events", server.uri()))
            .await
            .unwrap();
        let items: Vec<SseItem> = stream.map(|item| item.unwrap()).collect().await;

        assert_eq!(
            items,
            vec![
                SseItem::Open,
                SseItem::Message {
                    event: "connected".into(),
                    data: "{\"message\":\"hello\"}".into(),
                },
                SseItem::Message {
                    event: "heartbeat".into(),
                    data: "{\"timestamp\":1}".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_http_connector_reports_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut stream = HttpConnector::new()
            .connect(&format!("{}/events", server.uri()))
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(Error::Connection(_))));
        assert!(stream.next().await.is_none());
    }
}
