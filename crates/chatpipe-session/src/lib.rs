//! chatpipe-session: long-lived event connection for server notifications
//!
//! The [`EventService`] keeps one typed event-stream connection open while
//! any caller needs it, fans server notifications out to subscribers, and
//! closes itself once idle.

pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod handle;
pub mod service;

pub use config::EventServiceConfig;
pub use connector::{EventConnector, HttpConnector, SseItem, SseStream};
pub use error::{Error, Result};
pub use events::{Notification, TrainingNotification, VersionNotice};
pub use handle::Subscription;
pub use service::{EventService, reasons};
