//! Subscription handles returned by the event service.

use std::sync::Weak;

use crate::service::Inner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriberKind {
    General,
    Training,
}

/// Keeps a callback registered with an [`crate::EventService`].
///
/// Dropping the handle (or calling [`Subscription::unsubscribe`]) removes the
/// callback. When the last general subscriber leaves, the service closes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    service: Weak<Inner>,
    id: u64,
    kind: SubscriberKind,
}

impl Subscription {
    pub(crate) fn new(service: Weak<Inner>, id: u64, kind: SubscriberKind) -> Self {
        Self { service, id, kind }
    }

    /// Remove the callback now
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(service) = self.service.upgrade() {
            service.remove_subscriber(self.id, self.kind);
        }
    }
}
