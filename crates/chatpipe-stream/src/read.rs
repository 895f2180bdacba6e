//! Per-read timeout guard

use std::time::Duration;

use futures::{Stream, StreamExt};

/// Outcome of one guarded read
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    /// The reader produced an item
    Item(T),
    /// The reader is exhausted
    End,
    /// No item within the per-read limit; the reader is still usable
    TimedOut,
}

/// Race one read against `limit`.
///
/// `StreamExt::next` is cancel safe, so a timed-out read loses nothing and the
/// same reader can be polled again.
pub async fn read_with_timeout<S>(reader: &mut S, limit: Duration) -> ReadOutcome<S::Item>
where
    S: Stream + Unpin + ?Sized,
{
    match tokio::time::timeout(limit, reader.next()).await {
        Ok(Some(item)) => ReadOutcome::Item(item),
        Ok(None) => ReadOutcome::End,
        Err(_) => ReadOutcome::TimedOut,
    }
}
