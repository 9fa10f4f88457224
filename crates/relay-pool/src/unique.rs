//! Stream adapter that drops ids already forwarded within a trailing window.
//!
//! The window is soft: once an id has been evicted the same event passes
//! again, so consumers must still tolerate the occasional duplicate.

use futures_util::Stream;
use nostr_sdk::{Event, EventId};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

/// Ids forwarded recently, oldest first.
#[derive(Debug)]
pub struct RecentIds {
    window: Duration,
    order: VecDeque<(Instant, EventId)>,
    seen: HashMap<EventId, Instant>,
}

impl RecentIds {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            order: VecDeque::new(),
            seen: HashMap::new(),
        }
    }

    /// True if `id` was not forwarded within the window. Records it.
    pub fn admit(&mut self, id: EventId) -> bool {
        let now = Instant::now();
        self.evict(now);
        if self.seen.contains_key(&id) {
            return false;
        }
        self.seen.insert(id, now);
        self.order.push_back((now, id));
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, id)) = self.order.front() {
            if now.duration_since(at) < self.window {
                break;
            }
            self.order.pop_front();
            if self.seen.get(&id) == Some(&at) {
                self.seen.remove(&id);
            }
        }
    }
}

pub struct SoftUnique<S> {
    inner: S,
    recent: RecentIds,
}

impl<S> SoftUnique<S> {
    pub fn new(inner: S) -> Self {
        Self::with_window(inner, DEFAULT_WINDOW)
    }

    pub fn with_window(inner: S, window: Duration) -> Self {
        Self {
            inner,
            recent: RecentIds::new(window),
        }
    }
}

impl<S> Stream for SoftUnique<S>
where
    S: Stream<Item = Event> + Unpin,
{
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = &mut *self;
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(event)) => {
                    if this.recent.admit(event.id) {
                        return Poll::Ready(Some(event));
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::signed;
    use futures_util::StreamExt;
    use nostr_sdk::{Keys, Kind};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn duplicates_inside_window_are_dropped() {
        let keys = Keys::generate();
        let a = signed(&keys, Kind::TextNote, "a", 1, &[]);
        let b = signed(&keys, Kind::TextNote, "b", 2, &[]);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = SoftUnique::new(UnboundedReceiverStream::new(rx));

        tx.send(a.clone()).unwrap();
        tx.send(a.clone()).unwrap();
        tx.send(b.clone()).unwrap();
        assert_eq!(stream.next().await.map(|e| e.id), Some(a.id));
        assert_eq!(stream.next().await.map(|e| e.id), Some(b.id));

        tokio::time::advance(Duration::from_secs(29)).await;
        tx.send(a.clone()).unwrap();
        tx.send(b.clone()).unwrap();
        drop(tx);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ids_pass_again_after_window() {
        let keys = Keys::generate();
        let a = signed(&keys, Kind::TextNote, "a", 1, &[]);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = SoftUnique::new(UnboundedReceiverStream::new(rx));

        tx.send(a.clone()).unwrap();
        assert!(stream.next().await.is_some());

        tokio::time::advance(DEFAULT_WINDOW).await;
        tx.send(a.clone()).unwrap();
        assert_eq!(stream.next().await.map(|e| e.id), Some(a.id));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_is_lazy() {
        let keys = Keys::generate();
        let mut recent = RecentIds::new(Duration::from_secs(10));
        assert!(recent.admit(signed(&keys, Kind::TextNote, "a", 1, &[]).id));
        assert!(recent.admit(signed(&keys, Kind::TextNote, "b", 1, &[]).id));
        assert_eq!(recent.len(), 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(recent.len(), 2);
        assert!(recent.admit(signed(&keys, Kind::TextNote, "c", 1, &[]).id));
        assert_eq!(recent.len(), 1);
    }
}
