//! Progress broadcaster for real-time pipeline notifications.
//!
//! One process-wide fan-out channel built on `tokio::sync::broadcast`. Each
//! subscriber owns a bounded ring of `capacity` events; publishing never
//! waits on subscribers. When a subscriber falls behind, the oldest events in
//! its ring are overwritten and it resumes from the oldest one still held,
//! so a lagging consumer always sees the freshest state.

use futures::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::defaults;
use crate::models::ProgressEvent;

/// Multi-subscriber progress channel.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBroadcaster {
    /// Create a broadcaster with the given per-subscriber capacity.
    ///
    /// Recommended: 256 for production, 8 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver an event to every live subscriber. Never blocks.
    pub fn publish(&self, event: ProgressEvent) {
        trace!(
            stage = ?event.stage,
            subject = ?event.subject,
            subscriber_count = self.tx.receiver_count(),
            "Progress publish"
        );
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    /// Open a new subscription. Dropping it unsubscribes.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(defaults::PROGRESS_BUFFER)
    }
}

/// A single subscriber's view of the progress channel.
pub struct Subscription {
    rx: broadcast::Receiver<ProgressEvent>,
    missed: u64,
}

impl Subscription {
    /// Next event, skipping over any that were overwritten while this
    /// subscriber lagged. Returns `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.missed += n;
                    debug!(missed = n, "Progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.missed += n,
                Err(_) => return None,
            }
        }
    }

    /// Total events this subscriber lost to lag.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Lazy, unbounded stream of events; ends when the broadcaster is dropped.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProgressStage, ProgressSubject};
    use futures::StreamExt;
    use uuid::Uuid;

    fn event(i: u8) -> ProgressEvent {
        ProgressEvent::item(format!("item-{}", i), ProgressStage::Fetch).with_percent(i)
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = ProgressBroadcaster::new(8);
        let mut sub = bus.subscribe();

        bus.publish(ProgressEvent::task(Uuid::nil(), ProgressStage::CycleStarted));

        let got = sub.recv().await.unwrap();
        assert_eq!(got.subject, ProgressSubject::Task(Uuid::nil()));
        assert_eq!(got.stage, ProgressStage::CycleStarted);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = ProgressBroadcaster::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(event(1));

        assert_eq!(a.recv().await.unwrap().percent, 1);
        assert_eq!(b.recv().await.unwrap().percent, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_ok() {
        let bus = ProgressBroadcaster::new(8);
        bus.publish(event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = ProgressBroadcaster::new(8);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = ProgressBroadcaster::new(2);
        let mut slow = bus.subscribe();

        for i in 0..5 {
            bus.publish(event(i));
        }

        // Only the two newest survive.
        assert_eq!(slow.recv().await.unwrap().percent, 3);
        assert_eq!(slow.recv().await.unwrap().percent, 4);
        assert_eq!(slow.missed(), 3);
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_affect_fast_one() {
        let bus = ProgressBroadcaster::new(2);
        let _slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for i in 0..5 {
            bus.publish(event(i));
            assert_eq!(fast.recv().await.unwrap().percent, i);
        }
        assert_eq!(fast.missed(), 0);
    }

    #[tokio::test]
    async fn test_stream_ends_when_broadcaster_dropped() {
        let bus = ProgressBroadcaster::new(8);
        let stream = bus.subscribe().into_stream();

        bus.publish(event(1));
        bus.publish(event(2));
        drop(bus);

        let got: Vec<u8> = stream.map(|e| e.percent).collect().await;
        assert_eq!(got, vec![1, 2]);
    }
}
