//! Version-activation notifications for connected clients.
//!
//! When a new cache version activates, every client that rendered pages
//! from the previous version must drop the application state it derived
//! from them. The store only depends on the [`VersionPublisher`] capability;
//! [`BroadcastPublisher`] fans events out over a tokio broadcast channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use harbor_common::{CacheVersion, Result};

/// Default number of events buffered per subscriber.
const DEFAULT_CAPACITY: usize = 16;

/// A new cache version became active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEvent {
    /// Version now serving requests.
    pub version: CacheVersion,
    /// Version it replaced, if known.
    pub previous: Option<CacheVersion>,
    /// When activation happened.
    pub activated_at: DateTime<Utc>,
}

impl VersionEvent {
    /// Create an event stamped with the current time.
    pub fn new(version: CacheVersion, previous: Option<CacheVersion>) -> Self {
        Self {
            version,
            previous,
            activated_at: Utc::now(),
        }
    }
}

/// Publish capability used to notify every connected client context.
#[async_trait]
pub trait VersionPublisher: Send + Sync {
    /// Deliver `event` to all current subscribers.
    ///
    /// Returns how many subscribers were notified.
    async fn publish(&self, event: VersionEvent) -> Result<usize>;
}

/// In-process publisher backed by a broadcast channel.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<VersionEvent>,
}

impl BroadcastPublisher {
    /// Create a publisher with the default buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a publisher buffering up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe a client context.
    pub fn subscribe(&self) -> broadcast::Receiver<VersionEvent> {
        self.tx.subscribe()
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VersionPublisher for BroadcastPublisher {
    async fn publish(&self, event: VersionEvent) -> Result<usize> {
        debug!("Publishing activation of version {}", event.version);
        // No subscribers is not an error: nobody needs to clear anything.
        Ok(self.tx.send(event).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let publisher = BroadcastPublisher::new();
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();

        let event = VersionEvent::new(
            CacheVersion::new("2").unwrap(),
            Some(CacheVersion::new("1").unwrap()),
        );
        let notified = publisher.publish(event.clone()).await.unwrap();

        assert_eq!(notified, 2);
        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let publisher = BroadcastPublisher::new();
        let event = VersionEvent::new(CacheVersion::new("1").unwrap(), None);
        assert_eq!(publisher.publish(event).await.unwrap(), 0);
    }
}
