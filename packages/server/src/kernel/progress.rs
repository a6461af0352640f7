//! In-process pub/sub for live run progress.
//!
//! Job-keyed broadcast channels push progress events to SSE endpoints.
//! Publishing never blocks: a subscriber that falls behind its buffer drops
//! events (it observes `Lagged` on receive, which the SSE layer logs).
//!
//! Producers (the orchestrator and transfer strategies):
//!   bus.publish(job_id, event).await;
//!
//! Consumers (SSE endpoints):
//!   let (snapshot, rx) = bus.subscribe(job_id).await;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

/// One progress frame, published on table and batch boundaries and at the
/// terminal transition of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub stage: String,
    #[serde(default)]
    pub current_table: String,
    pub tables_completed: usize,
    pub total_tables: usize,
    pub records_processed: u64,
    pub percentage: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_table_total_records: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_table_processed_records: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_table_percentage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    /// Terminal frames carry a final status; the SSE stream closes on them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("completed") | Some("failed") | Some("cancelled")
        )
    }
}

struct Topic {
    sender: broadcast::Sender<ProgressEvent>,
    latest: Option<ProgressEvent>,
}

/// Job-keyed progress fan-out. Thread-safe and cloneable.
#[derive(Clone)]
pub struct ProgressBus {
    topics: Arc<RwLock<HashMap<i64, Topic>>>,
    capacity: usize,
}

impl ProgressBus {
    /// Default buffer of 256 events per subscriber.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish an event, retaining it as the latest snapshot for the job.
    pub async fn publish(&self, job_id: i64, event: ProgressEvent) {
        let mut topics = self.topics.write().await;
        let topic = topics.entry(job_id).or_insert_with(|| Topic {
            sender: broadcast::channel(self.capacity).0,
            latest: None,
        });
        topic.latest = Some(event.clone());
        // Ignore send errors (no active receivers)
        let _ = topic.sender.send(event);
    }

    /// Subscribe to a job's progress. Returns the latest snapshot (if any)
    /// followed by a live receiver. Dropping the receiver unsubscribes.
    pub async fn subscribe(
        &self,
        job_id: i64,
    ) -> (Option<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        let mut topics = self.topics.write().await;
        let topic = topics.entry(job_id).or_insert_with(|| Topic {
            sender: broadcast::channel(self.capacity).0,
            latest: None,
        });
        (topic.latest.clone(), topic.sender.subscribe())
    }

    /// The most recent event for a job, if one was published.
    pub async fn latest_snapshot(&self, job_id: i64) -> Option<ProgressEvent> {
        self.topics
            .read()
            .await
            .get(&job_id)
            .and_then(|t| t.latest.clone())
    }

    /// Remove topics with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        let mut topics = self.topics.write().await;
        topics.retain(|_, topic| topic.sender.receiver_count() > 0);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(stage: &str) -> ProgressEvent {
        ProgressEvent {
            stage: stage.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let bus = ProgressBus::new();
        let (snapshot, mut rx) = bus.subscribe(1).await;
        assert!(snapshot.is_none());

        bus.publish(1, event("syncing")).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.stage, "syncing");
    }

    #[tokio::test]
    async fn snapshot_is_pushed_to_late_subscribers() {
        let bus = ProgressBus::new();
        bus.publish(7, event("syncing")).await;
        bus.publish(7, event("completed")).await;

        let (snapshot, _rx) = bus.subscribe(7).await;
        assert_eq!(snapshot.unwrap().stage, "completed");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = ProgressBus::new();
        // Should not panic or block
        bus.publish(42, event("syncing")).await;
        assert_eq!(bus.latest_snapshot(42).await.unwrap().stage, "syncing");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_events_without_blocking_publisher() {
        let bus = ProgressBus::with_capacity(2);
        let (_, mut rx) = bus.subscribe(1).await;

        for i in 0..10 {
            bus.publish(1, event(&format!("batch-{i}"))).await;
        }

        // The first receive observes the overflow, later ones the tail.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let caught_up = rx.recv().await.unwrap();
        assert_eq!(caught_up.stage, "batch-8");
    }

    #[tokio::test]
    async fn cleanup_removes_abandoned_topics() {
        let bus = ProgressBus::new();
        let (_, rx) = bus.subscribe(5).await;
        drop(rx);

        bus.cleanup().await;
        assert!(bus.latest_snapshot(5).await.is_none());
    }

    #[test]
    fn terminal_detection() {
        let mut ev = event("completed");
        assert!(!ev.is_terminal());
        ev.status = Some("completed".to_string());
        assert!(ev.is_terminal());
        ev.status = Some("running".to_string());
        assert!(!ev.is_terminal());
    }
}
