//! Per-owner job event streams.
//!
//! Each owner id maps to a broadcast channel. Subscribers get a `Connected`
//! greeting, then `JobUpdate` events carrying the full observable job state
//! (idempotent replacement keyed by job id, so a missed intermediate update
//! is harmless), plus periodic `Heartbeat`s. A subscriber that falls behind
//! the channel capacity sees an `Error` event noting the gap instead of the
//! dropped updates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use uuid::Uuid;

use crate::store::JobView;

/// An event on an owner's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event on every subscription.
    Connected {
        subscriber_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    /// Full observable state of one job.
    JobUpdate(JobView),
    /// Periodic liveness signal.
    Heartbeat { timestamp: DateTime<Utc> },
    /// Stream-level problem report (e.g. the subscriber lagged).
    Error { message: String },
}

/// Fan-out hub for owner-scoped event streams.
pub struct Notifier {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<StreamEvent>>>,
}

impl Notifier {
    /// Creates a notifier whose per-owner channels buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Opens an event stream for one owner. The stream starts with a
    /// `Connected` event and then carries updates for all of the owner's
    /// jobs.
    pub async fn subscribe(&self, owner_id: &str) -> BoxStream<'static, StreamEvent> {
        let rx = {
            let mut channels = self.channels.write().await;
            channels
                .entry(owner_id.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let connected = StreamEvent::Connected {
            subscriber_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };

        stream::once(async move { connected })
            .chain(BroadcastStream::new(rx).filter_map(|item| async move {
                match item {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(n)) => Some(StreamEvent::Error {
                        message: format!("{n} events dropped; stream lagged"),
                    }),
                }
            }))
            .boxed()
    }

    /// Publishes a job update on the owner's channel. A no-op when the owner
    /// has no active subscribers.
    pub async fn publish(&self, owner_id: &str, view: JobView) {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(owner_id) {
            // Send errors just mean every receiver is gone.
            let _ = sender.send(StreamEvent::JobUpdate(view));
        }
    }

    /// Sends a heartbeat to every live channel and prunes channels whose
    /// subscribers have all disconnected.
    pub async fn broadcast_heartbeat(&self) {
        let timestamp = Utc::now();
        let mut channels = self.channels.write().await;
        channels.retain(|owner_id, sender| {
            if sender.receiver_count() == 0 {
                debug!(owner_id = %owner_id, "Pruning idle event channel");
                return false;
            }
            let _ = sender.send(StreamEvent::Heartbeat { timestamp });
            true
        });
    }

    /// Number of owners with an open channel.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Job, JobStatus};
    use crate::solver::{Algorithm, SolverParams};

    fn sample_view(status: JobStatus) -> JobView {
        let mut job = Job::new(
            "alice",
            Algorithm::MonteCarlo,
            "HPHP",
            SolverParams::default(),
            0,
        );
        if status == JobStatus::Running {
            job.apply_running(Utc::now()).unwrap();
        }
        job.view()
    }

    #[tokio::test]
    async fn test_subscription_starts_with_connected() {
        let notifier = Notifier::new(16);
        let mut stream = notifier.subscribe("alice").await;

        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Connected { .. }));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let notifier = Notifier::new(16);
        let mut stream = notifier.subscribe("alice").await;
        stream.next().await; // consume Connected

        notifier.publish("alice", sample_view(JobStatus::Running)).await;

        match stream.next().await.unwrap() {
            StreamEvent::JobUpdate(view) => assert_eq!(view.status, JobStatus::Running),
            other => panic!("expected JobUpdate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_streams_are_owner_scoped() {
        let notifier = Notifier::new(16);
        let mut alice = notifier.subscribe("alice").await;
        let mut bob = notifier.subscribe("bob").await;
        alice.next().await;
        bob.next().await;

        notifier.publish("alice", sample_view(JobStatus::Queued)).await;
        notifier.broadcast_heartbeat().await;

        assert!(matches!(
            alice.next().await.unwrap(),
            StreamEvent::JobUpdate(_)
        ));
        // Bob only sees the heartbeat.
        assert!(matches!(
            bob.next().await.unwrap(),
            StreamEvent::Heartbeat { .. }
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let notifier = Notifier::new(16);
        notifier.publish("nobody", sample_view(JobStatus::Queued)).await;
        assert_eq!(notifier.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_prunes_disconnected_channels() {
        let notifier = Notifier::new(16);
        {
            let _stream = notifier.subscribe("alice").await;
            assert_eq!(notifier.channel_count().await, 1);
        }
        notifier.broadcast_heartbeat().await;
        assert_eq!(notifier.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_event_serialization_is_tagged() {
        let event = StreamEvent::Heartbeat {
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "heartbeat");

        let event = StreamEvent::JobUpdate(sample_view(JobStatus::Queued));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_update");
        assert_eq!(json["status"], "queued");
    }
}
