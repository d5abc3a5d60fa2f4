//! # Learn-Events
//!
//! In-process publish/subscribe for the side effects of user activity.
//! Request handlers publish a [`LearnEvent`] after their write commits;
//! listeners (XP, achievements) consume the bus on their own tasks, so a
//! failing listener never fails the request that triggered it.
//!
//! [`NotificationHub`] is the outbound half: per-user channels that the
//! achievements SSE stream subscribes to.

use crate::error::LearnResult;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the event bus before slow listeners start lagging
const BUS_CAPACITY: usize = 1024;

/// Capacity of each per-user notification channel
const NOTIFICATION_CAPACITY: usize = 64;

/// Something a user did that other services react to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LearnEvent {
    QuizCompleted {
        user_id: i64,
        quiz_id: i64,
        score: i64,
        total: i64,
    },
    CheckpointCompleted {
        user_id: i64,
        checkpoint_id: i64,
    },
    RoadmapCompleted {
        user_id: i64,
        roadmap_id: i64,
    },
    DailyLogin {
        user_id: i64,
        streak: i64,
    },
    StreakUpdated {
        user_id: i64,
    },
    CommunityJoined {
        user_id: i64,
        community_id: i64,
    },
    ContributionSubmitted {
        user_id: i64,
        contribution_id: i64,
    },
    ContributionApproved {
        user_id: i64,
        contribution_id: i64,
    },
}

impl LearnEvent {
    /// The user the event is about
    pub fn user_id(&self) -> i64 {
        match self {
            LearnEvent::QuizCompleted { user_id, .. }
            | LearnEvent::CheckpointCompleted { user_id, .. }
            | LearnEvent::RoadmapCompleted { user_id, .. }
            | LearnEvent::DailyLogin { user_id, .. }
            | LearnEvent::StreakUpdated { user_id }
            | LearnEvent::CommunityJoined { user_id, .. }
            | LearnEvent::ContributionSubmitted { user_id, .. }
            | LearnEvent::ContributionApproved { user_id, .. } => *user_id,
        }
    }
}

/// Broadcast bus carrying [`LearnEvent`]s to every listener
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LearnEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no listeners is not an error.
    pub fn publish(&self, event: LearnEvent) {
        debug!("Publishing {:?}", event);
        if self.tx.send(event).is_err() {
            debug!("No event listeners attached");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LearnEvent> {
        self.tx.subscribe()
    }
}

/// A consumer of the event bus
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &LearnEvent) -> LearnResult<()>;
}

/// Run `handler` against every event on `bus` until the bus closes
pub fn spawn_listener(bus: &EventBus, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    info!("🎧 Starting {} listener", handler.name());

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = handler.handle(&event).await {
                        warn!("{} listener failed on {:?}: {}", handler.name(), event, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{} listener missed {} events", handler.name(), n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("{} listener stopped", handler.name());
    })
}

/// A message pushed to one user's notification stream
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// `xp-awarded` or `achievement-unlocked`
    pub kind: String,
    pub data: Value,
}

impl Notification {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Per-user notification channels
#[derive(Clone, Default)]
pub struct NotificationHub {
    channels: Arc<DashMap<i64, broadcast::Sender<Notification>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one user's notifications
    pub fn subscribe(&self, user_id: i64) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
                tx
            })
            .subscribe()
    }

    /// Deliver to a user's open streams; dropped when nobody listens
    pub fn notify(&self, user_id: i64, notification: Notification) {
        let delivered = match self.channels.get(&user_id) {
            Some(tx) => tx.send(notification).is_ok(),
            None => return,
        };
        if !delivered {
            self.channels.remove_if(&user_id, |_, tx| tx.receiver_count() == 0);
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, user_id: i64) -> usize {
        self.channels
            .get(&user_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<LearnEvent>>,
        done: tokio::sync::mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn handle(&self, event: &LearnEvent) -> LearnResult<()> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(event.clone());
            }
            let _ = self.done.send(());
            if matches!(event, LearnEvent::StreakUpdated { .. }) {
                return Err(crate::error::LearnError::not_found("boom"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_listener_receives_events_and_survives_errors() {
        let bus = EventBus::new();
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            done: done_tx,
        });
        let _task = spawn_listener(&bus, recorder.clone());

        bus.publish(LearnEvent::StreakUpdated { user_id: 1 });
        bus.publish(LearnEvent::DailyLogin { user_id: 1, streak: 2 });
        done_rx.recv().await.unwrap();
        done_rx.recv().await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], LearnEvent::DailyLogin { user_id: 1, streak: 2 });
    }

    #[test]
    fn test_publish_without_listeners() {
        let bus = EventBus::new();
        bus.publish(LearnEvent::StreakUpdated { user_id: 9 });
    }

    #[test]
    fn test_event_user_id() {
        let event = LearnEvent::QuizCompleted {
            user_id: 4,
            quiz_id: 1,
            score: 3,
            total: 5,
        };
        assert_eq!(event.user_id(), 4);
    }

    #[tokio::test]
    async fn test_notification_hub() {
        let hub = NotificationHub::new();
        hub.notify(1, Notification::new("xp-awarded", json!({"amount": 5})));

        let mut rx = hub.subscribe(1);
        assert_eq!(hub.subscriber_count(1), 1);
        hub.notify(1, Notification::new("xp-awarded", json!({"amount": 10})));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, "xp-awarded");
        assert_eq!(got.data["amount"], 10);

        drop(rx);
        hub.notify(1, Notification::new("xp-awarded", json!({})));
        assert_eq!(hub.subscriber_count(1), 0);
    }
}
