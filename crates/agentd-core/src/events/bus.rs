//! Per-user subscriber registry and fan-out
//!
//! Delivery is best-effort: a closed sink is pruned on the next publish and
//! never affects other subscribers or the publisher. Liveness is tracked
//! through client pings; a sink silent for two ping intervals is dropped by
//! the keepalive sweep. There is no backlog replay on reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::types::Event;

/// Opaque subscriber handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    sink: mpsc::UnboundedSender<Event>,
    last_seen: Instant,
}

/// Per-user fan-out of lifecycle events
pub struct EventBus {
    subscribers: Mutex<HashMap<i64, Vec<Subscriber>>>,
    next_id: std::sync::atomic::AtomicU64,
    ping_interval: Duration,
}

impl EventBus {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
            ping_interval,
        }
    }

    /// Register a sink for a user. Multiple sinks per user are allowed.
    pub fn subscribe(&self, user_id: i64) -> (SubscriberId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriberId(
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.entry(user_id).or_default().push(Subscriber {
            id,
            sink: tx,
            last_seen: Instant::now(),
        });
        info!(user_id, subscriber = id.0, "event bus subscriber registered");
        (id, rx)
    }

    pub fn unsubscribe(&self, user_id: i64, id: SubscriberId) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(sinks) = subscribers.get_mut(&user_id) {
            sinks.retain(|s| s.id != id);
            if sinks.is_empty() {
                subscribers.remove(&user_id);
            }
        }
        debug!(user_id, subscriber = id.0, "event bus subscriber removed");
    }

    /// Deliver an event to every current sink for the user, pruning sinks
    /// whose receiving end is gone
    pub fn publish(&self, user_id: i64, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        let Some(sinks) = subscribers.get_mut(&user_id) else {
            return;
        };
        sinks.retain(|s| s.sink.send(event.clone()).is_ok());
        if sinks.is_empty() {
            subscribers.remove(&user_id);
        }
    }

    /// Record a client ping and answer it with a pong on that sink
    pub fn note_pong(&self, user_id: i64, id: SubscriberId) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(sinks) = subscribers.get_mut(&user_id) {
            if let Some(subscriber) = sinks.iter_mut().find(|s| s.id == id) {
                subscriber.last_seen = Instant::now();
                let _ = subscriber.sink.send(Event::Pong);
            }
        }
    }

    pub fn subscriber_count(&self, user_id: i64) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(&user_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Drop subscribers that have been silent for two ping intervals
    pub fn sweep_stale(&self) {
        let deadline = self.ping_interval * 2;
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|user_id, sinks| {
            sinks.retain(|s| {
                let alive = s.last_seen.elapsed() <= deadline;
                if !alive {
                    info!(user_id, subscriber = s.id.0, "dropping stale subscriber");
                }
                alive
            });
            !sinks.is_empty()
        });
    }

    /// Periodic keepalive sweep
    pub fn start_keepalive(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bus.ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                bus.sweep_stale();
            }
        })
    }

    // Convenience broadcasters used by the managers

    pub fn broadcast_task_created(&self, user_id: i64, task_id: &str, description: &str) {
        self.publish(
            user_id,
            Event::TaskCreated {
                task_id: task_id.to_string(),
                description: description.to_string(),
                created_at: chrono::Utc::now(),
            },
        );
    }

    pub fn broadcast_task_update(
        &self,
        user_id: i64,
        task_id: &str,
        status: &str,
        result: Option<String>,
    ) {
        let completed_at = matches!(status, "completed" | "failed" | "cancelled")
            .then(chrono::Utc::now);
        self.publish(
            user_id,
            Event::TaskUpdate {
                task_id: task_id.to_string(),
                status: status.to_string(),
                result,
                completed_at,
            },
        );
    }

    pub fn broadcast_schedule_executed(
        &self,
        user_id: i64,
        task_id: &str,
        run_count: u32,
        next_run: Option<String>,
    ) {
        self.publish(
            user_id,
            Event::ScheduleExecuted {
                task_id: task_id.to_string(),
                run_count,
                next_run,
            },
        );
    }

    pub fn broadcast_storage_update(&self, user_id: i64, used_bytes: u64, quota_bytes: u64) {
        self.publish(
            user_id,
            Event::StorageUpdate {
                used_bytes,
                quota_bytes,
            },
        );
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_multiple_sinks() {
        let bus = EventBus::default();
        let (_id1, mut rx1) = bus.subscribe(1);
        let (_id2, mut rx2) = bus.subscribe(1);

        bus.broadcast_task_created(1, "t1", "demo");

        assert!(matches!(rx1.recv().await, Some(Event::TaskCreated { .. })));
        assert!(matches!(rx2.recv().await, Some(Event::TaskCreated { .. })));
    }

    #[tokio::test]
    async fn test_publish_is_per_user() {
        let bus = EventBus::default();
        let (_id, mut rx_other) = bus.subscribe(2);

        bus.broadcast_task_created(1, "t1", "demo");
        bus.broadcast_task_created(2, "t2", "demo");

        match rx_other.recv().await {
            Some(Event::TaskCreated { task_id, .. }) => assert_eq!(task_id, "t2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_sink_pruned_others_unaffected() {
        let bus = EventBus::default();
        let (_id1, rx1) = bus.subscribe(1);
        let (_id2, mut rx2) = bus.subscribe(1);
        drop(rx1);

        bus.broadcast_task_update(1, "t1", "running", None);
        assert_eq!(bus.subscriber_count(1), 1);
        assert!(matches!(rx2.recv().await, Some(Event::TaskUpdate { .. })));
    }

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let bus = EventBus::default();
        let (_id, mut rx) = bus.subscribe(1);

        bus.broadcast_task_created(1, "t1", "demo");
        bus.broadcast_task_update(1, "t1", "running", None);
        bus.broadcast_task_update(1, "t1", "completed", Some("done".into()));

        assert!(matches!(rx.recv().await, Some(Event::TaskCreated { .. })));
        match rx.recv().await {
            Some(Event::TaskUpdate { status, .. }) => assert_eq!(status, "running"),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await {
            Some(Event::TaskUpdate { status, result, .. }) => {
                assert_eq!(status, "completed");
                assert_eq!(result.as_deref(), Some("done"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_note_pong_answers_and_refreshes() {
        let bus = EventBus::new(Duration::from_millis(10));
        let (id, mut rx) = bus.subscribe(1);

        bus.note_pong(1, id);
        assert!(matches!(rx.recv().await, Some(Event::Pong)));
    }

    #[tokio::test]
    async fn test_sweep_drops_silent_subscribers() {
        let bus = EventBus::new(Duration::from_millis(5));
        let (_id, _rx) = bus.subscribe(1);
        assert_eq!(bus.subscriber_count(1), 1);

        tokio::time::sleep(Duration::from_millis(25)).await;
        bus.sweep_stale();
        assert_eq!(bus.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn test_recent_pong_survives_sweep() {
        let bus = EventBus::new(Duration::from_millis(50));
        let (id, _rx) = bus.subscribe(1);

        bus.note_pong(1, id);
        bus.sweep_stale();
        assert_eq!(bus.subscriber_count(1), 1);
    }
}
