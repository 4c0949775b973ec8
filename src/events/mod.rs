//! Event Bus (C3) — fan-out of typed [`Event`]s to N subscribers with a
//! per-subscriber backpressure policy.
//!
//! Grounded on the shape of the teacher's `forwarding::events::ForwardEventEmitter`
//! (tagged event enum, wrapper with `emit_*` convenience methods, a `noop()`
//! constructor for tests), with the transport replaced: `tokio::sync::broadcast`
//! does not give per-subscriber backpressure-with-eviction (a lagging
//! receiver gets `RecvError::Lagged` and silently skips messages rather than
//! being dropped from the subscriber set), so subscribers are individually
//! bounded `mpsc` channels behind a `parking_lot::RwLock<Vec<Subscriber>>`.
//! `publish` snapshots the subscriber list under the lock and delivers
//! outside it — the "Observer with mutable list + notify-all" replacement
//! spec.md §9 calls for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bound on each subscriber's queue (spec.md §4.3).
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Heartbeat interval for idle buses (spec.md §4.3).
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// A tagged event broadcast over the bus. Every variant carries `timestamp`
/// (UTC ISO-8601) and, per spec.md §6, serializes with a top-level `event`
/// discriminant plus `timestamp`. Field names go out camelCase (`serverId`,
/// `socksPort`, `bytesIn`, ...) to match the Control API's other camelCase
/// wire bodies on the same socket (see `api::ws`'s snapshot frame).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    Connected {
        server_id: String,
        name: String,
        socks_port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        timestamp: String,
    },
    Disconnected {
        server_id: String,
        reason: String,
        timestamp: String,
    },
    Reconnecting {
        server_id: String,
        attempt: u32,
        next_retry_ms: u64,
        timestamp: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
        message: String,
        timestamp: String,
    },
    Stats {
        server_id: String,
        uptime: u64,
        bytes_in: u64,
        bytes_out: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
        timestamp: String,
    },
    Ping {
        timestamp: String,
    },
    ServerAdded {
        server_id: String,
        timestamp: String,
    },
    ServerDeleted {
        server_id: String,
        timestamp: String,
    },
}

impl Event {
    pub fn connected(server_id: impl Into<String>, name: impl Into<String>, socks_port: u16, source: Option<&str>) -> Self {
        Event::Connected {
            server_id: server_id.into(),
            name: name.into(),
            socks_port,
            source: source.map(|s| s.to_string()),
            timestamp: now_iso(),
        }
    }

    pub fn disconnected(server_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Event::Disconnected {
            server_id: server_id.into(),
            reason: reason.into(),
            timestamp: now_iso(),
        }
    }

    pub fn reconnecting(server_id: impl Into<String>, attempt: u32, next_retry_ms: u64) -> Self {
        Event::Reconnecting {
            server_id: server_id.into(),
            attempt,
            next_retry_ms,
            timestamp: now_iso(),
        }
    }

    pub fn error(server_id: Option<String>, message: impl Into<String>) -> Self {
        Event::Error {
            server_id,
            message: message.into(),
            timestamp: now_iso(),
        }
    }

    pub fn stats(server_id: impl Into<String>, uptime: u64, bytes_in: u64, bytes_out: u64, latency_ms: Option<u64>) -> Self {
        Event::Stats {
            server_id: server_id.into(),
            uptime,
            bytes_in,
            bytes_out,
            latency_ms,
            timestamp: now_iso(),
        }
    }

    pub fn ping() -> Self {
        Event::Ping { timestamp: now_iso() }
    }

    pub fn server_added(server_id: impl Into<String>) -> Self {
        Event::ServerAdded {
            server_id: server_id.into(),
            timestamp: now_iso(),
        }
    }

    pub fn server_deleted(server_id: impl Into<String>) -> Self {
        Event::ServerDeleted {
            server_id: server_id.into(),
            timestamp: now_iso(),
        }
    }

    /// The serverId this event concerns, if any — used only for log context.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Event::Connected { server_id, .. }
            | Event::Disconnected { server_id, .. }
            | Event::Reconnecting { server_id, .. }
            | Event::Stats { server_id, .. }
            | Event::ServerAdded { server_id, .. }
            | Event::ServerDeleted { server_id, .. } => Some(server_id),
            Event::Error { server_id, .. } => server_id.as_deref(),
            Event::Ping { .. } => None,
        }
    }
}

/// Severity/kind tag for a [`LogEntry`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Connected,
    Disconnected,
    Reconnected,
    Error,
    Warning,
}

/// One entry in the Manager's bounded ring of recent activity, surfaced via
/// `GET /logs` (spec.md §3/§4.12). Kept separate from [`Event`] — events are
/// the live WS stream, log entries are the human-readable history of them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: String,
    pub server_name: String,
    pub event: LogKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    pub fn new(server_name: impl Into<String>, event: LogKind, details: Option<String>) -> Self {
        Self {
            timestamp: now_iso(),
            server_name: server_name.into(),
            event,
            details,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Fan-out event bus. `Clone`able — clones share the same subscriber list
/// and heartbeat task.
#[derive(Clone)]
pub struct EventBus {
    inner: std::sync::Arc<EventBusInner>,
}

struct EventBusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    last_publish: std::sync::Mutex<std::time::Instant>,
}

/// Handle returned from `subscribe`; pass to `unsubscribe` to stop receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberHandle(u64);

impl EventBus {
    pub fn new() -> Self {
        let bus = Self {
            inner: std::sync::Arc::new(EventBusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                last_publish: std::sync::Mutex::new(std::time::Instant::now()),
            }),
        };
        bus.spawn_heartbeat();
        bus
    }

    fn spawn_heartbeat(&self) {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let idle = {
                    let last = *bus.inner.last_publish.lock().unwrap();
                    last.elapsed() >= HEARTBEAT_INTERVAL
                };
                if idle {
                    bus.publish(Event::ping());
                }
            }
        });
    }

    /// Register a new subscriber with a bounded queue. Returns a handle for
    /// `unsubscribe` and the receiving end of the channel.
    pub fn subscribe(&self) -> (SubscriberHandle, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push(Subscriber { id, tx });
        (SubscriberHandle(id), rx)
    }

    pub fn unsubscribe(&self, handle: SubscriberHandle) {
        self.inner.subscribers.write().retain(|s| s.id != handle.0);
    }

    /// Publish to all current subscribers. Never blocks: a subscriber whose
    /// queue is full is evicted rather than backpressuring the publisher.
    pub fn publish(&self, event: Event) {
        *self.inner.last_publish.lock().unwrap() = std::time::Instant::now();

        // Snapshot under the lock, deliver outside it.
        let snapshot: Vec<(u64, mpsc::Sender<Event>)> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|s| (s.id, s.tx.clone()))
            .collect();

        if snapshot.is_empty() {
            return;
        }

        let mut slow = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = id, "event bus: slow consumer, disconnecting");
                    slow.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(id);
                }
            }
        }

        if !slow.is_empty() {
            self.inner.subscribers.write().retain(|s| !slow.contains(&s.id));
        }

        debug!(event = ?event, "published");
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let (_handle, mut rx) = bus.subscribe();
        bus.publish(Event::connected("s1", "Server 1", 1080, None));
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Event::Connected { .. }));
    }

    #[tokio::test]
    async fn publish_never_blocks_and_evicts_slow_subscriber() {
        let bus = EventBus::new();
        let (_handle, mut rx) = bus.subscribe();

        // Fill the queue beyond capacity without ever calling rx.recv().
        for _ in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.publish(Event::disconnected("s1", "user_disconnect"));
        }

        assert_eq!(bus.subscriber_count(), 0);

        // The queue itself still holds up to capacity messages.
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert!(count <= SUBSCRIBER_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (handle, mut rx) = bus.subscribe();
        bus.unsubscribe(handle);
        bus.publish(Event::ping());
        assert!(rx.recv().await.is_none() || rx.try_recv().is_err());
    }

    #[test]
    fn event_serializes_with_tag_and_timestamp() {
        let event = Event::connected("s1", "Server", 1080, Some("external"));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"connected\""));
        assert!(json.contains("\"timestamp\""));
        assert!(json.contains("\"source\":\"external\""));
    }

    #[test]
    fn event_fields_serialize_camel_case() {
        let json = serde_json::to_string(&Event::connected("s1", "Server", 11080, None)).unwrap();
        assert!(json.contains("\"serverId\":\"s1\""));
        assert!(json.contains("\"socksPort\":11080"));

        let json = serde_json::to_string(&Event::reconnecting("s1", 1, 1000)).unwrap();
        assert!(json.contains("\"attempt\":1"));
        assert!(json.contains("\"nextRetryMs\":1000"));

        let json = serde_json::to_string(&Event::stats("s1", 10, 20, 30, Some(40))).unwrap();
        assert!(json.contains("\"bytesIn\":20"));
        assert!(json.contains("\"bytesOut\":30"));
        assert!(json.contains("\"latencyMs\":40"));
    }
}
