//! Lifecycle event bus.
//!
//! Live fan-out only: a bounded broadcast ring buffer per subscriber, with
//! drop-oldest semantics for laggards so a slow consumer never blocks a
//! writer. Disconnected subscribers catch up through the query API.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::model::{Alert, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    AlertNew,
    AlertUpdate,
    AlertExpire,
    SourceNew,
    SourceUpdate,
    SourceDelete,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::AlertNew => "alert.new",
            Topic::AlertUpdate => "alert.update",
            Topic::AlertExpire => "alert.expire",
            Topic::SourceNew => "source.new",
            Topic::SourceUpdate => "source.update",
            Topic::SourceDelete => "source.delete",
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One message on the bus: topic plus the full canonical record.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub topic: Topic,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish_alert(&self, topic: Topic, alert: &Alert) {
        self.publish(topic, serde_json::to_value(alert).unwrap_or(Value::Null));
    }

    pub fn publish_source(&self, topic: Topic, source: &Source) {
        self.publish(topic, serde_json::to_value(source).unwrap_or(Value::Null));
    }

    fn publish(&self, topic: Topic, payload: Value) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(BusEvent { topic, payload });
        metrics::counter!("bus_events_total", "topic" => topic.as_str()).increment(1);
    }
}
