//! Live feed for connected viewers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::StoredRecord;

const FEED_CAPACITY: usize = 256;

/// `{"event": "sensor_update", "data": {...}}`. Sensor updates carry the
/// stored document, row `id` included.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LiveEvent {
    SensorUpdate(StoredRecord),
    ActuatorStatus(serde_json::Value),
}

#[derive(Clone)]
pub struct LiveFeed {
    tx: broadcast::Sender<LiveEvent>,
}

impl LiveFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    /// Nobody listening is not an error.
    pub fn publish(&self, event: LiveEvent) {
        match self.tx.send(event) {
            Ok(n) => tracing::debug!(viewers = n, "live event sent"),
            Err(_) => tracing::debug!("live event dropped, no viewers"),
        }
    }
}

impl Default for LiveFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn sensor_update_wire_shape() {
        let record = Normalizer::new("KBG001")
            .normalize_at(&json!({"suhu": 30}), datetime!(2024-05-01 07:30:00 UTC));
        let event = LiveEvent::SensorUpdate(StoredRecord { id: 7, record });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "sensor_update",
                "data": {
                    "id": 7,
                    "garden_id": "KBG001",
                    "temperature": 30,
                    "timestamp": "2024-05-01T07:30:00Z"
                }
            })
        );
    }

    #[test]
    fn actuator_status_wire_shape() {
        let event = LiveEvent::ActuatorStatus(json!({"lamp": 2, "status": "ON"}));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "actuator_status", "data": {"lamp": 2, "status": "ON"}})
        );
    }

    #[tokio::test]
    async fn publish_without_viewers_is_fine() {
        let feed = LiveFeed::new();
        feed.publish(LiveEvent::ActuatorStatus(json!({})));

        let mut rx = feed.subscribe();
        feed.publish(LiveEvent::ActuatorStatus(json!({"fan": "ON"})));
        assert_eq!(
            rx.recv().await.unwrap(),
            LiveEvent::ActuatorStatus(json!({"fan": "ON"}))
        );
    }
}
