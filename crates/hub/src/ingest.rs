//! MQTT ingestion: telemetry is normalized, stored, then pushed to live
//! viewers; device status events are relayed and remembered.

use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::MqttConfig;
use crate::db::{Db, StoredRecord};
use crate::live::{LiveEvent, LiveFeed};
use crate::normalize::{Normalizer, TelemetryRecord};
use crate::state::SharedState;

const RETRY_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 20;

/// Store, remember, broadcast. Shared by the MQTT worker and the HTTP API.
#[derive(Clone)]
pub struct Pipeline {
    db: Db,
    feed: LiveFeed,
    state: SharedState,
    normalizer: Normalizer,
}

impl Pipeline {
    pub fn new(db: Db, feed: LiveFeed, state: SharedState, normalizer: Normalizer) -> Self {
        Self {
            db,
            feed,
            state,
            normalizer,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn feed(&self) -> &LiveFeed {
        &self.feed
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Insert one document, then tell everyone about it. A failed broadcast
    /// never undoes the insert.
    pub async fn store(&self, record: TelemetryRecord) -> Result<StoredRecord> {
        let id = self.db.insert_record(&record).await?;
        let stored = StoredRecord { id, record };

        self.state.write().await.record_telemetry(&stored);
        self.feed.publish(LiveEvent::SensorUpdate(stored.clone()));
        tracing::info!(id, garden = %stored.record.garden_id, "telemetry stored");
        Ok(stored)
    }

    /// `Ok(None)` when the payload is not JSON; that message is dropped.
    pub async fn handle_telemetry(&self, payload: &[u8]) -> Result<Option<StoredRecord>> {
        let raw: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("bad telemetry json: {e}");
                self.state
                    .write()
                    .await
                    .record_error(format!("bad telemetry json: {e}"));
                return Ok(None);
            }
        };
        let record = self.normalizer.normalize(&raw);
        self.store(record).await.map(Some)
    }

    pub async fn handle_status(&self, payload: &[u8]) {
        match serde_json::from_slice::<Value>(payload) {
            Ok(status) => {
                tracing::info!(%status, "actuator status");
                self.state.write().await.record_actuator_status(&status);
                self.feed.publish(LiveEvent::ActuatorStatus(status));
            }
            Err(e) => tracing::warn!("bad status json: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub fn connect(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_sec));
    AsyncClient::new(opts, REQUEST_CAPACITY)
}

async fn dispatch(pipeline: &Pipeline, cfg: &MqttConfig, topic: &str, payload: &[u8]) {
    if topic == cfg.telemetry_topic {
        if let Err(e) = pipeline.handle_telemetry(payload).await {
            tracing::error!("telemetry ingest failed: {e:#}");
            pipeline
                .state()
                .write()
                .await
                .record_error(format!("ingest failed: {e}"));
        }
    } else if topic == cfg.status_topic {
        pipeline.handle_status(payload).await;
    } else {
        tracing::debug!(%topic, "unhandled topic");
    }
}

/// Runs forever. Subscriptions are renewed on every CONNACK so a broker
/// restart does not silently stop ingestion.
pub async fn run(client: AsyncClient, mut eventloop: EventLoop, pipeline: Pipeline, cfg: MqttConfig) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                dispatch(&pipeline, &cfg, &p.topic, &p.payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                for topic in [&cfg.telemetry_topic, &cfg.status_topic] {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                        tracing::error!(%topic, "subscribe failed: {e}");
                    }
                }
                tracing::info!(
                    telemetry = %cfg.telemetry_topic,
                    status = %cfg.status_topic,
                    "mqtt connected, subscribed"
                );
                let mut st = pipeline.state().write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("mqtt disconnected");
                let mut st = pipeline.state().write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("mqtt error: {e}. reconnecting in {RETRY_DELAY:?}");
                let mut st = pipeline.state().write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(RETRY_DELAY).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
