use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::db::StoredRecord;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    /// Last known level of every output, merged from status events
    /// (`lamp1`..`lamp4`, `fan`).
    pub actuators: BTreeMap<String, String>,
    pub gardens: HashMap<String, GardenState>,
    pub events: VecDeque<HubEvent>,
}

#[derive(Clone, Serialize)]
pub struct GardenState {
    /// Timestamp of the newest record, as stored.
    pub last_seen: String,
    pub last_id: i64,
    pub records: u64,
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Actuator,
    Command,
    Error,
    System,
}

#[derive(Serialize)]
pub struct HostStats {
    pub load_one: f64,
    pub load_five: f64,
    pub load_fifteen: f64,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
}

impl HostStats {
    pub fn sample() -> Self {
        let load = System::load_average();
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            load_one: load.one,
            load_five: load.five,
            load_fifteen: load.fifteen,
            memory_total_bytes: sys.total_memory(),
            memory_used_bytes: sys.used_memory(),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub actuators: BTreeMap<String, String>,
    pub gardens: HashMap<String, GardenState>,
    pub events: Vec<HubEvent>,
    pub host: HostStats,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            actuators: BTreeMap::new(),
            gardens: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a stored telemetry document.
    pub fn record_telemetry(&mut self, stored: &StoredRecord) {
        let rec = &stored.record;
        let garden = self
            .gardens
            .entry(rec.garden_id.clone())
            .or_insert_with(|| GardenState {
                last_seen: String::new(),
                last_id: 0,
                records: 0,
            });
        garden.last_seen = rec.timestamp.clone();
        garden.last_id = stored.id;
        garden.records += 1;

        let mut parts = vec![format!("{} #{}", rec.garden_id, stored.id)];
        for (name, value) in [
            ("t", &rec.temperature),
            ("rh", &rec.humidity_air),
            ("soil", &rec.humidity_soil),
            ("light", &rec.light),
            ("co2", &rec.co2),
        ] {
            if let Some(v) = value {
                parts.push(format!("{name}={v}"));
            }
        }
        self.push_event(EventKind::Telemetry, parts.join(" "));
    }

    /// Merge a device status event into the actuator view. Accepts both the
    /// single-slot form `{"lamp": 5, "status": "ON"}` and the full snapshot.
    pub fn record_actuator_status(&mut self, status: &Value) {
        if let (Some(n), Some(s)) = (
            status.get("lamp").and_then(Value::as_u64),
            status.get("status").and_then(Value::as_str),
        ) {
            let slot = if n == 5 {
                "fan".to_string()
            } else {
                format!("lamp{n}")
            };
            self.actuators.insert(slot.clone(), s.to_string());
            self.push_event(EventKind::Actuator, format!("{slot} {s}"));
            return;
        }

        if let Some(map) = status.as_object() {
            for (slot, v) in map {
                if let Some(s) = v.as_str() {
                    self.actuators.insert(slot.clone(), s.to_string());
                }
            }
            self.push_event(EventKind::Actuator, format!("snapshot {status}"));
        }
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            actuators: self.actuators.clone(),
            gardens: self.gardens.clone(),
            events: self.events.iter().rev().cloned().collect(),
            host: HostStats::sample(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
