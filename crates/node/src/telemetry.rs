//! Outbound telemetry: the device-local payload shape and the best-effort
//! HTTP forward that runs alongside the MQTT publish.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::control::GasLevels;
use crate::sensors::SensorSample;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Telemetry as the device publishes it. The hub maps these field names
/// onto its canonical record; `timestamp` is left for the hub to stamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryPayload {
    pub id_kebun: String,
    pub suhu: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kelembapan_udara: Option<f32>,
    pub kelembapan_tanah: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cahaya: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co2: Option<f64>,
}

impl TelemetryPayload {
    /// `None` when the temperature read failed: nothing is sent that cycle.
    pub fn build(garden_id: &str, sample: &SensorSample, gas: Option<&GasLevels>) -> Option<Self> {
        let suhu = sample.temperature?;
        Some(Self {
            id_kebun: garden_id.to_string(),
            suhu,
            kelembapan_udara: sample.humidity,
            kelembapan_tanah: estimate_soil_moisture(sample.humidity),
            cahaya: sample.light_raw,
            co2: gas.map(|g| g.co2),
        })
    }
}

/// No soil probe is fitted; approximate it from air humidity.
fn estimate_soil_moisture(humidity: Option<f32>) -> u8 {
    ((humidity.unwrap_or(0.0) * 0.8) as i32).clamp(0, 100) as u8
}

/// Fire-and-forget HTTP POST of telemetry to the hub.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    url: String,
}

impl HttpForwarder {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// Spawn the POST and return immediately. Failures are logged only.
    pub fn forward(&self, body: Vec<u8>) {
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let res = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await;
            match res {
                Ok(r) => tracing::debug!(status = %r.status(), %url, "http forward done"),
                Err(e) => tracing::warn!(%url, "http forward failed: {e}"),
            }
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
