//! Environment configuration for the node, read once at start.

use std::time::Duration;

use anyhow::Result;

use crate::hw::{LightSource, PiWiring, DEFAULT_IIO_DIR, MAX_CHANNEL};
use crate::relay::PinMap;
#[cfg(not(feature = "gpio"))]
use crate::sim::Scenario;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub client_id: String,
    pub garden_id: String,
    /// Empty disables the HTTP forward.
    pub backend_url: String,
    pub poll_interval: Duration,
    pub tick: Duration,
    pub telemetry_topic: String,
    pub status_topic: String,
    pub command_topic: String,
    pub pins: PinMap,
    #[cfg(not(feature = "gpio"))]
    pub scenario: Scenario,
    pub wiring: PiWiring,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Bad numbers fall back to their defaults;
    /// bad pin lists are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        let node_id = text("NODE_ID", "node-a");
        let mqtt_port = lookup("MQTT_PORT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1883);

        let defaults = PinMap::default();
        let pins = PinMap {
            lamps: parse_lamp_pins(&lookup("LAMP_PINS").unwrap_or_default())?,
            fan: parse_pin("FAN_PIN", lookup("FAN_PIN"), defaults.fan)?,
            buzzer: parse_pin("BUZZER_PIN", lookup("BUZZER_PIN"), defaults.buzzer)?,
        };

        let wiring = PiWiring {
            gas_channel: parse_channel("GAS_CHANNEL", lookup("GAS_CHANNEL"), 0)?,
            ldr_channel: parse_channel("LDR_CHANNEL", lookup("LDR_CHANNEL"), 1)?,
            light: LightSource::from_str_lossy(&text("LIGHT_SENSOR", "ldr")),
            iio_dir: text("DHT_IIO_DIR", DEFAULT_IIO_DIR),
            ..PiWiring::default()
        };

        Ok(Self {
            mqtt_host: text("MQTT_HOST", "127.0.0.1"),
            mqtt_port,
            client_id: format!("garden-node-{node_id}"),
            garden_id: text("GARDEN_ID", "KBG001"),
            backend_url: lookup("BACKEND_URL").unwrap_or_default().trim().to_string(),
            poll_interval: Duration::from_millis(number("POLL_INTERVAL_MS", 5000).max(1)),
            tick: Duration::from_millis(number("TICK_MS", 100).max(1)),
            telemetry_topic: text("TELEMETRY_TOPIC", "iot/monitoring"),
            status_topic: text("STATUS_TOPIC", "iot/lamp/status"),
            command_topic: text("COMMAND_TOPIC", "iot/lamp/cmd/#"),
            pins,
            #[cfg(not(feature = "gpio"))]
            scenario: Scenario::from_str_lossy(&text("SIM_SCENARIO", "mild")),
            wiring,
        })
    }
}

/// `LAMP_PINS="5,6,13,19"`: exactly four BCM pins, empty means the default.
pub fn parse_lamp_pins(env_val: &str) -> Result<[u8; 4]> {
    if env_val.trim().is_empty() {
        return Ok(PinMap::default().lamps);
    }
    let mut pins = Vec::new();
    for token in env_val.split(',') {
        let pin: u8 = token
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid pin in LAMP_PINS: {token:?}"))?;
        pins.push(pin);
    }
    let count = pins.len();
    pins.try_into()
        .map_err(|_| anyhow::anyhow!("LAMP_PINS needs exactly 4 pins, got {count}"))
}

fn parse_pin(key: &str, value: Option<String>, default: u8) -> Result<u8> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid pin in {key}: {v:?}")),
    }
}

fn parse_channel(key: &str, value: Option<String>, default: u8) -> Result<u8> {
    let ch = match value.as_deref().map(str::trim) {
        None | Some("") => default,
        Some(v) => v
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid channel in {key}: {v:?}"))?,
    };
    anyhow::ensure!(
        ch <= MAX_CHANNEL,
        "channel {ch} in {key} exceeds maximum ({MAX_CHANNEL})"
    );
    Ok(ch)
}
