//! TOML config file loading, environment overrides and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    pub web: WebConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_sec: u64,
    pub telemetry_topic: String,
    pub status_topic: String,
    /// Commands go to `<command_prefix>/<lamp>`.
    pub command_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "garden-hub".into(),
            keep_alive_sec: 60,
            telemetry_topic: "iot/monitoring".into(),
            status_topic: "iot/lamp/status".into(),
            command_prefix: "iot/lamp/cmd".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_url: String,
    /// How many records `GET /api/sensor` returns.
    pub recent_limit: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:garden.db?mode=rwc".into(),
            recent_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Used when a payload carries no garden id.
    pub default_garden_id: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_garden_id: "KBG001".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Overrides & validation
// ---------------------------------------------------------------------------

impl HubConfig {
    /// `MQTT_HOST`, `MQTT_PORT`, `DB_URL`, `WEB_PORT`. Unparseable ports are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MQTT_HOST").filter(|v| !v.trim().is_empty()) {
            self.mqtt.host = host;
        }
        if let Some(url) = lookup("DB_URL").filter(|v| !v.trim().is_empty()) {
            self.storage.db_url = url;
        }
        for (key, slot) in [
            ("MQTT_PORT", &mut self.mqtt.port),
            ("WEB_PORT", &mut self.web.port),
        ] {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse() {
                    Ok(port) => *slot = port,
                    Err(_) => tracing::warn!(%key, value = %raw, "ignoring invalid port"),
                }
            }
        }
    }

    /// Validate all fields. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let m = &self.mqtt;
        for (name, value) in [
            ("mqtt.host", &m.host),
            ("mqtt.client_id", &m.client_id),
            ("mqtt.telemetry_topic", &m.telemetry_topic),
            ("mqtt.status_topic", &m.status_topic),
            ("mqtt.command_prefix", &m.command_prefix),
            ("storage.db_url", &self.storage.db_url),
            ("ingest.default_garden_id", &self.ingest.default_garden_id),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{name} is empty"));
            }
        }

        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.keep_alive_sec < 5 {
            errors.push(format!(
                "mqtt.keep_alive_sec must be at least 5, got {}",
                m.keep_alive_sec
            ));
        }
        for (name, topic) in [
            ("mqtt.telemetry_topic", &m.telemetry_topic),
            ("mqtt.status_topic", &m.status_topic),
        ] {
            if topic.contains(['+', '#']) {
                errors.push(format!("{name} '{topic}' must not contain wildcards"));
            }
        }
        if m.command_prefix.contains(['+', '#']) || m.command_prefix.ends_with('/') {
            errors.push(format!(
                "mqtt.command_prefix '{}' must be a plain topic without trailing '/'",
                m.command_prefix
            ));
        }
        if !m.telemetry_topic.is_empty() && m.telemetry_topic == m.status_topic {
            errors.push("mqtt.telemetry_topic and mqtt.status_topic must differ".into());
        }

        if self.storage.recent_limit <= 0 {
            errors.push(format!(
                "storage.recent_limit must be positive, got {}",
                self.storage.recent_limit
            ));
        }
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file means all defaults.
pub fn read(path: &str) -> Result<HubConfig> {
    if !Path::new(path).exists() {
        tracing::warn!(%path, "config file not found, using defaults");
        return Ok(HubConfig::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))
}

/// Read, apply environment overrides, validate.
pub fn load(path: &str) -> Result<HubConfig> {
    let mut config = read(path)?;
    config.apply_overrides(|key| std::env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
