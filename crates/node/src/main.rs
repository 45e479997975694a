mod bus;
mod config;
mod control;
mod device;
mod hw;
mod relay;
mod sensors;
#[cfg(not(feature = "gpio"))]
mod sim;
mod supervisor;
mod telemetry;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::bus::{BrokerProbe, MqttConnector};
use crate::config::NodeConfig;
use crate::control::Controller;
use crate::device::{Device, DeviceSettings};
use crate::sensors::SensorReader;
use crate::supervisor::{ensure_connected, RetryPolicy};
use crate::telemetry::HttpForwarder;

#[cfg(feature = "gpio")]
type Board = relay::GpioRelays;
#[cfg(not(feature = "gpio"))]
type Board = relay::MockRelays;

#[cfg(feature = "gpio")]
fn open_board(cfg: &NodeConfig) -> Result<Board> {
    relay::GpioRelays::new(&cfg.pins)
}

#[cfg(not(feature = "gpio"))]
fn open_board(cfg: &NodeConfig) -> Result<Board> {
    Ok(relay::MockRelays::new(&cfg.pins))
}

#[cfg(feature = "gpio")]
fn open_sensors(cfg: &NodeConfig) -> Result<Box<dyn SensorReader>> {
    Ok(Box::new(hw::PiSensors::new(cfg.wiring.clone())?))
}

#[cfg(not(feature = "gpio"))]
fn open_sensors(cfg: &NodeConfig) -> Result<Box<dyn SensorReader>> {
    tracing::info!(scenario = %cfg.scenario, wiring = ?cfg.wiring, "using simulated sensors");
    // 10 minute day so the light rule is visible during development.
    Ok(Box::new(sim::SimSensors::new(cfg.scenario, 600.0)))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = NodeConfig::from_env()?;
    tracing::info!(
        host = %cfg.mqtt_host,
        port = cfg.mqtt_port,
        garden = %cfg.garden_id,
        client_id = %cfg.client_id,
        "garden node starting"
    );

    let controller = Controller::new(open_board(&cfg)?);
    let sensors = open_sensors(&cfg)?;

    let forwarder = if cfg.backend_url.is_empty() {
        tracing::info!("BACKEND_URL not set, http forward disabled");
        None
    } else {
        Some(HttpForwarder::new(&cfg.backend_url)?)
    };

    let settings = DeviceSettings {
        garden_id: cfg.garden_id.clone(),
        telemetry_topic: cfg.telemetry_topic.clone(),
        status_topic: cfg.status_topic.clone(),
        poll_interval: cfg.poll_interval,
        tick: cfg.tick,
    };
    let mut device = Device::new(controller, sensors, settings, forwarder);

    let mut network = BrokerProbe::new(&cfg.mqtt_host, cfg.mqtt_port);
    let mut connector = MqttConnector::new(
        &cfg.mqtt_host,
        cfg.mqtt_port,
        &cfg.client_id,
        &cfg.command_topic,
    );
    let policy = RetryPolicy::default();

    loop {
        let mut session = ensure_connected(&mut network, &mut connector, &policy).await;
        let err = device.run_session(&mut session).await;
        tracing::warn!(link = ?device.link(), "session ended: {err:#}, reconnecting");
    }
}
