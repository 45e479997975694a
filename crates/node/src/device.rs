//! The device tick loop: serve commands as they arrive, run an automation
//! cycle whenever the poll interval has elapsed, publish what changed.

use std::convert::Infallible;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;

use crate::bus::{CommandBus, Inbound};
use crate::control::{parse_command, Controller};
use crate::relay::Actuators;
use crate::sensors::SensorReader;
use crate::telemetry::{HttpForwarder, TelemetryPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    /// Connected and waiting for the next command or poll.
    ConnectedIdle,
    /// Connected and handling a command or running a cycle.
    ConnectedActive,
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub garden_id: String,
    pub telemetry_topic: String,
    pub status_topic: String,
    pub poll_interval: Duration,
    pub tick: Duration,
}

pub struct Device<A, S> {
    controller: Controller<A>,
    sensors: S,
    settings: DeviceSettings,
    forwarder: Option<HttpForwarder>,
    link: LinkState,
    next_poll: Instant,
}

impl<A: Actuators, S: SensorReader> Device<A, S> {
    pub fn new(
        controller: Controller<A>,
        sensors: S,
        settings: DeviceSettings,
        forwarder: Option<HttpForwarder>,
    ) -> Self {
        let next_poll = Instant::now() + settings.poll_interval;
        Self {
            controller,
            sensors,
            settings,
            forwarder,
            link: LinkState::Disconnected,
            next_poll,
        }
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    #[cfg(test)]
    pub fn controller(&self) -> &Controller<A> {
        &self.controller
    }

    /// Drive the device over one live session until the session fails.
    /// Actuator state and fan mode carry over to the next session.
    pub async fn run_session<B: CommandBus>(&mut self, bus: &mut B) -> anyhow::Error {
        self.link = LinkState::ConnectedIdle;
        let err = match self.serve(bus).await {
            Ok(never) => match never {},
            Err(e) => e,
        };
        self.link = LinkState::Disconnected;
        err
    }

    async fn serve<B: CommandBus>(&mut self, bus: &mut B) -> Result<Infallible> {
        loop {
            let tick_end = Instant::now() + self.settings.tick;
            // A backlog of ready messages can outlast the deadline, so the
            // tick also ends once it has run over.
            while let Some(msg) = bus.next_command(tick_end).await? {
                self.link = LinkState::ConnectedActive;
                self.handle_command(bus, &msg).await?;
                self.link = LinkState::ConnectedIdle;
                if Instant::now() >= tick_end {
                    break;
                }
            }

            if Instant::now() >= self.next_poll {
                self.link = LinkState::ConnectedActive;
                self.poll_cycle(bus).await?;
                self.next_poll = Instant::now() + self.settings.poll_interval;
                self.link = LinkState::ConnectedIdle;
            }
        }
    }

    async fn handle_command<B: CommandBus>(&mut self, bus: &mut B, msg: &Inbound) -> Result<()> {
        let cmd = match parse_command(&msg.topic, &msg.payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(topic = %msg.topic, "dropping command: {e}");
                return Ok(());
            }
        };
        tracing::debug!(?cmd, "command received");

        if let Some(echo) = self.controller.apply(cmd) {
            let body = serde_json::to_vec(&echo).context("failed to encode status")?;
            bus.publish(&self.settings.status_topic, body).await?;
        }
        Ok(())
    }

    async fn poll_cycle<B: CommandBus>(&mut self, bus: &mut B) -> Result<()> {
        let sample = self.sensors.sample();
        let report = self.controller.run_cycle(&sample);

        if let Some(gas) = &report.gas {
            tracing::debug!(co = gas.co, co2 = gas.co2, nh4 = gas.nh4, "gas levels");
        }
        if let Some(snapshot) = report.snapshot {
            let body = serde_json::to_vec(&snapshot).context("failed to encode snapshot")?;
            bus.publish(&self.settings.status_topic, body).await?;
        }

        let Some(payload) =
            TelemetryPayload::build(&self.settings.garden_id, &sample, report.gas.as_ref())
        else {
            tracing::debug!("no temperature this cycle, telemetry skipped");
            return Ok(());
        };
        let body = serde_json::to_vec(&payload).context("failed to encode telemetry")?;

        if let Some(fwd) = &self.forwarder {
            fwd.forward(body.clone());
        }
        bus.publish(&self.settings.telemetry_topic, body).await?;
        tracing::info!(
            garden = %payload.id_kebun,
            temperature = payload.suhu,
            "telemetry published"
        );
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
