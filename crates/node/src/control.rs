//! Actuation state machine: arbitrates between remote commands and the
//! automatic rules driven by each sensor poll.
//!
//! ```text
//! command ──▶ apply() ──▶ slot write + single-slot status echo
//! poll    ──▶ run_cycle() ──▶ buzzer (gas) · lamps (light) · fan (temp, AUTO only)
//! ```
//!
//! The dark-room rule only ever switches lamps ON. Turning them back off is
//! left to remote commands.

use serde::{Deserialize, Serialize};

use crate::relay::{Actuators, Slot};
use crate::sensors::SensorSample;

/// Full-scale value of the 12-bit gas ADC.
const GAS_FULL_SCALE: f64 = 4095.0;
const CO_SPAN: f64 = 1000.0;
const CO2_SPAN: f64 = 800.0;
const NH4_SPAN: f64 = 500.0;

/// CO-proxy level above which the buzzer sounds.
const CO_ALARM: f64 = 600.0;

/// Light readings below this force every lamp on.
const DARK_BELOW: u16 = 100;

/// Fan runs above this temperature while in AUTO.
const FAN_ON_ABOVE_C: f32 = 35.0;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FanMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActuatorState {
    pub lamps: [bool; 4],
    pub fan: bool,
    pub buzzer: bool,
}

impl ActuatorState {
    fn set(&mut self, slot: Slot, on: bool) {
        match slot {
            Slot::Lamp1 => self.lamps[0] = on,
            Slot::Lamp2 => self.lamps[1] = on,
            Slot::Lamp3 => self.lamps[2] = on,
            Slot::Lamp4 => self.lamps[3] = on,
            Slot::Fan => self.fan = on,
            Slot::Buzzer => self.buzzer = on,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            lamp1: self.lamps[0].into(),
            lamp2: self.lamps[1].into(),
            lamp3: self.lamps[2].into(),
            lamp4: self.lamps[3].into(),
            fan: self.fan.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status events (published on the status topic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OnOff {
    On,
    Off,
}

impl From<bool> for OnOff {
    fn from(on: bool) -> Self {
        if on {
            OnOff::On
        } else {
            OnOff::Off
        }
    }
}

/// `{"lamp": 3, "status": "ON"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub lamp: u8,
    pub status: OnOff,
}

/// `{"lamp1": "ON", ..., "fan": "OFF"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub lamp1: OnOff,
    pub lamp2: OnOff,
    pub lamp3: OnOff,
    pub lamp4: OnOff,
    pub fan: OnOff,
}

// ---------------------------------------------------------------------------
// Gas scaling
// ---------------------------------------------------------------------------

/// ppm-like proxies derived from the raw MQ-135 reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasLevels {
    pub co: f64,
    pub co2: f64,
    pub nh4: f64,
}

impl GasLevels {
    pub fn from_raw(raw: u16) -> Self {
        let frac = raw as f64 / GAS_FULL_SCALE;
        Self {
            co: round2(frac * CO_SPAN),
            co2: round2(frac * CO2_SPAN),
            nh4: round2(frac * NH4_SPAN),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn buzzer_should_sound(co: f64) -> bool {
    co > CO_ALARM
}

// ---------------------------------------------------------------------------
// Remote commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Switch lamp 1-4 or the fan (target 5).
    Status { target: u8, on: bool },
    /// Fan arbitration mode (target 5 only).
    Mode(FanMode),
}

#[derive(Debug, Deserialize)]
struct CommandMsg {
    lamp: Option<serde_json::Value>,
    status: Option<String>,
    mode: Option<String>,
}

/// Parse a command payload. The target comes from the `lamp` field, or from
/// the last topic segment (`iot/lamp/cmd/3`) when the payload omits it.
pub fn parse_command(topic: &str, payload: &[u8]) -> Result<RemoteCommand, String> {
    let msg: CommandMsg =
        serde_json::from_slice(payload).map_err(|e| format!("bad command json: {e}"))?;

    let target = match &msg.lamp {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
        None => topic.rsplit('/').next().and_then(|s| s.parse().ok()),
    }
    .ok_or_else(|| format!("command has no usable target (topic={topic})"))?;

    if !(1..=5).contains(&target) {
        return Err(format!("command target {target} out of range 1-5"));
    }
    let target = target as u8;

    if let Some(mode) = msg.mode.as_deref() {
        if target != 5 {
            return Err(format!("mode command only applies to the fan, got target {target}"));
        }
        return match mode.trim().to_uppercase().as_str() {
            "AUTO" => Ok(RemoteCommand::Mode(FanMode::Auto)),
            "MANUAL" => Ok(RemoteCommand::Mode(FanMode::Manual)),
            other => Err(format!("unknown fan mode '{other}'")),
        };
    }

    let status = msg
        .status
        .ok_or_else(|| format!("command for target {target} has neither status nor mode"))?;
    match status.trim().to_uppercase().as_str() {
        "ON" => Ok(RemoteCommand::Status { target, on: true }),
        "OFF" => Ok(RemoteCommand::Status { target, on: false }),
        other => Err(format!("unknown status '{other}' (use ON/OFF)")),
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// What one automation pass decided.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleReport {
    pub gas: Option<GasLevels>,
    /// Set when the dark-room rule fired; publish it as a full snapshot.
    pub snapshot: Option<StatusSnapshot>,
}

pub struct Controller<A> {
    actuators: A,
    state: ActuatorState,
    fan_mode: FanMode,
}

impl<A: Actuators> Controller<A> {
    /// Take ownership of the outputs and drive every slot OFF.
    pub fn new(mut actuators: A) -> Self {
        for slot in Slot::ALL {
            actuators.set(slot, false);
        }
        Self {
            actuators,
            state: ActuatorState::default(),
            fan_mode: FanMode::Auto,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &ActuatorState {
        &self.state
    }

    #[cfg(test)]
    pub fn fan_mode(&self) -> FanMode {
        self.fan_mode
    }

    #[cfg(test)]
    pub fn actuators(&self) -> &A {
        &self.actuators
    }

    fn drive(&mut self, slot: Slot, on: bool) {
        self.actuators.set(slot, on);
        self.state.set(slot, on);
    }

    /// Apply a remote command. Returns the status echo to publish, if any.
    pub fn apply(&mut self, cmd: RemoteCommand) -> Option<SlotStatus> {
        match cmd {
            RemoteCommand::Mode(mode) => {
                self.fan_mode = mode;
                tracing::info!(?mode, "fan mode set");
                None
            }
            RemoteCommand::Status { target, on } => {
                let slot = match Slot::from_target(target) {
                    Some(slot) => slot,
                    None => {
                        tracing::warn!(target, "ignoring command for unknown target");
                        return None;
                    }
                };
                if slot == Slot::Fan && self.fan_mode == FanMode::Auto {
                    tracing::info!(on, "manual fan command ignored (fan in AUTO)");
                    return None;
                }
                self.drive(slot, on);
                tracing::info!(?slot, on, "output switched by command");
                Some(SlotStatus {
                    lamp: target,
                    status: on.into(),
                })
            }
        }
    }

    /// Run the buzzer, light and fan rules against one sensor sample.
    pub fn run_cycle(&mut self, sample: &SensorSample) -> CycleReport {
        let mut report = CycleReport::default();

        if let Some(raw) = sample.gas_raw {
            let gas = GasLevels::from_raw(raw);
            let alarm = buzzer_should_sound(gas.co);
            if alarm {
                tracing::warn!(co = gas.co, "gas level high, buzzer on");
            }
            self.drive(Slot::Buzzer, alarm);
            report.gas = Some(gas);
        }

        if let Some(light) = sample.light_raw {
            if light < DARK_BELOW {
                tracing::info!(light, "dark, forcing all lamps on");
                for slot in Slot::LAMPS {
                    self.drive(slot, true);
                }
                report.snapshot = Some(self.state.snapshot());
            }
        }

        if self.fan_mode == FanMode::Auto {
            if let Some(t) = sample.temperature {
                let on = t > FAN_ON_ABOVE_C;
                if on != self.state.fan {
                    tracing::info!(temperature = t, on, "fan switched by automation");
                }
                self.drive(Slot::Fan, on);
            }
        }

        report
    }
}

// ===========================================================================
// Tests
// ===========================================================================
