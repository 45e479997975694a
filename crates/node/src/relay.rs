//! Actuator outputs: four lamp relays, the fan relay and the buzzer. The
//! `gpio` feature gates the real rppal driver; without it a mock board
//! records line levels so the control loop can run (and be tested) anywhere.

use std::collections::HashMap;

#[cfg(feature = "gpio")]
use anyhow::Result;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// One addressable binary output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Lamp1,
    Lamp2,
    Lamp3,
    Lamp4,
    Fan,
    Buzzer,
}

impl Slot {
    pub const LAMPS: [Slot; 4] = [Slot::Lamp1, Slot::Lamp2, Slot::Lamp3, Slot::Lamp4];
    pub const ALL: [Slot; 6] = [
        Slot::Lamp1,
        Slot::Lamp2,
        Slot::Lamp3,
        Slot::Lamp4,
        Slot::Fan,
        Slot::Buzzer,
    ];

    /// Map a remote command target (1-4 lamps, 5 fan) to a slot.
    pub fn from_target(target: u8) -> Option<Slot> {
        match target {
            1 => Some(Slot::Lamp1),
            2 => Some(Slot::Lamp2),
            3 => Some(Slot::Lamp3),
            4 => Some(Slot::Lamp4),
            5 => Some(Slot::Fan),
            _ => None,
        }
    }

    /// Relay channels are active-low; the buzzer is driven directly.
    pub fn active_low(self) -> bool {
        !matches!(self, Slot::Buzzer)
    }
}

/// Line level (true = HIGH) that puts `slot` into the requested state.
pub fn line_level(slot: Slot, on: bool) -> bool {
    if slot.active_low() {
        !on
    } else {
        on
    }
}

/// Anything that can drive the six output slots.
pub trait Actuators {
    fn set(&mut self, slot: Slot, on: bool);
}

// ---------------------------------------------------------------------------
// Pin assignment
// ---------------------------------------------------------------------------

/// BCM pin numbers for every slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinMap {
    pub lamps: [u8; 4],
    pub fan: u8,
    pub buzzer: u8,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            lamps: [5, 6, 13, 19],
            fan: 26,
            buzzer: 21,
        }
    }
}

impl PinMap {
    pub fn pin(&self, slot: Slot) -> u8 {
        match slot {
            Slot::Lamp1 => self.lamps[0],
            Slot::Lamp2 => self.lamps[1],
            Slot::Lamp3 => self.lamps[2],
            Slot::Lamp4 => self.lamps[3],
            Slot::Fan => self.fan,
            Slot::Buzzer => self.buzzer,
        }
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct GpioRelays {
    pins: HashMap<Slot, OutputPin>,
}

#[cfg(feature = "gpio")]
impl GpioRelays {
    pub fn new(map: &PinMap) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for slot in Slot::ALL {
            let mut pin = gpio.get(map.pin(slot))?.into_output();
            if line_level(slot, false) {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.insert(slot, pin);
        }

        tracing::info!(?map, "relay board initialised");
        Ok(Self { pins })
    }
}

#[cfg(feature = "gpio")]
impl Actuators for GpioRelays {
    fn set(&mut self, slot: Slot, on: bool) {
        if let Some(pin) = self.pins.get_mut(&slot) {
            if line_level(slot, on) {
                pin.set_high();
            } else {
                pin.set_low();
            }
            tracing::debug!(?slot, on, "output set");
        }
    }
}

// ---------------------------------------------------------------------------
// Mock board (development and tests; no hardware)
// ---------------------------------------------------------------------------

#[cfg_attr(feature = "gpio", allow(dead_code))]
pub struct MockRelays {
    levels: HashMap<Slot, bool>,
}

#[cfg_attr(feature = "gpio", allow(dead_code))]
impl MockRelays {
    pub fn new(map: &PinMap) -> Self {
        let mut levels = HashMap::new();
        for slot in Slot::ALL {
            tracing::info!(?slot, pin = map.pin(slot), "[mock-gpio] registered (not wired)");
            levels.insert(slot, line_level(slot, false));
        }
        Self { levels }
    }

    /// Current line level of `slot` (true = HIGH).
    #[cfg(test)]
    pub fn level(&self, slot: Slot) -> bool {
        self.levels.get(&slot).copied().unwrap_or(false)
    }

    #[cfg(test)]
    pub fn is_energized(&self, slot: Slot) -> bool {
        self.level(slot) == line_level(slot, true)
    }
}

impl Actuators for MockRelays {
    fn set(&mut self, slot: Slot, on: bool) {
        self.levels.insert(slot, line_level(slot, on));
        tracing::debug!(?slot, on, "[mock-gpio] output set");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
