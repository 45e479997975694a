//! Stateful garden sensor simulator for local development.
//!
//! Models the behaviour of the real sensor set closely enough to exercise
//! every automation rule:
//! - Temporal coherence via random walk with mean reversion
//! - Diurnal (day/night) cycle on temperature and light
//! - Per-reading electronic noise on the ADC channels
//! - Occasional DHT checksum failures

use std::fmt;

use anyhow::{bail, Result};

use crate::sensors::SensorReader;

/// 12-bit ADC ceiling shared by the gas and LDR channels.
const ADC_MAX: f64 = 4095.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Warm, bright, clean air. Nothing fires.
    Mild,
    /// Hovers around 38 °C. Drives the fan automation.
    Hot,
    /// Gas well above the CO alarm level. Drives the buzzer.
    Smoky,
    /// Light stays under the dark threshold. Drives the lamp override.
    Night,
    /// Mild conditions but a quarter of DHT reads fail.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Self::Hot,
            "smoky" => Self::Smoky,
            "night" => Self::Night,
            "flaky" => Self::Flaky,
            _ => Self::Mild,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mild => write!(f, "mild"),
            Self::Hot => write!(f, "hot"),
            Self::Smoky => write!(f, "smoky"),
            Self::Night => write!(f, "night"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

/// A mean-reverting random walk.
struct Channel {
    value: f64,
    center: f64,
    walk_sigma: f64,
    reversion: f64,
}

impl Channel {
    fn new(center: f64, walk_sigma: f64, reversion: f64) -> Self {
        Self {
            value: center,
            center,
            walk_sigma,
            reversion,
        }
    }

    fn step(&mut self) -> f64 {
        let pull = self.reversion * (self.center - self.value);
        self.value += pull + gaussian(0.0, self.walk_sigma);
        self.value
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct SimSensors {
    temperature: Channel,
    humidity: Channel,
    gas: Channel,
    light: Channel,

    temp_swing: f64,
    light_swing: f64,
    adc_noise: f64,
    dht_fail_prob: f32,
    diurnal_period_s: f64,
}

impl SimSensors {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        // (temp °C, humidity %, gas raw, light raw, light swing, dht failure rate)
        let (temp, hum, gas, light, light_swing, dht_fail) = match scenario {
            Scenario::Mild => (28.0, 65.0, 900.0, 2200.0, 600.0, 0.02_f32),
            Scenario::Hot => (38.0, 40.0, 1100.0, 3200.0, 500.0, 0.02),
            Scenario::Smoky => (30.0, 55.0, 3000.0, 1800.0, 500.0, 0.02),
            Scenario::Night => (22.0, 80.0, 800.0, 40.0, 10.0, 0.02),
            Scenario::Flaky => (28.0, 65.0, 900.0, 2200.0, 600.0, 0.25),
        };

        Self {
            temperature: Channel::new(temp, 0.2, 0.1),
            humidity: Channel::new(hum, 0.5, 0.1),
            gas: Channel::new(gas, 40.0, 0.05),
            light: Channel::new(light, light * 0.015, 0.05),
            temp_swing: 1.5,
            light_swing,
            adc_noise: 8.0,
            dht_fail_prob: dht_fail,
            diurnal_period_s,
        }
    }

    /// Sinusoidal day/night phase in [-1, 1], peaking mid-period.
    fn diurnal(&self) -> f64 {
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        (2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s).sin()
    }

    fn adc(&self, value: f64) -> u16 {
        (value + gaussian(0.0, self.adc_noise))
            .round()
            .clamp(0.0, ADC_MAX) as u16
    }
}

impl SensorReader for SimSensors {
    fn read_climate(&mut self) -> Result<(f32, f32)> {
        let t = self.temperature.step() + self.temp_swing * self.diurnal();
        let h = self.humidity.step().clamp(0.0, 100.0);
        if fastrand::f32() < self.dht_fail_prob {
            bail!("simulated DHT checksum failure");
        }
        // DHT11 resolution
        Ok((t.round() as f32, h.round() as f32))
    }

    fn read_gas(&mut self) -> Result<u16> {
        let g = self.gas.step();
        Ok(self.adc(g))
    }

    fn read_light(&mut self) -> Result<u16> {
        let l = self.light.step() + self.light_swing * self.diurnal();
        Ok(self.adc(l))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
