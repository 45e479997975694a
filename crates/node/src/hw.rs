//! Raspberry Pi sensor drivers.
//!
//! - MQ-135 gas and LDR light through an ADS1115 16-bit ADC over I2C,
//!   scaled down to the 12-bit range the automation thresholds assume.
//! - BH1750 digital lux sensor over I2C, as an alternative light transport.
//! - DHT11 through the kernel `dht11` IIO driver (`dtoverlay=dht11`), read
//!   from sysfs in milli-units.
//!
//! Register maths and sysfs parsing are plain functions so they build and
//! test without the `gpio` feature.

use anyhow::{Context, Result};
use std::path::Path;

#[cfg(feature = "gpio")]
use rppal::i2c::I2c;
#[cfg(feature = "gpio")]
use std::{path::PathBuf, thread, time::Duration};

#[cfg(feature = "gpio")]
use crate::sensors::SensorReader;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS      : write 1 to start single-shot conversion
//   [14:12] MUX     : input multiplexer (channel selection)
//   [11:9]  PGA     : programmable gain amplifier
//   [8]     MODE    : 0 = continuous, 1 = single-shot
//   [7:5]   DR      : data rate
//   [4:0]   comparator, disabled

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
/// DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

pub const MAX_CHANNEL: u8 = 3;

#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
const OS_READY_BIT: u16 = 1 << 15;

/// Config register value for a single-ended read on `channel`.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel as usize] << MUX_SHIFT)
}

/// Map a single-ended ADS1115 result (0..=32767) onto 0..=4095.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
fn to_twelve_bit(raw: i16) -> u16 {
    (raw.max(0) as u16) >> 3
}

// ── BH1750 ──────────────────────────────────────────────────────────────────

/// One-time high-resolution mode: 1 lx resolution, ~120 ms measurement.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
const BH1750_ONE_TIME_HIGH_RES: u8 = 0x20;

/// Convert the BH1750 big-endian count into lux (count / 1.2).
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
fn bh1750_lux(buf: [u8; 2]) -> u16 {
    let count = u16::from_be_bytes(buf) as f64;
    (count / 1.2).round() as u16
}

/// Which light transport is fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightSource {
    /// Light-dependent resistor on an ADS1115 channel.
    Ldr,
    /// BH1750 digital lux sensor.
    Bh1750,
}

impl LightSource {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "bh1750" | "lux" => Self::Bh1750,
            _ => Self::Ldr,
        }
    }
}

// ── DHT11 via IIO sysfs ─────────────────────────────────────────────────────

pub const DEFAULT_IIO_DIR: &str = "/sys/bus/iio/devices/iio:device0";

/// Parse a sysfs milli-unit value ("23000\n" → 23.0).
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
fn parse_milli(s: &str) -> Result<f32> {
    let v: i64 = s
        .trim()
        .parse()
        .with_context(|| format!("invalid iio value {s:?}"))?;
    Ok(v as f32 / 1000.0)
}

/// Read temperature (°C) and humidity (%RH) from the DHT11 IIO device.
/// The driver returns EIO on checksum errors, which surfaces as `Err`.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
pub fn read_iio_climate(dir: &Path) -> Result<(f32, f32)> {
    let temp_path = dir.join("in_temp_input");
    let hum_path = dir.join("in_humidityrelative_input");
    let t = std::fs::read_to_string(&temp_path)
        .with_context(|| format!("failed to read {}", temp_path.display()))?;
    let h = std::fs::read_to_string(&hum_path)
        .with_context(|| format!("failed to read {}", hum_path.display()))?;
    Ok((parse_milli(&t)?, parse_milli(&h)?))
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Where each sensor is wired.
#[derive(Debug, Clone)]
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
pub struct PiWiring {
    pub ads1115_addr: u16,
    pub gas_channel: u8,
    pub ldr_channel: u8,
    pub light: LightSource,
    pub bh1750_addr: u16,
    pub iio_dir: String,
}

impl Default for PiWiring {
    fn default() -> Self {
        Self {
            ads1115_addr: 0x48,
            gas_channel: 0,
            ldr_channel: 1,
            light: LightSource::Ldr,
            bh1750_addr: 0x23,
            iio_dir: DEFAULT_IIO_DIR.to_string(),
        }
    }
}

#[cfg(feature = "gpio")]
pub struct PiSensors {
    i2c: I2c,
    wiring: PiWiring,
    iio_dir: PathBuf,
}

#[cfg(feature = "gpio")]
impl PiSensors {
    pub fn new(wiring: PiWiring) -> Result<Self> {
        anyhow::ensure!(
            wiring.gas_channel <= MAX_CHANNEL && wiring.ldr_channel <= MAX_CHANNEL,
            "ADS1115 channel out of range (0–{MAX_CHANNEL})"
        );
        let i2c = I2c::new()?;
        tracing::info!(?wiring, "pi sensors initialised");
        Ok(Self {
            i2c,
            iio_dir: PathBuf::from(&wiring.iio_dir),
            wiring,
        })
    }

    fn read_ads_channel(&mut self, channel: u8) -> Result<u16> {
        self.i2c.set_slave_address(self.wiring.ads1115_addr)?;
        self.i2c
            .block_write(REG_CONFIG, &config_for_channel(channel).to_be_bytes())?;

        // ~7.8 ms at 128 SPS
        thread::sleep(Duration::from_millis(9));
        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(to_twelve_bit(i16::from_be_bytes(buf)))
    }

    fn read_bh1750(&mut self) -> Result<u16> {
        self.i2c.set_slave_address(self.wiring.bh1750_addr)?;
        self.i2c.write(&[BH1750_ONE_TIME_HIGH_RES])?;
        thread::sleep(Duration::from_millis(180));
        let mut buf = [0u8; 2];
        self.i2c.read(&mut buf)?;
        Ok(bh1750_lux(buf))
    }
}

#[cfg(feature = "gpio")]
impl SensorReader for PiSensors {
    fn read_climate(&mut self) -> Result<(f32, f32)> {
        read_iio_climate(&self.iio_dir)
    }

    fn read_gas(&mut self) -> Result<u16> {
        self.read_ads_channel(self.wiring.gas_channel)
            .context("gas channel read failed")
    }

    fn read_light(&mut self) -> Result<u16> {
        match self.wiring.light {
            LightSource::Ldr => self
                .read_ads_channel(self.wiring.ldr_channel)
                .context("ldr channel read failed"),
            LightSource::Bh1750 => self.read_bh1750().context("bh1750 read failed"),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- ADS1115 config register ----------------------------------------------

    #[test]
    fn config_register_channels() {
        assert_eq!(config_for_channel(0), 0xC383);
        assert_eq!(config_for_channel(1), 0xD383);
        assert_eq!(config_for_channel(2), 0xE383);
        assert_eq!(config_for_channel(3), 0xF383);
    }

    #[test]
    fn config_base_fields() {
        assert_eq!((CONFIG_BASE >> 15) & 1, 1, "OS starts conversion");
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA ±4.096 V");
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "single-shot");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100, "128 SPS");
    }

    // -- Scaling --------------------------------------------------------------

    #[test]
    fn twelve_bit_scaling_covers_full_range() {
        assert_eq!(to_twelve_bit(0), 0);
        assert_eq!(to_twelve_bit(32767), 4095);
        assert_eq!(to_twelve_bit(16384), 2048);
    }

    #[test]
    fn negative_conversion_clamps_to_zero() {
        assert_eq!(to_twelve_bit(-12), 0);
    }

    #[test]
    fn bh1750_count_to_lux() {
        assert_eq!(bh1750_lux([0x00, 0x00]), 0);
        assert_eq!(bh1750_lux([0x00, 0x78]), 100); // 120 / 1.2
        assert_eq!(bh1750_lux([0x01, 0x2C]), 250); // 300 / 1.2
    }

    #[test]
    fn light_source_from_str() {
        assert_eq!(LightSource::from_str_lossy("bh1750"), LightSource::Bh1750);
        assert_eq!(LightSource::from_str_lossy("LUX"), LightSource::Bh1750);
        assert_eq!(LightSource::from_str_lossy("ldr"), LightSource::Ldr);
        assert_eq!(LightSource::from_str_lossy(""), LightSource::Ldr);
    }

    // -- IIO -----------------------------------------------------------------

    #[test]
    fn parse_milli_values() {
        assert_eq!(parse_milli("23000\n").unwrap(), 23.0);
        assert_eq!(parse_milli("-1500").unwrap(), -1.5);
        assert!(parse_milli("oops").is_err());
    }

    #[test]
    fn read_iio_climate_from_sysfs_files() {
        let dir = std::env::temp_dir().join(format!("garden-iio-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("in_temp_input"), "31000\n").unwrap();
        std::fs::write(dir.join("in_humidityrelative_input"), "58000\n").unwrap();

        let (t, h) = read_iio_climate(&dir).unwrap();
        assert_eq!(t, 31.0);
        assert_eq!(h, 58.0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn read_iio_climate_missing_device_errors() {
        let dir = std::env::temp_dir().join("garden-iio-does-not-exist");
        assert!(read_iio_climate(&dir).is_err());
    }
}
