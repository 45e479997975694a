use anyhow::Result;

/// One poll's worth of readings. A field is `None` when that sensor failed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorSample {
    /// °C
    pub temperature: Option<f32>,
    /// %RH
    pub humidity: Option<f32>,
    /// 12-bit raw MQ-135 reading (0..=4095).
    pub gas_raw: Option<u16>,
    /// Raw LDR reading or BH1750 lux, whichever transport is fitted.
    pub light_raw: Option<u16>,
}

/// Source of environmental readings.
pub trait SensorReader {
    /// Temperature (°C) and relative humidity (%) from the DHT sensor.
    fn read_climate(&mut self) -> Result<(f32, f32)>;
    fn read_gas(&mut self) -> Result<u16>;
    fn read_light(&mut self) -> Result<u16>;

    /// Read every sensor once. A failing sensor only blanks its own fields.
    fn sample(&mut self) -> SensorSample {
        let mut sample = SensorSample::default();

        match self.read_climate() {
            Ok((t, h)) => {
                sample.temperature = Some(t);
                sample.humidity = Some(h);
            }
            Err(e) => tracing::warn!("climate read failed: {e:#}"),
        }
        match self.read_gas() {
            Ok(raw) => sample.gas_raw = Some(raw),
            Err(e) => tracing::warn!("gas read failed: {e:#}"),
        }
        match self.read_light() {
            Ok(raw) => sample.light_raw = Some(raw),
            Err(e) => tracing::warn!("light read failed: {e:#}"),
        }

        tracing::debug!(?sample, "sensors sampled");
        sample
    }
}

impl<S: SensorReader + ?Sized> SensorReader for Box<S> {
    fn read_climate(&mut self) -> Result<(f32, f32)> {
        (**self).read_climate()
    }

    fn read_gas(&mut self) -> Result<u16> {
        (**self).read_gas()
    }

    fn read_light(&mut self) -> Result<u16> {
        (**self).read_light()
    }
}
