//! Sensor capability
//!
//! Position and battery are read through [`SensorSource`]. The node ships a
//! simulated source that draws uniformly from configured ranges.

use anyhow::Result;
use rand::Rng;

use crate::config::SensorConfig;

/// Something that can report position and battery level
pub trait SensorSource: Send + Sync {
    /// Latitude and longitude in degrees
    fn location(&self) -> Result<(f64, f64)>;

    /// Battery level in percent
    fn battery(&self) -> Result<u8>;
}

/// Random readings inside the configured ranges
pub struct SimulatedSensor {
    config: SensorConfig,
}

impl SimulatedSensor {
    pub fn new(config: SensorConfig) -> Self {
        Self { config }
    }
}

impl SensorSource for SimulatedSensor {
    fn location(&self) -> Result<(f64, f64)> {
        let mut rng = rand::thread_rng();
        let [lat_min, lat_max] = self.config.latitude;
        let [lon_min, lon_max] = self.config.longitude;
        Ok((rng.gen_range(lat_min..lat_max), rng.gen_range(lon_min..lon_max)))
    }

    fn battery(&self) -> Result<u8> {
        let [min, max] = self.config.battery;
        Ok(rand::thread_rng().gen_range(min..max))
    }
}
