//! RuuviTag measurement data structure.

use crate::address::PeripheralAddress;
use crate::decoder::Reading;
use std::time::SystemTime;

/// A measurement from a RuuviTag sensor.
///
/// Units:
/// - Temperature in Celsius
/// - Humidity in percent (0-100)
/// - Pressure in hectopascals
/// - Battery voltage in millivolts
/// - Acceleration in raw signed sensor units, exactly as broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Address of the sensor that sent the frame
    pub address: PeripheralAddress,
    /// Name from the peripheral registry, empty when the sensor is not registered
    pub name: String,
    /// Time the frame was decoded
    pub timestamp: SystemTime,
    /// Temperature in Celsius
    pub temperature: f64,
    /// Relative humidity in percent (0-100)
    pub humidity: f64,
    /// Barometric pressure in hPa
    pub pressure: f64,
    /// Battery voltage in mV
    pub battery: u16,
    /// Dew point in Celsius. Never filled in by the scanner; sinks derive it
    /// with [`crate::sink::dew_point`] when they need it.
    pub dew_point: Option<f64>,
    /// Acceleration (x, y, z), raw
    pub acceleration: (i16, i16, i16),
}

impl Measurement {
    /// Attach the source, name and capture time to a decoded reading.
    pub fn new(
        address: PeripheralAddress,
        name: impl Into<String>,
        reading: Reading,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            address,
            name: name.into(),
            timestamp,
            temperature: reading.temperature,
            humidity: reading.humidity,
            pressure: reading.pressure,
            battery: reading.battery,
            dew_point: None,
            acceleration: reading.acceleration,
        }
    }

    /// The registry name, or the address when the sensor has no name.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.address.as_str()
        } else {
            &self.name
        }
    }
}
