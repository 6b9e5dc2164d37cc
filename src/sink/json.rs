//! JSON output formatter, one object per line.

use crate::measurement::Measurement;
use crate::sink::{OutputFormatter, SinkError, dew_point_of};
use serde::Serialize;
use std::time::SystemTime;

#[derive(Debug, Serialize)]
struct Record<'a> {
    mac: &'a str,
    name: &'a str,
    temperature: f64,
    humidity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dew_point: Option<f64>,
    pressure: f64,
    battery_voltage: u16,
    acceleration_x: i16,
    acceleration_y: i16,
    acceleration_z: i16,
    /// Milliseconds since the Unix epoch
    timestamp: u64,
}

/// Formats measurements as compact JSON. Battery voltage stays in mV.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

impl OutputFormatter for JsonFormatter {
    fn format(&self, m: &Measurement) -> Result<String, SinkError> {
        let (acceleration_x, acceleration_y, acceleration_z) = m.acceleration;
        let timestamp = m
            .timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|e| SinkError::Encode(format!("timestamp before epoch: {e}")))?
            .as_millis();
        let timestamp = u64::try_from(timestamp).unwrap_or(u64::MAX);
        let record = Record {
            mac: m.address.as_str(),
            name: &m.name,
            temperature: m.temperature,
            humidity: m.humidity,
            dew_point: dew_point_of(m),
            pressure: m.pressure,
            battery_voltage: m.battery,
            acceleration_x,
            acceleration_y,
            acceleration_z,
            timestamp,
        };
        serde_json::to_string(&record).map_err(|e| SinkError::Encode(e.to_string()))
    }
}
