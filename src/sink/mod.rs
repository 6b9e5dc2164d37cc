//! Measurement sinks.
//!
//! A [`Sink`] is anything that accepts decoded measurements: the console,
//! a time-series database, a message queue. The orchestrator only sees this
//! trait and never branches on the concrete sink.

pub mod console;
pub mod influxdb;
pub mod json;
pub mod throttle;

use crate::cancel::{CancelToken, Interrupt};
use crate::measurement::Measurement;
use futures::future::BoxFuture;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by a single sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The export deadline passed before the sink finished
    #[error("export timed out")]
    Timeout,
    /// The export was canceled
    #[error("export canceled")]
    Canceled,
    /// The measurement could not be encoded
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Any other sink-specific failure
    #[error("{0}")]
    Other(String),
}

impl From<Interrupt> for SinkError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Canceled => SinkError::Canceled,
            Interrupt::DeadlineExceeded => SinkError::Timeout,
        }
    }
}

/// A sink failure together with the name of the sink that failed.
#[derive(Error, Debug)]
#[error("sink '{sink}' failed: {source}")]
pub struct ExportError {
    pub sink: String,
    #[source]
    pub source: SinkError,
}

/// Destination for decoded measurements.
///
/// `export` may be retried by callers, so implementations must tolerate
/// receiving the same measurement twice. It must return
/// [`SinkError::Timeout`] rather than block past the token's deadline.
pub trait Sink: Send + Sync {
    /// Display name used in logs.
    fn name(&self) -> &str;

    fn export<'a>(
        &'a self,
        measurement: &'a Measurement,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<(), SinkError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), SinkError>>;
}

impl<T: Sink + ?Sized> Sink for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn export<'a>(
        &'a self,
        measurement: &'a Measurement,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        (**self).export(measurement, cancel)
    }

    fn close(&self) -> BoxFuture<'_, Result<(), SinkError>> {
        (**self).close()
    }
}

/// Trait for formatting measurements into output lines.
pub trait OutputFormatter: Send + Sync {
    /// Format a measurement (timestamp included) as a single line without
    /// the trailing newline.
    fn format(&self, measurement: &Measurement) -> Result<String, SinkError>;
}

const MAGNUS_B: f64 = 17.62;
const MAGNUS_C: f64 = 243.12;

/// Dew point in Celsius from temperature (C) and relative humidity (%),
/// using the Magnus approximation.
///
/// Returns `None` when humidity is zero or out of range.
pub fn dew_point(temperature: f64, humidity: f64) -> Option<f64> {
    if !(humidity > 0.0 && humidity <= 100.0) {
        return None;
    }
    let gamma = (humidity / 100.0).ln() + MAGNUS_B * temperature / (MAGNUS_C + temperature);
    Some(MAGNUS_C * gamma / (MAGNUS_B - gamma))
}

/// The measurement's own dew point, or one derived from its temperature
/// and humidity.
pub fn dew_point_of(measurement: &Measurement) -> Option<f64> {
    measurement
        .dew_point
        .or_else(|| dew_point(measurement.temperature, measurement.humidity))
}
