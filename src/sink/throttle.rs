//! Per-sensor throttling of exports.
//!
//! RuuviTags broadcast about once a second. [`Throttled`] wraps a sink so
//! that each sensor reaches it at most once per interval, which keeps
//! continuous mode from flooding slow-moving data into the sink.

use crate::address::PeripheralAddress;
use crate::cancel::CancelToken;
use crate::measurement::Measurement;
use crate::sink::{Sink, SinkError};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A throttle that limits the rate of events per device.
///
/// Each device is tracked independently, allowing at most one event per `interval`
/// duration. The first event for a device is always allowed.
#[derive(Debug)]
pub struct Throttle {
    /// Minimum time between events for each device
    interval: Duration,
    /// Last event time for each address
    last_seen: HashMap<PeripheralAddress, Instant>,
}

impl Throttle {
    /// Create a new throttle with the specified minimum interval between events.
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use ruuvitag_collector::sink::throttle::Throttle;
    ///
    /// let throttle = Throttle::new(Duration::from_secs(3));
    /// ```
    pub fn new(interval: Duration) -> Self {
        Throttle {
            interval,
            last_seen: HashMap::new(),
        }
    }

    /// Check if an event from the given address should be allowed.
    ///
    /// Returns `true` if enough time has passed since the last event from this
    /// device (or if this is the first event). If `true` is returned, the
    /// internal timer for this device is reset.
    pub fn should_emit(&mut self, address: &PeripheralAddress) -> bool {
        self.should_emit_at(address, Instant::now())
    }

    fn should_emit_at(&mut self, address: &PeripheralAddress, now: Instant) -> bool {
        match self.last_seen.get(address) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                self.last_seen.insert(address.clone(), now);
                true
            }
        }
    }
}

/// Sink decorator that drops measurements arriving faster than the
/// throttle interval for the same sensor. Dropped measurements count as
/// successfully exported.
pub struct Throttled<S> {
    inner: S,
    throttle: Mutex<Throttle>,
}

impl<S: Sink> Throttled<S> {
    pub fn new(inner: S, interval: Duration) -> Self {
        Self {
            inner,
            throttle: Mutex::new(Throttle::new(interval)),
        }
    }
}

impl<S: Sink> Sink for Throttled<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn export<'a>(
        &'a self,
        measurement: &'a Measurement,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        let emit = self
            .throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_emit(&measurement.address);
        if emit {
            self.inner.export(measurement, cancel)
        } else {
            Box::pin(async { Ok(()) })
        }
    }

    fn close(&self) -> BoxFuture<'_, Result<(), SinkError>> {
        self.inner.close()
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use ruuvitag_collector::sink::throttle::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let parse = |num: &str, unit: &str| -> Result<u64, String> {
        num.trim()
            .parse()
            .map_err(|_| format!("invalid {}: {}", unit, num))
    };
    let scaled = |num: &str, unit: &str, factor: u64| -> Result<Duration, String> {
        parse(num, unit)?
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("{} out of range: {}", unit, num.trim()))
    };

    if let Some(num) = src.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse(num, "milliseconds")?));
    }

    if let Some(num) = src.strip_suffix('h') {
        return scaled(num, "hours", 3600);
    }

    if let Some(num) = src.strip_suffix('m') {
        return scaled(num, "minutes", 60);
    }

    if let Some(num) = src.strip_suffix('s') {
        return Ok(Duration::from_secs(parse(num, "seconds")?));
    }

    // No suffix, treat as seconds
    let secs: u64 = src
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;
    Ok(Duration::from_secs(secs))
}
