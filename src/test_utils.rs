use crate::address::PeripheralAddress;
use crate::cancel::CancelToken;
use crate::measurement::Measurement;
use crate::scanner::{Advertisement, AdvertisementHandler, ScanError, ScanHandle};
use crate::sink::{Sink, SinkError};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// A stable address for unit tests.
pub const TEST_ADDRESS: &str = "aa:bb:cc:dd:ee:ff";

/// Build a `Measurement` with plausible indoor values.
///
/// Tests can override just the fields they care about.
pub fn base_measurement(address: &str, timestamp: SystemTime) -> Measurement {
    Measurement {
        address: PeripheralAddress::new(address),
        name: "Test".to_string(),
        timestamp,
        temperature: 20.0,
        humidity: 50.0,
        pressure: 1000.0,
        battery: 3000,
        dew_point: None,
        acceleration: (0, 0, 0),
    }
}

/// Encode a RAWv1 frame, manufacturer id included.
pub fn rawv1_frame(
    humidity: u8,
    temperature_integer: u8,
    temperature_fraction: u8,
    pressure: u16,
    (x, y, z): (i16, i16, i16),
    battery: u16,
) -> [u8; 16] {
    let mut frame = [0u8; 16];
    frame[0] = 0x99;
    frame[1] = 0x04;
    frame[2] = 0x03;
    frame[3] = humidity;
    frame[4] = temperature_integer;
    frame[5] = temperature_fraction;
    frame[6..8].copy_from_slice(&pressure.to_be_bytes());
    frame[8..10].copy_from_slice(&x.to_be_bytes());
    frame[10..12].copy_from_slice(&y.to_be_bytes());
    frame[12..14].copy_from_slice(&z.to_be_bytes());
    frame[14..16].copy_from_slice(&battery.to_be_bytes());
    frame
}

/// A valid RuuviTag advertisement from `address`: 22.1 C, 45 %, 1002 hPa.
pub fn ruuvi_advertisement(address: &str) -> Advertisement {
    Advertisement::new(address, rawv1_frame(90, 22, 10, 50_200, (0, 0, 1000), 2755))
}

/// What one call to [`ScriptedScanner::scan`] does.
#[derive(Debug, Clone)]
pub enum ScanStep {
    /// Offer the advertisements, then keep scanning until interrupted
    Emit(Vec<Advertisement>),
    /// Offer the advertisements, then end the scan with `Ok`
    EmitAndEnd(Vec<Advertisement>),
    /// Fail immediately
    Fail(ScanError),
}

/// Scan handle replaying one [`ScanStep`] per scan. Once the script runs
/// out, scans wait for their token.
#[derive(Debug, Clone, Default)]
pub struct ScriptedScanner {
    steps: Arc<Mutex<VecDeque<ScanStep>>>,
    scans: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<Instant>>>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedScanner {
    pub fn new(steps: impl IntoIterator<Item = ScanStep>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into_iter().collect())),
            ..Self::default()
        }
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// When each scan started.
    pub fn scan_starts(&self) -> Vec<Instant> {
        self.started.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

async fn offer(
    cancel: &CancelToken,
    handler: &dyn AdvertisementHandler,
    advertisements: Vec<Advertisement>,
) -> Result<(), ScanError> {
    for advertisement in advertisements {
        if let Some(interrupt) = cancel.check() {
            return Err(interrupt.into());
        }
        if handler.accepts(&advertisement) {
            handler.handle(advertisement).await;
        }
    }
    Ok(())
}

impl ScanHandle for ScriptedScanner {
    fn scan<'a>(
        &'a self,
        cancel: &'a CancelToken,
        _allow_duplicates: bool,
        handler: &'a dyn AdvertisementHandler,
    ) -> BoxFuture<'a, Result<(), ScanError>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(Instant::now());
        let step = self.steps.lock().unwrap().pop_front();
        Box::pin(async move {
            match step {
                None => Err(cancel.interrupted().await.into()),
                Some(ScanStep::Fail(error)) => Err(error),
                Some(ScanStep::Emit(advertisements)) => {
                    offer(cancel, handler, advertisements).await?;
                    Err(cancel.interrupted().await.into())
                }
                Some(ScanStep::EmitAndEnd(advertisements)) => {
                    offer(cancel, handler, advertisements).await
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ScanError>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Sink recording every call. Clones share their records.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    exported: Arc<Mutex<Vec<Measurement>>>,
    calls: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    fail_on: Vec<usize>,
    delay: Option<Duration>,
    stall: bool,
    fail_close: bool,
}

impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Append this sink's name to `log` on every export call.
    pub fn with_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = log;
        self
    }

    /// Fail the export calls with these zero-based indices.
    pub fn failing_on(mut self, calls: &[usize]) -> Self {
        self.fail_on = calls.to_vec();
        self
    }

    /// Take `delay` for every export.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block every export until its token is interrupted.
    pub fn stalling(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn exported(&self) -> Vec<Measurement> {
        self.exported.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Sink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn export<'a>(
        &'a self,
        measurement: &'a Measurement,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name.clone());
            if self.stall {
                return Err(cancel.interrupted().await.into());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_on.contains(&call) {
                return Err(SinkError::Other(format!("scripted failure on call {call}")));
            }
            self.exported.lock().unwrap().push(measurement.clone());
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(SinkError::Other("close failed".to_string()));
            }
            Ok(())
        })
    }
}

/// In-memory `Write` whose clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
