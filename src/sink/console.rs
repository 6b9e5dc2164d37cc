//! Line-oriented sink writing formatted measurements to a stream.

use crate::cancel::CancelToken;
use crate::measurement::Measurement;
use crate::sink::{OutputFormatter, Sink, SinkError};
use futures::future::BoxFuture;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

/// Writes one formatted line per measurement, e.g. to stdout for Telegraf's
/// `execd` input.
pub struct ConsoleSink {
    formatter: Box<dyn OutputFormatter>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn new(formatter: Box<dyn OutputFormatter>, out: Box<dyn Write + Send>) -> Self {
        Self {
            formatter,
            out: Mutex::new(out),
        }
    }

    /// A console sink writing to the process's stdout.
    pub fn stdout(formatter: Box<dyn OutputFormatter>) -> Self {
        Self::new(formatter, Box::new(std::io::stdout()))
    }

    fn write_line(&self, line: &str) -> Result<(), SinkError> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn export<'a>(
        &'a self,
        measurement: &'a Measurement,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            if let Some(interrupt) = cancel.check() {
                return Err(interrupt.into());
            }
            let line = self.formatter.format(measurement)?;
            self.write_line(&line)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
            out.flush()?;
            Ok(())
        })
    }
}
