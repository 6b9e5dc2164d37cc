//! Scan orchestration.
//!
//! An [`Orchestrator`] owns one scanning handle, the peripheral registry
//! and the sinks. Each run starts a scan session: the backend scan feeds
//! decoded measurements into a bounded queue, and a consumer drains the
//! queue and exports every measurement to all sinks in order.
//!
//! ```text
//! scan -> filter -> decode -> queue (128) -> sink 1 -> sink 2 -> ...
//! ```

mod schedule;
mod session;

pub use schedule::until_next_boundary;
pub use session::{SessionEnd, SessionReport};

use crate::cancel::{CancelToken, Interrupt};
use crate::decoder;
use crate::filter;
use crate::measurement::Measurement;
use crate::registry::PeripheralRegistry;
use crate::scanner::{Advertisement, AdvertisementHandler, ScanError, ScanHandle};
use crate::sink::{ExportError, Sink, SinkError};
use futures::future::BoxFuture;
use schedule::FailureStreak;
use session::{Completion, ScanSession};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Span, debug, info, warn};

/// Capacity of the queue between the scan and the sink fan-out.
pub const QUEUE_CAPACITY: usize = 128;

/// Budget shared by all sinks for exporting one measurement.
pub const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive soft failures after which interval mode gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Lifecycle state of an [`Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Idle => "idle",
            State::Running => "running",
            State::Stopped => "stopped",
            State::Completed => "completed",
            State::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Errors returned by the run entry points.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("scan interval must be greater than zero")]
    InvalidInterval,
    #[error("run-once needs at least one configured peripheral")]
    NoPeripheralsConfigured,
    #[error("orchestrator is already running")]
    AlreadyRunning,
    #[error("giving up after {0} consecutive failed scans")]
    TooManyFailures(u32),
}

/// One component that failed to close.
#[derive(Error, Debug)]
pub enum CloseFailure {
    #[error("scanner: {0}")]
    Scanner(ScanError),
    #[error("sink '{sink}': {source}")]
    Sink {
        sink: String,
        #[source]
        source: SinkError,
    },
}

/// Teardown failures collected by [`Orchestrator::close`].
#[derive(Error, Debug)]
#[error("{} component(s) failed to close", .failures.len())]
pub struct CloseError {
    pub failures: Vec<CloseFailure>,
}

/// Drives scans and fans the measurements out to the sinks.
///
/// All entry points take `&self`, so [`Orchestrator::stop`] can be called
/// while a run is in progress.
pub struct Orchestrator {
    handle: Box<dyn ScanHandle>,
    registry: PeripheralRegistry,
    sinks: Vec<Box<dyn Sink>>,
    span: Span,
    state: Mutex<State>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Orchestrator {
    /// Sinks are exported to in the order given.
    pub fn new(
        handle: Box<dyn ScanHandle>,
        registry: PeripheralRegistry,
        sinks: Vec<Box<dyn Sink>>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            handle,
            registry,
            sinks,
            span: Span::none(),
            state: Mutex::new(State::Idle),
            stop_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Record every log event of this orchestrator inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> State {
        *self.lock_state()
    }

    /// Scan until every registered peripheral produced a measurement, the
    /// timeout elapses or the run is stopped.
    pub async fn run_once(
        &self,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> Result<SessionReport, RunError> {
        if self.registry.is_empty() {
            return Err(RunError::NoPeripheralsConfigured);
        }
        self.bounded(cancel, timeout, "run once").await
    }

    /// Like [`Orchestrator::run_once`], but an empty registry is allowed;
    /// the window then lasts until the timeout or a stop.
    pub async fn scan_window(
        &self,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> Result<SessionReport, RunError> {
        self.bounded(cancel, timeout, "scan window").await
    }

    async fn bounded(
        &self,
        cancel: &CancelToken,
        timeout: Duration,
        what: &'static str,
    ) -> Result<SessionReport, RunError> {
        if !self.begin()? {
            return Ok(SessionReport::stopped());
        }
        let report = async {
            info!(timeout = ?timeout, peripherals = self.registry.len(), "starting {what}");
            let token = self.session_token(cancel).with_timeout(timeout);
            let report = self.session(&token, Completion::AllRegistered).await;
            log_report(&report);
            report
        }
        .instrument(self.span.clone())
        .await;
        self.finish(false);
        Ok(report)
    }

    /// Export every measurement as it arrives until stopped or until the
    /// backend ends the scan.
    pub async fn run_continuously(&self, cancel: &CancelToken) -> Result<SessionReport, RunError> {
        if !self.begin()? {
            return Ok(SessionReport::stopped());
        }
        let report = async {
            info!(peripherals = self.registry.len(), "starting continuous scan");
            let token = self.session_token(cancel);
            let report = self.session(&token, Completion::Never).await;
            log_report(&report);
            report
        }
        .instrument(self.span.clone())
        .await;
        self.finish(false);
        Ok(report)
    }

    /// Scan once per `period`, aligned to wall-clock multiples of the
    /// period. Each window lasts at most one period.
    ///
    /// Returns `Ok(())` when stopped and [`RunError::TooManyFailures`]
    /// after [`MAX_CONSECUTIVE_FAILURES`] failed windows in a row.
    pub async fn run_at_interval(
        &self,
        cancel: &CancelToken,
        period: Duration,
    ) -> Result<(), RunError> {
        if period.is_zero() {
            return Err(RunError::InvalidInterval);
        }
        if !self.begin()? {
            return Ok(());
        }
        let result = self
            .interval_loop(cancel, period)
            .instrument(self.span.clone())
            .await;
        self.finish(result.is_err());
        result
    }

    async fn interval_loop(&self, cancel: &CancelToken, period: Duration) -> Result<(), RunError> {
        let token = self.session_token(cancel);
        let delay = until_next_boundary(SystemTime::now(), period);
        info!(period = ?period, delay = ?delay, "waiting for first interval boundary");

        tokio::select! {
            biased;
            _ = token.interrupted() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }

        let mut ticker = tokio::time::interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut streak = FailureStreak::new(MAX_CONSECUTIVE_FAILURES);

        loop {
            tokio::select! {
                biased;
                _ = token.interrupted() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let window = token.with_timeout(period);
            let report = self.session(&window, Completion::AllRegistered).await;
            let failed = match report.end {
                SessionEnd::Stopped => {
                    log_report(&report);
                    return Ok(());
                }
                SessionEnd::ScanFailed => true,
                SessionEnd::Completed => false,
                SessionEnd::DeadlineExceeded | SessionEnd::ScanEnded => !self.registry.is_empty(),
            };
            if !failed {
                log_report(&report);
                streak.reset();
                continue;
            }

            let missing: Vec<_> = report.missing.iter().map(ToString::to_string).collect();
            warn!(
                end = %report.end,
                missing = ?missing,
                failures = streak.count() + 1,
                "scan window failed"
            );
            if streak.record_failure() {
                return Err(RunError::TooManyFailures(streak.count()));
            }
        }
    }

    /// Request the current and all future runs to end. No-op once the
    /// orchestrator completed, failed or was already stopped.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        if matches!(*state, State::Idle | State::Running) {
            *state = State::Stopped;
            self.stop_tx.send_replace(true);
            self.span.in_scope(|| debug!("stop requested"));
        }
    }

    /// Stop, release the scanning handle and close every sink.
    ///
    /// Only the first call does anything. Every sink is closed even when an
    /// earlier component fails.
    pub async fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop();

        async {
            let mut failures = Vec::new();
            if let Err(error) = self.handle.close().await {
                warn!(%error, "failed to release scanner");
                failures.push(CloseFailure::Scanner(error));
            }
            for sink in &self.sinks {
                if let Err(source) = sink.close().await {
                    warn!(sink = sink.name(), error = %source, "failed to close sink");
                    failures.push(CloseFailure::Sink {
                        sink: sink.name().to_string(),
                        source,
                    });
                }
            }
            if failures.is_empty() {
                Ok(())
            } else {
                Err(CloseError { failures })
            }
        }
        .instrument(self.span.clone())
        .await
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter `Running`. `Ok(false)` means the orchestrator was stopped and
    /// the run must not scan.
    fn begin(&self) -> Result<bool, RunError> {
        let mut state = self.lock_state();
        match *state {
            State::Running => Err(RunError::AlreadyRunning),
            State::Stopped => Ok(false),
            State::Idle | State::Completed | State::Failed => {
                *state = State::Running;
                Ok(true)
            }
        }
    }

    fn finish(&self, failed: bool) {
        let mut state = self.lock_state();
        if *state == State::Running {
            *state = if failed { State::Failed } else { State::Completed };
        }
    }

    fn session_token(&self, cancel: &CancelToken) -> CancelToken {
        cancel.with_signal(self.stop_tx.subscribe())
    }

    /// Run one scan session and report how it ended. A backend error that
    /// ends the scan is logged and reported as [`SessionEnd::ScanFailed`].
    async fn session(&self, cancel: &CancelToken, completion: Completion) -> SessionReport {
        let (token, guard) = cancel.child();
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let producer = Producer {
            registry: &self.registry,
            queue: tx,
            cancel: token.clone(),
            span: self.span.clone(),
        };
        let allow_duplicates = completion == Completion::Never;

        let produce = {
            let token = token.clone();
            async move {
                let result = self.handle.scan(&token, allow_duplicates, &producer).await;
                // Closes the queue.
                drop(producer);
                result
            }
        };

        let consume = async move {
            let mut session = ScanSession::new(&self.registry, completion);
            let end = loop {
                tokio::select! {
                    biased;
                    interrupt = token.interrupted() => break SessionEnd::from(interrupt),
                    next = rx.recv() => match next {
                        Some(measurement) => {
                            let exported = self.export(&measurement, &token).await;
                            session.record(&measurement, exported);
                            if session.is_complete() {
                                break SessionEnd::Completed;
                            }
                        }
                        None => break SessionEnd::ScanEnded,
                    },
                }
            };
            guard.cancel();
            drop(rx);
            session.finish(end)
        };

        let (scanned, mut report) = tokio::join!(produce, consume);
        if let Err(error) = scanned
            && !error.is_graceful()
        {
            warn!(%error, "scan failed");
            if report.end == SessionEnd::ScanEnded {
                report.end = SessionEnd::ScanFailed;
            }
        }
        report
    }

    /// Export to every sink in order under one shared deadline. Returns
    /// `false` if a sink failed; later sinks are skipped for this
    /// measurement.
    async fn export(&self, measurement: &Measurement, session: &CancelToken) -> bool {
        let cancel = session.with_timeout(EXPORT_TIMEOUT);
        match self.fan_out(measurement, &cancel).await {
            Ok(()) => {
                debug!(address = %measurement.address, "exported measurement");
                true
            }
            Err(error) => {
                warn!(
                    address = %measurement.address,
                    sink = %error.sink,
                    error = %error.source,
                    "export failed"
                );
                false
            }
        }
    }

    async fn fan_out(&self, measurement: &Measurement, cancel: &CancelToken) -> Result<(), ExportError> {
        for sink in &self.sinks {
            sink.export(measurement, cancel)
                .await
                .map_err(|source| ExportError {
                    sink: sink.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

fn log_report(report: &SessionReport) {
    let missing: Vec<_> = report.missing.iter().map(ToString::to_string).collect();
    info!(
        end = %report.end,
        exported = report.exported,
        failed = report.failed,
        seen = report.peripherals_seen,
        missing = ?missing,
        "scan session finished"
    );
}

/// Advertisement handler feeding the session queue.
struct Producer<'a> {
    registry: &'a PeripheralRegistry,
    queue: mpsc::Sender<Measurement>,
    cancel: CancelToken,
    span: Span,
}

impl Producer<'_> {
    fn decode(&self, advertisement: Advertisement) -> Option<Measurement> {
        match decoder::decode(&advertisement.data) {
            Ok(reading) => {
                let name = self.registry.name(&advertisement.address).unwrap_or_default();
                Some(Measurement::new(
                    advertisement.address,
                    name,
                    reading,
                    SystemTime::now(),
                ))
            }
            Err(error) => {
                debug!(
                    address = %advertisement.address,
                    len = advertisement.data.len(),
                    header = ?&advertisement.data[..advertisement.data.len().min(3)],
                    %error,
                    "dropping frame"
                );
                None
            }
        }
    }
}

impl AdvertisementHandler for Producer<'_> {
    fn accepts(&self, advertisement: &Advertisement) -> bool {
        filter::accepts(&advertisement.address, &advertisement.data, self.registry)
    }

    fn handle(&self, advertisement: Advertisement) -> BoxFuture<'_, ()> {
        Box::pin(
            async move {
                // Backends may skip the predicate.
                if !self.accepts(&advertisement) {
                    return;
                }
                let Some(measurement) = self.decode(advertisement) else {
                    return;
                };
                let address = measurement.address.clone();
                tokio::select! {
                    biased;
                    interrupt = self.cancel.interrupted() => {
                        if interrupt == Interrupt::DeadlineExceeded {
                            debug!(%address, "deadline passed, dropping measurement");
                        }
                    }
                    sent = self.queue.send(measurement) => {
                        if sent.is_err() {
                            debug!("queue closed, dropping measurement");
                        }
                    }
                }
            }
            .instrument(self.span.clone()),
        )
    }
}
