//! Per-invocation scan state and its outcome.

use crate::address::PeripheralAddress;
use crate::cancel::Interrupt;
use crate::measurement::Measurement;
use crate::registry::PeripheralRegistry;
use std::collections::HashSet;
use std::fmt;

/// How a scan session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Every registered peripheral reported
    Completed,
    /// The session deadline passed first
    DeadlineExceeded,
    /// `stop()` was called or the caller's token was canceled
    Stopped,
    /// The backend ended the scan on its own
    ScanEnded,
    /// The backend failed mid-scan
    ScanFailed,
}

impl From<Interrupt> for SessionEnd {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Canceled => SessionEnd::Stopped,
            Interrupt::DeadlineExceeded => SessionEnd::DeadlineExceeded,
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionEnd::Completed => "completed",
            SessionEnd::DeadlineExceeded => "deadline exceeded",
            SessionEnd::Stopped => "stopped",
            SessionEnd::ScanEnded => "scan ended",
            SessionEnd::ScanFailed => "scan failed",
        };
        f.write_str(s)
    }
}

/// Summary of one scan session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub end: SessionEnd,
    /// Measurements every sink accepted
    pub exported: u64,
    /// Measurements at least one sink rejected
    pub failed: u64,
    /// Distinct peripherals that produced a measurement
    pub peripherals_seen: usize,
    /// Registered peripherals that never reported, sorted by address
    pub missing: Vec<PeripheralAddress>,
}

impl SessionReport {
    pub(crate) fn stopped() -> Self {
        Self {
            end: SessionEnd::Stopped,
            exported: 0,
            failed: 0,
            peripherals_seen: 0,
            missing: Vec::new(),
        }
    }
}

/// Whether a session ends once every registered peripheral has reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    AllRegistered,
    Never,
}

/// Mutable state of one session, owned by its consumer loop.
#[derive(Debug)]
pub(crate) struct ScanSession<'a> {
    registry: &'a PeripheralRegistry,
    completion: Completion,
    seen: HashSet<PeripheralAddress>,
    exported: u64,
    failed: u64,
}

impl<'a> ScanSession<'a> {
    pub(crate) fn new(registry: &'a PeripheralRegistry, completion: Completion) -> Self {
        Self {
            registry,
            completion,
            seen: HashSet::new(),
            exported: 0,
            failed: 0,
        }
    }

    /// Record a measurement that went through the fan-out.
    pub(crate) fn record(&mut self, measurement: &Measurement, exported: bool) {
        if exported {
            self.exported += 1;
        } else {
            self.failed += 1;
        }
        if !self.seen.contains(&measurement.address) {
            self.seen.insert(measurement.address.clone());
        }
    }

    /// `true` once every registered peripheral has reported. An empty
    /// registry never completes.
    pub(crate) fn is_complete(&self) -> bool {
        self.completion == Completion::AllRegistered
            && !self.registry.is_empty()
            && self.registry.addresses().all(|address| self.seen.contains(address))
    }

    pub(crate) fn finish(self, end: SessionEnd) -> SessionReport {
        let missing = self
            .registry
            .addresses()
            .filter(|address| !self.seen.contains(*address))
            .cloned()
            .collect();
        SessionReport {
            end,
            exported: self.exported,
            failed: self.failed,
            peripherals_seen: self.seen.len(),
            missing,
        }
    }
}
