//! `ruuvitag-collector` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup, signal
//! handling and process exit codes. Option handling and wiring live in
//! [`crate::app`], config file merging in [`crate::config`]; the scan lifecycle lives in [`crate::orchestrator`],
//! where it can be tested deterministically with injected scanners and
//! sinks.

pub mod address;
pub mod app;
pub mod cancel;
pub mod config;
pub mod decoder;
pub mod filter;
pub mod measurement;
pub mod orchestrator;
pub mod registry;
pub mod scanner;
pub mod sink;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use address::PeripheralAddress;
pub use cancel::{CancelGuard, CancelToken, Interrupt};
pub use decoder::{DecodeError, Reading, decode};
pub use measurement::Measurement;
pub use orchestrator::{CloseError, Orchestrator, RunError, SessionEnd, SessionReport, State};
pub use registry::{PeripheralRegistry, RegistryError};
pub use scanner::{Backend, ScanError, ScanHandle};
pub use sink::{ExportError, OutputFormatter, Sink, SinkError};
