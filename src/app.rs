//! Core application runner for `ruuvitag-collector`.
//!
//! This module is decoupled from logging setup and process exit codes so it
//! can be tested deterministically with an injected opener and output
//! stream.

use crate::cancel::CancelToken;
use crate::config::{Config, ConfigError};
use crate::orchestrator::{Orchestrator, RunError};
use crate::registry::{PeripheralRegistry, RegistryError};
use crate::scanner::{Backend, Opener, ScanError};
use crate::sink::console::ConsoleSink;
use crate::sink::influxdb::InfluxDbFormatter;
use crate::sink::json::JsonFormatter;
use crate::sink::throttle::{Throttled, parse_duration};
use crate::sink::{OutputFormatter, Sink};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info_span, warn};

/// How long the collector keeps scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Scan until every configured RuuviTag reported once, then exit
    Once,
    /// Print every measurement until interrupted
    Continuous,
    /// Scan once per interval, aligned to the wall clock
    Interval,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Once => "once",
            Mode::Continuous => "continuous",
            Mode::Interval => "interval",
        };
        f.write_str(s)
    }
}

/// Output line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// InfluxDB line protocol
    Influx,
    /// One JSON object per line
    Json,
}

/// Command line configuration.
///
/// Options left unset fall back to the config file, then to the defaults
/// in [`crate::config`].
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// TOML file with defaults for the options below
    #[arg(long, value_name = "PATH", env = "RUUVITAG_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// RuuviTag to collect from, with a human-readable name.
    /// Format: --ruuvitag DE:AD:BE:EF:00:00=Sauna
    #[arg(
        long = "ruuvitag",
        value_name = "ADDRESS=NAME",
        env = "RUUVITAG_PERIPHERALS",
        value_delimiter = ','
    )]
    pub peripherals: Vec<String>,

    /// Scan mode [default: once]
    #[arg(long, value_enum, env = "RUUVITAG_MODE")]
    pub mode: Option<Mode>,

    /// How long a one-off scan waits for the configured RuuviTags [default: 30s]
    #[arg(long, value_parser = parse_duration, env = "RUUVITAG_TIMEOUT")]
    pub timeout: Option<Duration>,

    /// Period of interval mode. Scans start on multiples of the period [default: 1m]
    #[arg(long, value_parser = parse_duration, env = "RUUVITAG_SCAN_INTERVAL")]
    pub scan_interval: Option<Duration>,

    /// Bluetooth adapter: "default" or "hciN" [default: default]
    #[arg(long, env = "RUUVITAG_DEVICE")]
    pub device: Option<String>,

    /// Bluetooth scanner backend to use
    #[arg(long, value_enum, env = "RUUVITAG_BACKEND")]
    pub backend: Option<Backend>,

    /// Output format [default: influx]
    #[arg(long, value_enum, env = "RUUVITAG_FORMAT")]
    pub format: Option<Format>,

    /// The name of the measurement in InfluxDB line protocol [default: ruuvi_measurement]
    #[arg(long, env = "RUUVITAG_INFLUXDB_MEASUREMENT")]
    pub influxdb_measurement: Option<String>,

    /// Throttle events per tag to at most one per interval.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, value_parser = parse_duration, env = "RUUVITAG_THROTTLE")]
    pub throttle: Option<Duration>,

    /// Verbose output, log dropped frames and every export
    #[arg(short = 'v', long = "verbose", env = "RUUVITAG_VERBOSE")]
    pub verbose: bool,
}

/// Errors returned by the application runner. All of them map to exit code 1.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to open {backend} device '{device}': {source}")]
    Open {
        backend: Backend,
        device: String,
        #[source]
        source: ScanError,
    },
    #[error(transparent)]
    Run(#[from] RunError),
}

fn formatter(config: &Config) -> Box<dyn OutputFormatter> {
    match config.format {
        Format::Influx => Box::new(InfluxDbFormatter::new(config.influxdb_measurement.clone())),
        Format::Json => Box::new(JsonFormatter),
    }
}

fn console_sink(config: &Config, out: Box<dyn Write + Send>) -> Box<dyn Sink> {
    let console = ConsoleSink::new(formatter(config), out);
    match config.throttle {
        Some(interval) => Box::new(Throttled::new(console, interval)),
        None => Box::new(console),
    }
}

/// Reject configurations that cannot work before any device is opened.
fn validate(config: &Config, registry: &PeripheralRegistry) -> Result<(), RunError> {
    match config.mode {
        Mode::Once if registry.is_empty() => Err(RunError::NoPeripheralsConfigured),
        Mode::Interval if config.scan_interval.is_zero() => Err(RunError::InvalidInterval),
        _ => Ok(()),
    }
}

/// Open the scanner, run the configured mode and tear everything down.
///
/// Measurements are written to `out`; logs go through `tracing`. Returns
/// once the mode finishes or `cancel` is canceled. A failed scan in once
/// or continuous mode is logged and is not an error.
pub async fn run_with_io(
    options: Options,
    opener: &dyn Opener,
    out: Box<dyn Write + Send>,
    cancel: CancelToken,
) -> Result<(), AppError> {
    let config = Config::from_options(options)?;
    let registry = PeripheralRegistry::parse(&config.peripherals)?;
    validate(&config, &registry)?;

    let handle = opener
        .open(config.backend, &config.device)
        .await
        .map_err(|source| AppError::Open {
            backend: config.backend,
            device: config.device.clone(),
            source,
        })?;

    let span = info_span!("collector", mode = %config.mode, device = %config.device);
    let orchestrator =
        Orchestrator::new(handle, registry, vec![console_sink(&config, out)]).with_span(span);

    let result = match config.mode {
        Mode::Once => orchestrator
            .run_once(&cancel, config.timeout)
            .await
            .map(drop),
        Mode::Continuous => orchestrator.run_continuously(&cancel).await.map(drop),
        Mode::Interval => {
            orchestrator
                .run_at_interval(&cancel, config.scan_interval)
                .await
        }
    };

    if let Err(error) = orchestrator.close().await {
        for failure in &error.failures {
            warn!(error = %failure, "teardown failure");
        }
    }

    result.map_err(AppError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScanHandle;
    use crate::test_utils::{ScanStep, ScriptedScanner, SharedBuffer, ruuvi_advertisement};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KITCHEN: &str = "aa:aa:aa:aa:aa:aa";

    #[derive(Default)]
    struct FakeOpener {
        scanner: ScriptedScanner,
        fail: Option<ScanError>,
        opens: AtomicUsize,
    }

    impl FakeOpener {
        fn new(scanner: ScriptedScanner) -> Self {
            Self {
                scanner,
                ..Self::default()
            }
        }
    }

    impl Opener for FakeOpener {
        fn open<'a>(
            &'a self,
            _backend: Backend,
            _device: &'a str,
        ) -> BoxFuture<'a, Result<Box<dyn ScanHandle>, ScanError>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let result = match &self.fail {
                Some(error) => Err(error.clone()),
                None => Ok(Box::new(self.scanner.clone()) as Box<dyn ScanHandle>),
            };
            Box::pin(async move { result })
        }
    }

    fn options(args: &[&str]) -> Options {
        let mut argv = vec!["ruuvitag-collector"];
        argv.extend_from_slice(args);
        Options::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_unset_options_are_none() {
        let options = options(&[]);
        assert_eq!(options.config, None);
        assert_eq!(options.mode, None);
        assert_eq!(options.timeout, None);
        assert_eq!(options.device, None);
        assert_eq!(options.format, None);
        assert_eq!(options.throttle, None);
        assert!(options.peripherals.is_empty());
    }

    #[test]
    fn test_option_parsing() {
        let options = options(&[
            "--ruuvitag",
            "AA:AA:AA:AA:AA:AA=Kitchen,bb:bb:bb:bb:bb:bb=Sauna",
            "--mode",
            "interval",
            "--scan-interval",
            "5m",
            "--format",
            "json",
            "--throttle",
            "500ms",
        ]);
        assert_eq!(options.peripherals.len(), 2);
        assert_eq!(options.mode, Some(Mode::Interval));
        assert_eq!(options.scan_interval, Some(Duration::from_secs(300)));
        assert_eq!(options.format, Some(Format::Json));
        assert_eq!(options.throttle, Some(Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_file_supplies_peripherals() {
        let path = std::env::temp_dir().join(format!(
            "ruuvitag-collector-app-{}.toml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "ruuvitags = [\"AA:AA:AA:AA:AA:AA=Kitchen\"]\ninfluxdb_measurement = \"ruuvi\"\n",
        )
        .unwrap();
        let scanner = ScriptedScanner::new([ScanStep::Emit(vec![ruuvi_advertisement(KITCHEN)])]);
        let opener = FakeOpener::new(scanner);
        let buffer = SharedBuffer::default();

        let result = run_with_io(
            options(&["--config", path.to_str().unwrap()]),
            &opener,
            Box::new(buffer.clone()),
            CancelToken::none(),
        )
        .await;
        std::fs::remove_file(&path).unwrap();

        result.unwrap();
        assert!(buffer.contents().starts_with("ruuvi,mac=aa:aa:aa:aa:aa:aa,name=Kitchen "));
    }

    #[tokio::test]
    async fn test_unreadable_config_file_fails_before_opening() {
        let opener = FakeOpener::default();
        let result = run_with_io(
            options(&["--config", "/nonexistent/ruuvitag-collector.toml"]),
            &opener,
            Box::new(SharedBuffer::default()),
            CancelToken::none(),
        )
        .await;

        assert!(matches!(result, Err(AppError::Config(ConfigError::Read { .. }))));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scan_failure_is_not_fatal_outside_interval_mode() {
        for mode in ["once", "continuous"] {
            let scanner = ScriptedScanner::new([ScanStep::Fail(ScanError::Bluetooth(
                "adapter busy".to_string(),
            ))]);
            let opener = FakeOpener::new(scanner.clone());

            let result = run_with_io(
                options(&["--mode", mode, "--ruuvitag", "aa:aa:aa:aa:aa:aa=Kitchen"]),
                &opener,
                Box::new(SharedBuffer::default()),
                CancelToken::none(),
            )
            .await;

            assert!(result.is_ok(), "{mode}: {result:?}");
            assert_eq!(scanner.scans(), 1);
            assert_eq!(scanner.closes(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_timeout_does_not_panic() {
        let scanner = ScriptedScanner::new([ScanStep::Emit(vec![ruuvi_advertisement(KITCHEN)])]);
        let opener = FakeOpener::new(scanner);
        let buffer = SharedBuffer::default();
        let timeout = format!("{}s", u64::MAX);

        run_with_io(
            options(&["--ruuvitag", "aa:aa:aa:aa:aa:aa=Kitchen", "--timeout", &timeout]),
            &opener,
            Box::new(buffer.clone()),
            CancelToken::none(),
        )
        .await
        .unwrap();

        assert_eq!(buffer.contents().lines().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_writes_measurements() {
        let scanner = ScriptedScanner::new([ScanStep::Emit(vec![ruuvi_advertisement(KITCHEN)])]);
        let opener = FakeOpener::new(scanner.clone());
        let buffer = SharedBuffer::default();

        run_with_io(
            options(&["--ruuvitag", "AA:AA:AA:AA:AA:AA=Kitchen"]),
            &opener,
            Box::new(buffer.clone()),
            CancelToken::none(),
        )
        .await
        .unwrap();

        let out = buffer.contents();
        assert_eq!(out.lines().count(), 1);
        assert!(out.starts_with("ruuvi_measurement,mac=aa:aa:aa:aa:aa:aa,name=Kitchen "));
        assert!(out.contains("temperature=22.1"));
        assert!(out.ends_with('\n'));
        assert_eq!(scanner.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_format() {
        let scanner = ScriptedScanner::new([ScanStep::Emit(vec![ruuvi_advertisement(KITCHEN)])]);
        let opener = FakeOpener::new(scanner);
        let buffer = SharedBuffer::default();

        run_with_io(
            options(&["--ruuvitag", "aa:aa:aa:aa:aa:aa=Kitchen", "--format", "json"]),
            &opener,
            Box::new(buffer.clone()),
            CancelToken::none(),
        )
        .await
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(buffer.contents().trim()).unwrap();
        assert_eq!(value["name"], "Kitchen");
        assert_eq!(value["battery_voltage"], 2755);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_mode_applies_throttle() {
        let scanner = ScriptedScanner::new([ScanStep::EmitAndEnd(vec![
            ruuvi_advertisement(KITCHEN),
            ruuvi_advertisement(KITCHEN),
        ])]);
        let opener = FakeOpener::new(scanner);
        let buffer = SharedBuffer::default();

        run_with_io(
            options(&["--mode", "continuous", "--throttle", "1h"]),
            &opener,
            Box::new(buffer.clone()),
            CancelToken::none(),
        )
        .await
        .unwrap();

        // only the first passes, the second is within the interval
        assert_eq!(buffer.contents().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_canceled_run_succeeds() {
        let opener = FakeOpener::new(ScriptedScanner::default());
        let (cancel, guard) = CancelToken::none().child();
        guard.cancel();

        let result = run_with_io(
            options(&["--mode", "continuous"]),
            &opener,
            Box::new(SharedBuffer::default()),
            cancel,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_once_without_peripherals_fails_before_opening() {
        let opener = FakeOpener::default();
        let result = run_with_io(
            options(&[]),
            &opener,
            Box::new(SharedBuffer::default()),
            CancelToken::none(),
        )
        .await;

        assert!(matches!(
            result,
            Err(AppError::Run(RunError::NoPeripheralsConfigured))
        ));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let opener = FakeOpener::default();
        let result = run_with_io(
            options(&["--mode", "interval", "--scan-interval", "0s"]),
            &opener,
            Box::new(SharedBuffer::default()),
            CancelToken::none(),
        )
        .await;
        assert!(matches!(result, Err(AppError::Run(RunError::InvalidInterval))));
    }

    #[tokio::test]
    async fn test_invalid_peripheral_entry() {
        let opener = FakeOpener::default();
        let result = run_with_io(
            options(&["--ruuvitag", "aa:aa:aa:aa:aa:aa"]),
            &opener,
            Box::new(SharedBuffer::default()),
            CancelToken::none(),
        )
        .await;
        assert!(matches!(
            result,
            Err(AppError::Registry(RegistryError::InvalidPeripheralSpec(_)))
        ));
    }

    #[tokio::test]
    async fn test_open_failure() {
        let opener = FakeOpener {
            fail: Some(ScanError::InvalidDevice("usb0".to_string())),
            ..FakeOpener::default()
        };
        let result = run_with_io(
            options(&["--ruuvitag", "aa:aa:aa:aa:aa:aa=Kitchen", "--device", "usb0"]),
            &opener,
            Box::new(SharedBuffer::default()),
            CancelToken::none(),
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, AppError::Open { .. }));
        assert!(err.to_string().contains("device 'usb0'"), "{err}");
    }
}
