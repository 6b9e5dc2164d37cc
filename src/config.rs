//! Settings from the command line, the environment and an optional TOML
//! config file.
//!
//! Precedence: command line > environment > config file > defaults. The
//! file uses the long option names with underscores:
//!
//! ```toml
//! ruuvitags = ["CC:CA:7E:52:CC:34=Backyard", "FB:E1:B7:04:95:EE=Sauna"]
//! mode = "interval"
//! scan_interval = "5m"
//! device = "hci0"
//! influxdb_measurement = "ruuvi"
//! ```

use crate::app::{Format, Mode, Options};
use crate::scanner::Backend;
use crate::sink::throttle::parse_duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_DEVICE: &str = "default";
pub const DEFAULT_INFLUXDB_MEASUREMENT: &str = "ruuvi_measurement";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid '{key}' in config file: {message}")]
    Value { key: &'static str, message: String },
}

/// Keys of a config file. All of them are optional; unknown keys are
/// ignored.
#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct ConfigFile {
    #[serde(default)]
    pub ruuvitags: Vec<String>,
    pub mode: Option<Mode>,
    pub timeout: Option<String>,
    pub scan_interval: Option<String>,
    pub device: Option<String>,
    pub backend: Option<Backend>,
    pub format: Option<Format>,
    pub influxdb_measurement: Option<String>,
    pub throttle: Option<String>,
}

impl ConfigFile {
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn duration(key: &'static str, value: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|value| parse_duration(value).map_err(|message| ConfigError::Value { key, message }))
        .transpose()
}

/// Resolved settings of one collector run.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub peripherals: Vec<String>,
    pub mode: Mode,
    pub timeout: Duration,
    pub scan_interval: Duration,
    pub device: String,
    pub backend: Backend,
    pub format: Format,
    pub influxdb_measurement: String,
    pub throttle: Option<Duration>,
}

impl Config {
    /// Read the file named by `--config`, if any, and merge `options` over it.
    pub fn from_options(options: Options) -> Result<Self, ConfigError> {
        let file = match &options.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        Self::merge(options, file)
    }

    /// Values set in `options` win. `--ruuvitag` replaces the file's list
    /// rather than extending it.
    pub fn merge(options: Options, file: ConfigFile) -> Result<Self, ConfigError> {
        let peripherals = if options.peripherals.is_empty() {
            file.ruuvitags
        } else {
            options.peripherals
        };
        let timeout = duration("timeout", file.timeout.as_deref())?;
        let scan_interval = duration("scan_interval", file.scan_interval.as_deref())?;
        let throttle = duration("throttle", file.throttle.as_deref())?;

        Ok(Self {
            peripherals,
            mode: options.mode.or(file.mode).unwrap_or(Mode::Once),
            timeout: options.timeout.or(timeout).unwrap_or(DEFAULT_TIMEOUT),
            scan_interval: options
                .scan_interval
                .or(scan_interval)
                .unwrap_or(DEFAULT_SCAN_INTERVAL),
            device: options
                .device
                .or(file.device)
                .unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            backend: options.backend.or(file.backend).unwrap_or_default(),
            format: options.format.or(file.format).unwrap_or(Format::Influx),
            influxdb_measurement: options
                .influxdb_measurement
                .or(file.influxdb_measurement)
                .unwrap_or_else(|| DEFAULT_INFLUXDB_MEASUREMENT.to_string()),
            throttle: options.throttle.or(throttle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn options(args: &[&str]) -> Options {
        let mut argv = vec!["ruuvitag-collector"];
        argv.extend_from_slice(args);
        Options::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::merge(options(&[]), ConfigFile::default()).unwrap();
        assert_eq!(config.mode, Mode::Once);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.scan_interval, Duration::from_secs(60));
        assert_eq!(config.device, "default");
        assert_eq!(config.backend, Backend::default());
        assert_eq!(config.format, Format::Influx);
        assert_eq!(config.influxdb_measurement, "ruuvi_measurement");
        assert_eq!(config.throttle, None);
        assert!(config.peripherals.is_empty());
    }

    #[test]
    fn test_parse_file() {
        let file = ConfigFile::parse(
            r#"
            ruuvitags = ["CC:CA:7E:52:CC:34=Backyard", "fb:e1:b7:04:95:ee=Sauna"]
            mode = "interval"
            scan_interval = "5m"
            device = "hci1"
            format = "json"
            influxdb_measurement = "ruuvi"
            throttle = "10s"

            # keys of other tools are ignored
            influxdb_addr = "http://localhost:8086"
            "#,
        )
        .unwrap();

        assert_eq!(file.ruuvitags.len(), 2);
        assert_eq!(file.mode, Some(Mode::Interval));
        assert_eq!(file.format, Some(Format::Json));
        assert_eq!(file.device.as_deref(), Some("hci1"));
        assert_eq!(file.timeout, None);

        let config = Config::merge(options(&[]), file).unwrap();
        assert_eq!(config.scan_interval, Duration::from_secs(300));
        assert_eq!(config.throttle, Some(Duration::from_secs(10)));
        assert_eq!(config.influxdb_measurement, "ruuvi");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_command_line_wins_over_file() {
        let file = ConfigFile::parse(
            r#"
            ruuvitags = ["aa:aa:aa:aa:aa:aa=Kitchen"]
            mode = "interval"
            device = "hci1"
            timeout = "1m"
            "#,
        )
        .unwrap();
        let options = options(&[
            "--ruuvitag",
            "bb:bb:bb:bb:bb:bb=Sauna",
            "--mode",
            "once",
            "--timeout",
            "5s",
        ]);

        let config = Config::merge(options, file).unwrap();
        assert_eq!(config.peripherals, vec!["bb:bb:bb:bb:bb:bb=Sauna"]);
        assert_eq!(config.mode, Mode::Once);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.device, "hci1");
    }

    #[test]
    fn test_invalid_duration_in_file() {
        let file = ConfigFile::parse(r#"scan_interval = "soon""#).unwrap();
        let err = Config::merge(options(&[]), file).unwrap_err();
        assert!(matches!(err, ConfigError::Value { key: "scan_interval", .. }));
        assert_eq!(
            err.to_string(),
            "invalid 'scan_interval' in config file: invalid duration: soon"
        );
    }

    #[test]
    fn test_malformed_file() {
        assert!(ConfigFile::parse("ruuvitags = [").is_err());
        assert!(ConfigFile::parse(r#"mode = "sometimes""#).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join("ruuvitag-collector-does-not-exist.toml");
        let err = ConfigFile::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("does-not-exist.toml"), "{err}");
    }

    #[test]
    fn test_from_options_reads_file() {
        let path = std::env::temp_dir().join(format!(
            "ruuvitag-collector-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "ruuvitags = [\"aa:aa:aa:aa:aa:aa=Kitchen\"]\n").unwrap();

        let config = Config::from_options(options(&["--config", path.to_str().unwrap()]));
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.unwrap().peripherals, vec!["aa:aa:aa:aa:aa:aa=Kitchen"]);
    }
}
