//! BLE scanner abstraction for RuuviTag devices.
//!
//! A backend opens a device and returns a [`ScanHandle`]. The handle runs
//! scans on demand: every advertisement it receives is offered to an
//! [`AdvertisementHandler`], first through the filter predicate
//! ([`AdvertisementHandler::accepts`]) and then, if accepted, through the
//! callback ([`AdvertisementHandler::handle`]).

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::address::PeripheralAddress;
use crate::cancel::{CancelToken, Interrupt};
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

/// Error type for scanner operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// The scan was stopped through its cancel token
    #[error("Scan canceled")]
    Canceled,
    /// The scan ran into its deadline
    #[error("Scan deadline exceeded")]
    DeadlineExceeded,
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// The device identifier could not be understood
    #[error("Invalid device '{0}': expected 'default' or 'hciN'")]
    InvalidDevice(String),
    /// The handle was used after [`ScanHandle::close`]
    #[error("Scan handle is closed")]
    Closed,
    /// Backend not available (not compiled in)
    #[allow(dead_code)]
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

impl ScanError {
    /// `true` for the expected ways a scan ends: cancellation and deadline.
    pub fn is_graceful(&self) -> bool {
        matches!(self, ScanError::Canceled | ScanError::DeadlineExceeded)
    }
}

impl From<Interrupt> for ScanError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Canceled => ScanError::Canceled,
            Interrupt::DeadlineExceeded => ScanError::DeadlineExceeded,
        }
    }
}

/// Manufacturer-specific data of one advertisement and who sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: PeripheralAddress,
    /// Raw manufacturer data, beginning with the 2-byte manufacturer id
    pub data: Vec<u8>,
}

impl Advertisement {
    pub fn new(address: impl Into<PeripheralAddress>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            address: address.into(),
            data: data.into(),
        }
    }
}

/// Receiver of advertisements during a scan.
pub trait AdvertisementHandler: Send + Sync {
    /// Filter predicate; `handle` is only called for accepted advertisements.
    fn accepts(&self, advertisement: &Advertisement) -> bool;

    /// Process an advertisement. May suspend, which applies back-pressure
    /// to the scan.
    fn handle(&self, advertisement: Advertisement) -> BoxFuture<'_, ()>;
}

/// An opened scanning device.
pub trait ScanHandle: Send + Sync {
    /// Scan until `cancel` is interrupted or the device fails.
    ///
    /// Returns `Err(ScanError::Canceled)` or `Err(ScanError::DeadlineExceeded)`
    /// when ended through the token. With `allow_duplicates` the backend
    /// reports every advertisement, not only the first per device.
    fn scan<'a>(
        &'a self,
        cancel: &'a CancelToken,
        allow_duplicates: bool,
        handler: &'a dyn AdvertisementHandler,
    ) -> BoxFuture<'a, Result<(), ScanError>>;

    /// Release the device.
    fn close(&self) -> BoxFuture<'_, Result<(), ScanError>>;
}

impl<T: ScanHandle + ?Sized> ScanHandle for Arc<T> {
    fn scan<'a>(
        &'a self,
        cancel: &'a CancelToken,
        allow_duplicates: bool,
        handler: &'a dyn AdvertisementHandler,
    ) -> BoxFuture<'a, Result<(), ScanError>> {
        (**self).scan(cancel, allow_duplicates, handler)
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ScanError>> {
        (**self).close()
    }
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    #[serde(alias = "bluez")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    #[serde(alias = "raw")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Opens scanning devices. The binary uses [`SystemOpener`]; tests inject
/// scripted handles.
pub trait Opener: Send + Sync {
    fn open<'a>(
        &'a self,
        backend: Backend,
        device: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn ScanHandle>, ScanError>>;
}

/// Opener for the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

impl Opener for SystemOpener {
    fn open<'a>(
        &'a self,
        backend: Backend,
        device: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn ScanHandle>, ScanError>> {
        Box::pin(open(backend, device))
    }
}

/// Open `device` with the given backend.
///
/// # Arguments
/// * `backend` - The scanner backend to use
/// * `device` - `"default"` for the first adapter, or an adapter name such as `"hci1"`
pub async fn open(backend: Backend, device: &str) -> Result<Box<dyn ScanHandle>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Ok(Box::new(bluer::BluerHandle::open(device).await?)),
        #[cfg(feature = "hci")]
        Backend::Hci => Ok(Box::new(hci::HciHandle::open(device)?)),
    }
}

/// Parse a device identifier into an adapter index.
///
/// `"default"` and the empty string select adapter 0.
pub fn parse_device_index(device: &str) -> Result<u16, ScanError> {
    let device = device.trim();
    if device.is_empty() || device.eq_ignore_ascii_case("default") {
        return Ok(0);
    }
    device
        .strip_prefix("hci")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| ScanError::InvalidDevice(device.to_string()))
}
