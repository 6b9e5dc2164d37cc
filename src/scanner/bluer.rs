//! BlueZ D-Bus backend for RuuviTag scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{Advertisement, AdvertisementHandler, ScanError, ScanHandle};
use crate::address::PeripheralAddress;
use crate::cancel::CancelToken;
use crate::decoder::RUUVI_MANUFACTURER_ID_BYTES;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Ruuvi Innovations manufacturer ID for data lookup.
///
/// This is the numeric value (0x0499) BlueZ uses as the key of the
/// manufacturer data map.
const RUUVI_MANUFACTURER_ID: u16 = 0x0499;

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
const MANUFACTURER_DATA_TYPE: u8 = 0xff;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// An open BlueZ adapter. The D-Bus session lives as long as the handle.
pub struct BluerHandle {
    state: Mutex<Option<(Session, Adapter)>>,
}

impl BluerHandle {
    /// Connect to bluetoothd and power on the adapter.
    ///
    /// `"default"` selects BlueZ's default adapter; anything else is used as
    /// the adapter name (e.g. `"hci1"`).
    pub async fn open(device: &str) -> Result<Self, ScanError> {
        let session = Session::new().await?;
        let adapter = if device.is_empty() || device.eq_ignore_ascii_case("default") {
            session.default_adapter().await?
        } else {
            session.adapter(device)?
        };
        adapter.set_powered(true).await?;
        info!(adapter = adapter.name(), "opened BlueZ adapter");

        Ok(Self {
            state: Mutex::new(Some((session, adapter))),
        })
    }

    fn adapter(&self) -> Result<Adapter, ScanError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, adapter)| adapter.clone())
            .ok_or(ScanError::Closed)
    }
}

impl ScanHandle for BluerHandle {
    fn scan<'a>(
        &'a self,
        cancel: &'a CancelToken,
        _allow_duplicates: bool,
        handler: &'a dyn AdvertisementHandler,
    ) -> BoxFuture<'a, Result<(), ScanError>> {
        Box::pin(async move {
            let adapter = self.adapter()?;

            // Create a pattern to filter for Ruuvi manufacturer data
            let pattern = Pattern {
                data_type: MANUFACTURER_DATA_TYPE,
                start_position: 0,
                content: RUUVI_MANUFACTURER_ID_BYTES.to_vec(),
            };

            let monitor_manager = adapter.monitor().await?;
            let mut monitor_handle = monitor_manager
                .register(Monitor {
                    patterns: Some(vec![pattern]),
                    ..Default::default()
                })
                .await?;

            loop {
                let event = tokio::select! {
                    biased;
                    interrupt = cancel.interrupted() => return Err(interrupt.into()),
                    event = monitor_handle.next() => event,
                };
                match event {
                    Some(MonitorEvent::DeviceFound(device_id)) => {
                        match read_advertisement(&adapter, device_id.device).await {
                            Ok(Some(advertisement)) if handler.accepts(&advertisement) => {
                                handler.handle(advertisement).await;
                            }
                            Ok(_) => {}
                            Err(error) => {
                                debug!(device = %device_id.device, %error, "could not read device");
                            }
                        }
                    }
                    Some(_) => {}
                    None => return Ok(()),
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            let state = self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some((_session, adapter)) = state {
                debug!(adapter = adapter.name(), "releasing BlueZ adapter");
            }
            Ok(())
        })
    }
}

/// Read the RuuviTag manufacturer data of a discovered device.
///
/// BlueZ strips the manufacturer id from the data; it is put back in front
/// so the frame matches the on-air layout.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<Advertisement>, ScanError> {
    let device = adapter.device(address)?;

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(None);
    };
    let Some(ruuvi_data) = manufacturer_data.get(&RUUVI_MANUFACTURER_ID) else {
        return Ok(None);
    };

    let mut data = Vec::with_capacity(2 + ruuvi_data.len());
    data.extend_from_slice(&RUUVI_MANUFACTURER_ID.to_le_bytes());
    data.extend_from_slice(ruuvi_data);

    Ok(Some(Advertisement {
        address: PeripheralAddress::from(address),
        data,
    }))
}
