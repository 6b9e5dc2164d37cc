//! Raw HCI socket backend for RuuviTag scanning.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{Advertisement, AdvertisementHandler, ScanError, ScanHandle, parse_device_index};
use crate::address::PeripheralAddress;
use crate::cancel::CancelToken;
use futures::future::BoxFuture;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Mutex, PoisonError};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, trace};

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// AD types
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// LE Set Scan Parameters command
#[repr(C, packed)]
struct LeSetScanParametersCmd {
    scan_type: u8,
    interval: u16,
    window: u16,
    own_address_type: u8,
    filter_policy: u8,
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // HCI command packet type
    packet.push((opcode & 0xFF) as u8);
    packet.push((opcode >> 8) as u8);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

fn last_os_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, ScanError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(last_os_error("Failed to create HCI socket"));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), ScanError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(last_os_error("Failed to bind HCI socket"));
    }

    Ok(())
}

/// Set HCI socket filter
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(last_os_error("Failed to set HCI filter"));
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(last_os_error("Failed to send HCI command"));
    }

    Ok(())
}

/// Parameters of the LE Set Scan Enable command.
fn scan_enable_params(enable: bool, allow_duplicates: bool) -> [u8; 2] {
    [u8::from(enable), u8::from(!allow_duplicates)]
}

/// Configure LE scanning parameters and enable scanning
fn configure_le_scan(fd: &OwnedFd, allow_duplicates: bool) -> Result<(), ScanError> {
    // Set scan parameters: passive scan, 10ms interval, 10ms window
    let params = LeSetScanParametersCmd {
        scan_type: LE_SCAN_PASSIVE,
        interval: 0x0010, // 10ms in 0.625ms units
        window: 0x0010,   // 10ms in 0.625ms units
        own_address_type: LE_PUBLIC_ADDRESS,
        filter_policy: FILTER_POLICY_ACCEPT_ALL,
    };

    let params_bytes = unsafe {
        std::slice::from_raw_parts(
            &params as *const LeSetScanParametersCmd as *const u8,
            mem::size_of::<LeSetScanParametersCmd>(),
        )
    };

    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, params_bytes);
    send_hci_command(fd, &packet)?;

    let packet = hci_command_packet(
        OGF_LE_CTL,
        OCF_LE_SET_SCAN_ENABLE,
        &scan_enable_params(true, allow_duplicates),
    );
    send_hci_command(fd, &packet)
}

fn disable_le_scan(fd: &OwnedFd) -> Result<(), ScanError> {
    let packet = hci_command_packet(
        OGF_LE_CTL,
        OCF_LE_SET_SCAN_ENABLE,
        &scan_enable_params(false, false),
    );
    send_hci_command(fd, &packet)
}

/// Parse an LE advertising report and extract Ruuvi manufacturer data.
///
/// The returned frame keeps the manufacturer id in front, as broadcast.
fn parse_advertising_report(data: &[u8]) -> Option<Advertisement> {
    // Minimum size for an advertising report
    if data.len() < 12 {
        return None;
    }

    // Skip HCI header (1 byte packet type + 1 byte event code + 1 byte param len + 1 byte subevent)
    let report = &data[4..];

    // Number of reports; only the first one is processed
    if report[0] == 0 {
        return None;
    }

    // Skip: num_reports(1) + event_type(1) + addr_type(1)
    if report.len() < 10 {
        return None;
    }

    // Extract address (6 bytes, in reverse order)
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&report[3..9]);
    addr.reverse(); // HCI uses little-endian address

    let data_len = report[9] as usize;
    if report.len() < 10 + data_len {
        return None;
    }

    let ad_data = &report[10..10 + data_len];

    // Parse AD structures to find manufacturer data
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[offset + 1];

        if ad_type == AD_TYPE_MANUFACTURER_DATA && len >= 3 {
            let frame = &ad_data[offset + 2..offset + 1 + len];
            if frame[..2] == crate::decoder::RUUVI_MANUFACTURER_ID_BYTES {
                return Some(Advertisement {
                    address: PeripheralAddress::from(addr),
                    data: frame.to_vec(),
                });
            }
        }

        offset += 1 + len;
    }

    None
}

/// An HCI adapter opened for command traffic.
pub struct HciHandle {
    dev_id: u16,
    cmd_fd: Mutex<Option<OwnedFd>>,
}

impl HciHandle {
    /// Open the HCI device named by `device` (`"default"` or `"hciN"`).
    pub fn open(device: &str) -> Result<Self, ScanError> {
        let dev_id = parse_device_index(device)?;
        let cmd_fd = open_hci_socket()?;
        bind_hci_socket(&cmd_fd, dev_id)?;
        info!(dev_id, "opened HCI device");

        Ok(Self {
            dev_id,
            cmd_fd: Mutex::new(Some(cmd_fd)),
        })
    }

    fn with_cmd_fd<T>(
        &self,
        f: impl FnOnce(&OwnedFd) -> Result<T, ScanError>,
    ) -> Result<T, ScanError> {
        let guard = self.cmd_fd.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(fd) => f(fd),
            None => Err(ScanError::Closed),
        }
    }

    async fn read_events(
        &self,
        async_fd: &AsyncFd<OwnedFd>,
        cancel: &CancelToken,
        handler: &dyn AdvertisementHandler,
    ) -> Result<(), ScanError> {
        let mut buf = [0u8; 258]; // Max HCI event size

        loop {
            let mut guard = tokio::select! {
                biased;
                interrupt = cancel.interrupted() => return Err(interrupt.into()),
                ready = async_fd.readable() => ready.map_err(|e| {
                    ScanError::Bluetooth(format!("HCI socket failed: {e}"))
                })?,
            };

            // Drain all available packets before waiting again
            loop {
                let n = match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                }) {
                    Ok(Ok(n)) if n > 0 => n,
                    Ok(Ok(_)) => break, // EOF or empty read
                    Ok(Err(e)) => {
                        return Err(ScanError::Bluetooth(format!("HCI read failed: {e}")));
                    }
                    Err(_would_block) => break,
                };

                // Check if this is an LE advertising report
                if n >= 4
                    && buf[0] == HCI_EVENT_PKT
                    && buf[1] == EVT_LE_META_EVENT
                    && buf[3] == EVT_LE_ADVERTISING_REPORT
                    && let Some(advertisement) = parse_advertising_report(&buf[..n])
                {
                    trace!(address = %advertisement.address, "advertising report");
                    if handler.accepts(&advertisement) {
                        handler.handle(advertisement).await;
                    }
                }
            }
        }
    }
}

impl ScanHandle for HciHandle {
    fn scan<'a>(
        &'a self,
        cancel: &'a CancelToken,
        allow_duplicates: bool,
        handler: &'a dyn AdvertisementHandler,
    ) -> BoxFuture<'a, Result<(), ScanError>> {
        Box::pin(async move {
            // Event socket bound to the device to receive advertising events
            let fd = open_hci_socket()?;
            bind_hci_socket(&fd, self.dev_id)?;
            set_hci_filter(&fd)?;
            let async_fd = AsyncFd::new(fd)
                .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {}", e)))?;

            self.with_cmd_fd(|cmd_fd| configure_le_scan(cmd_fd, allow_duplicates))?;
            let result = self.read_events(&async_fd, cancel, handler).await;

            if let Err(error) = self.with_cmd_fd(disable_le_scan) {
                debug!(%error, "could not disable LE scan");
            }
            result
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            let fd = self
                .cmd_fd
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if fd.is_some() {
                debug!(dev_id = self.dev_id, "closed HCI device");
            }
            Ok(())
        })
    }
}
