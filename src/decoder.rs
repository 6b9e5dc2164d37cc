//! Decoder for the RuuviTag RAWv1 (data format 3) advertisement payload.
//!
//! The payload is the complete manufacturer-specific data of an
//! advertisement, manufacturer id included. All multi-byte fields are
//! big-endian:
//!
//! | offset | size | field                                    |
//! |--------|------|------------------------------------------|
//! | 0      | 2    | manufacturer id, `0x99 0x04`             |
//! | 2      | 1    | data format, `0x03`                      |
//! | 3      | 1    | humidity, 0.5 % steps                    |
//! | 4      | 1    | temperature integer part, bit 7 = sign   |
//! | 5      | 1    | temperature hundredths                   |
//! | 6      | 2    | pressure, Pa minus 50000                 |
//! | 8      | 6    | acceleration X, Y, Z (signed)            |
//! | 14     | 2    | battery voltage, mV                      |
//!
//! See: https://github.com/ruuvi/ruuvi-sensor-protocols

use thiserror::Error;

/// Ruuvi Innovations manufacturer id as it appears on air (0x0499,
/// little-endian).
pub const RUUVI_MANUFACTURER_ID_BYTES: [u8; 2] = [0x99, 0x04];

/// Data format byte of the RAWv1 layout.
pub const RAWV1_FORMAT: u8 = 0x03;

/// Total length of a RAWv1 frame including the manufacturer id.
pub const RAWV1_FRAME_LEN: usize = 16;

const SIGNATURE_LEN: usize = 3;
const PRESSURE_OFFSET: u32 = 50_000;
const TEMPERATURE_SIGN: u8 = 0x80;

/// Error types for decoding RuuviTag frames.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The frame does not start with the RAWv1 signature
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// The signature matched but the frame is truncated
    #[error("Malformed frame: expected {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },
}

/// Physical values decoded from one frame.
///
/// Address, name and capture time are not part of the payload; the caller
/// attaches them when it builds a [`crate::Measurement`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Temperature in Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
    /// Pressure in hPa
    pub pressure: f64,
    /// Battery voltage in mV
    pub battery: u16,
    /// Acceleration (x, y, z), unscaled
    pub acceleration: (i16, i16, i16),
}

/// Returns `true` when `data` carries the RAWv1 signature.
///
/// Only the signature is checked; a truncated frame still returns `true`
/// and is rejected later by [`decode`].
#[inline]
pub fn is_supported(data: &[u8]) -> bool {
    data.len() >= SIGNATURE_LEN
        && data[..2] == RUUVI_MANUFACTURER_ID_BYTES
        && data[2] == RAWV1_FORMAT
}

/// Decode the sign-magnitude temperature encoding.
///
/// Bit 7 of `integer` is the sign, bits 0-6 the whole degrees, and
/// `fraction` the hundredths.
pub fn parse_temperature(integer: u8, fraction: u8) -> f64 {
    let magnitude = f64::from(integer & !TEMPERATURE_SIGN) + f64::from(fraction) / 100.0;
    if integer & TEMPERATURE_SIGN != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Decode a RAWv1 frame.
///
/// Bytes past [`RAWV1_FRAME_LEN`] are ignored.
///
/// # Example
/// ```
/// use ruuvitag_collector::decoder::decode;
///
/// let frame = [
///     0x99, 0x04, 0x03, 0x5A, 0x16, 0x0A, 0xC4, 0x18,
///     0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0A, 0xC3,
/// ];
/// let reading = decode(&frame).unwrap();
/// assert_eq!(reading.humidity, 45.0);
/// assert_eq!(reading.pressure, 1002.0);
/// assert_eq!(reading.battery, 2755);
/// ```
pub fn decode(data: &[u8]) -> Result<Reading, DecodeError> {
    if !is_supported(data) {
        return Err(DecodeError::UnsupportedFormat(describe_header(data)));
    }
    if data.len() < RAWV1_FRAME_LEN {
        return Err(DecodeError::Malformed {
            expected: RAWV1_FRAME_LEN,
            actual: data.len(),
        });
    }

    let u16_at = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
    let i16_at = |i: usize| i16::from_be_bytes([data[i], data[i + 1]]);

    Ok(Reading {
        humidity: f64::from(data[3]) / 2.0,
        temperature: parse_temperature(data[4], data[5]),
        pressure: f64::from(u32::from(u16_at(6)) + PRESSURE_OFFSET) / 100.0,
        acceleration: (i16_at(8), i16_at(10), i16_at(12)),
        battery: u16_at(14),
    })
}

fn describe_header(data: &[u8]) -> String {
    let header: String = data
        .iter()
        .take(SIGNATURE_LEN)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("header {header:?} is not RuuviTag RAWv1 ({} bytes)", data.len())
}
