//! Normalized sensor addresses.
//!
//! Bluetooth stacks disagree on how they print hardware addresses (upper or
//! lower case, stray whitespace from config files). Everything in this crate
//! compares addresses through [`PeripheralAddress`], which is always trimmed
//! and lower-cased.

use std::fmt;
use std::str::FromStr;

/// A sensor hardware address in normalized form (e.g. `"aa:bb:cc:dd:ee:ff"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    /// Normalize an address string: surrounding whitespace is removed and
    /// the result is lower-cased.
    ///
    /// # Example
    /// ```
    /// use ruuvitag_collector::PeripheralAddress;
    ///
    /// let address = PeripheralAddress::new("  CC:CA:7E:52:CC:34 ");
    /// assert_eq!(address.as_str(), "cc:ca:7e:52:cc:34");
    /// ```
    pub fn new(address: &str) -> Self {
        Self(address.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeripheralAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for PeripheralAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Build an address from the six bytes of a hardware address, most
/// significant byte first.
impl From<[u8; 6]> for PeripheralAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        ))
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for PeripheralAddress {
    fn from(addr: bluer::Address) -> Self {
        Self::from(addr.0)
    }
}
