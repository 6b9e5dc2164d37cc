//! The peripheral registry: which sensors to listen to and what to call them.
//!
//! Entries come from the command line or environment in the form
//! `ADDRESS=NAME`. An empty registry means "accept every sensor seen".

use crate::address::PeripheralAddress;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors returned while building a [`PeripheralRegistry`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("invalid peripheral entry '{0}': expected format ADDRESS=NAME")]
    InvalidPeripheralSpec(String),
}

/// Parse a single `ADDRESS=NAME` entry.
///
/// The address is trimmed and lower-cased, the name is trimmed.
///
/// # Example
/// ```
/// use ruuvitag_collector::registry::parse_peripheral;
///
/// let (address, name) = parse_peripheral("CC:CA:7E:52:CC:34=Backyard").unwrap();
/// assert_eq!(address.as_str(), "cc:ca:7e:52:cc:34");
/// assert_eq!(name, "Backyard");
/// ```
pub fn parse_peripheral(src: &str) -> Result<(PeripheralAddress, String), RegistryError> {
    src.split_once('=')
        .map(|(address, name)| (PeripheralAddress::new(address), name.trim().to_string()))
        .ok_or_else(|| RegistryError::InvalidPeripheralSpec(src.to_string()))
}

/// Read-only mapping from sensor address to human-readable name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeripheralRegistry {
    peripherals: BTreeMap<PeripheralAddress, String>,
}

impl PeripheralRegistry {
    /// Build a registry from `ADDRESS=NAME` entries.
    ///
    /// Fails on the first malformed entry. Later duplicates of an address
    /// override earlier ones.
    pub fn parse<I, S>(entries: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let peripherals = entries
            .into_iter()
            .map(|entry| parse_peripheral(entry.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { peripherals })
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    pub fn contains(&self, address: &PeripheralAddress) -> bool {
        self.peripherals.contains_key(address)
    }

    /// The configured name for `address`, if it is registered.
    pub fn name(&self, address: &PeripheralAddress) -> Option<&str> {
        self.peripherals.get(address).map(String::as_str)
    }

    /// Registered addresses, sorted.
    pub fn addresses(&self) -> impl Iterator<Item = &PeripheralAddress> {
        self.peripherals.keys()
    }
}

impl FromIterator<(PeripheralAddress, String)> for PeripheralRegistry {
    fn from_iter<T: IntoIterator<Item = (PeripheralAddress, String)>>(iter: T) -> Self {
        Self {
            peripherals: iter.into_iter().collect(),
        }
    }
}
