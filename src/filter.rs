//! Advertisement acceptance.
//!
//! Decoding an unrelated advertisement under the RAWv1 layout silently
//! produces garbage values, so every frame passes through [`accepts`]
//! before it reaches the decoder.

use crate::address::PeripheralAddress;
use crate::decoder;
use crate::registry::PeripheralRegistry;

/// Decide whether a frame from `address` should be decoded.
///
/// Frames without the RAWv1 signature are always rejected. With an empty
/// registry every other frame is accepted; otherwise only registered
/// addresses are.
pub fn accepts(address: &PeripheralAddress, frame: &[u8], registry: &PeripheralRegistry) -> bool {
    if !decoder::is_supported(frame) {
        return false;
    }
    registry.is_empty() || registry.contains(address)
}
